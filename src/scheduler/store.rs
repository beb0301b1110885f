//! Durable job store: a single pretty-printed JSON array on disk.
//!
//! The whole set is rewritten on every mutation (temp file + rename) so
//! a crash mid-write never leaves a truncated file behind.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::{debug, warn};

use super::Job;

#[derive(Debug, Clone)]
pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Default location: `<clawd_home>/jobs.json`.
    pub fn default_path() -> PathBuf {
        crate::clawd_home().join("jobs.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load every persisted job.  A missing file is an empty set; an
    /// unreadable or corrupt file is logged and treated as empty.
    pub async fn load(&self) -> Vec<Job> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "failed to read job store");
                return Vec::new();
            }
        };
        if contents.trim().is_empty() {
            return Vec::new();
        }
        match serde_json::from_str::<Vec<Job>>(&contents) {
            Ok(jobs) => {
                debug!(path = %self.path.display(), count = jobs.len(), "job store loaded");
                jobs
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "job store is corrupt, starting empty");
                Vec::new()
            }
        }
    }

    /// Replace the persisted set with `jobs`.
    pub async fn save(&self, jobs: &[Job]) -> anyhow::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create {}", parent.display()))?;
            }
        }

        let json = serde_json::to_string_pretty(jobs).context("failed to serialize jobs")?;
        let mut tmp_name = self.path.as_os_str().to_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), count = jobs.len(), "job store saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::ChatTarget;
    use crate::scheduler::JobSchedule;
    use chrono::Utc;
    use tempfile::TempDir;

    fn job(id: &str) -> Job {
        Job {
            id: id.into(),
            schedule: JobSchedule::Recurring { interval_secs: 30 },
            conversation_key: None,
            target: ChatTarget::new("console", "local"),
            message: "ping".into(),
            description: "Every 30s".into(),
            invoke_backend: false,
            created_at: Utc::now(),
            last_run: None,
            run_count: 0,
        }
    }

    #[tokio::test]
    async fn missing_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let store = JobStore::new(tmp.path().join("jobs.json"));
        assert!(store.load().await.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_keeps_order() {
        let tmp = TempDir::new().unwrap();
        let store = JobStore::new(tmp.path().join("nested/jobs.json"));
        store.save(&[job("a"), job("b")]).await.unwrap();

        let loaded = store.load().await;
        let ids: Vec<&str> = loaded.iter().map(|j| j.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert!(!tmp.path().join("nested/jobs.json.tmp").exists());
    }

    #[tokio::test]
    async fn corrupt_file_loads_empty() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("jobs.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(JobStore::new(path).load().await.is_empty());
    }

    #[tokio::test]
    async fn file_format_is_tagged_array() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("jobs.json");
        JobStore::new(&path).save(&[job("a")]).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert!(raw.is_array());
        assert_eq!(raw[0]["kind"], "recurring");
        assert_eq!(raw[0]["interval_secs"], 30);
        assert_eq!(raw[0]["target"]["platform"], "console");
    }
}
