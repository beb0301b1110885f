//! Conversation transcripts.
//!
//! Each conversation key maps to one `transcripts/<key>.jsonl` file with
//! one [`Exchange`] per line.  `/new` archives the current file so the
//! backend starts from an empty history.

use std::path::{Path, PathBuf};

use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::comm::ConversationKey;

// ── Exchange ─────────────────────────────────────────────────

/// A single message, serialised as a line in a transcript file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exchange {
    /// Unix-epoch timestamp in milliseconds.
    pub timestamp: u64,
    /// `"user"` or `"assistant"`.
    pub role: String,
    pub content: String,
    /// Optional extra metadata (sender, run id, tool names …).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

impl Exchange {
    pub fn new(role: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            timestamp: crate::utils::now_millis(),
            role: role.into(),
            content: content.into(),
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

// ── TranscriptStore ──────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TranscriptStore {
    dir: PathBuf,
}

impl TranscriptStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Default location: `<clawd_home>/transcripts`.
    pub fn default_dir() -> PathBuf {
        crate::clawd_home().join("transcripts")
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn file_for(&self, key: &ConversationKey) -> PathBuf {
        self.dir
            .join(format!("{}.jsonl", crate::utils::sanitize_file_stem(key.as_str())))
    }

    /// Append one exchange, creating the directory and file as needed.
    pub async fn append(&self, key: &ConversationKey, exchange: &Exchange) -> anyhow::Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .context("create transcripts dir")?;

        let path = self.file_for(key);
        let line = serde_json::to_string(exchange).context("serialize Exchange")?;

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("open transcript {}", path.display()))?;

        file.write_all(line.as_bytes()).await?;
        file.write_all(b"\n").await?;

        debug!(path = %path.display(), role = %exchange.role, "exchange appended");
        Ok(())
    }

    /// Load up to `limit` most-recent exchanges.  Missing files yield an
    /// empty history; malformed lines are skipped.
    pub async fn load_recent(&self, key: &ConversationKey, limit: usize) -> anyhow::Result<Vec<Exchange>> {
        let path = self.file_for(key);
        let content = match fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e).with_context(|| format!("read {}", path.display())),
        };

        let mut exchanges: Vec<Exchange> = content
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .filter_map(|l| match serde_json::from_str::<Exchange>(l) {
                Ok(ex) => Some(ex),
                Err(e) => {
                    debug!(error = %e, "skipping malformed transcript line");
                    None
                }
            })
            .collect();

        if exchanges.len() > limit {
            exchanges = exchanges.split_off(exchanges.len() - limit);
        }
        Ok(exchanges)
    }

    /// Archive the current transcript as `<name>.<unix ms>.jsonl`.
    /// Returns `false` when there was nothing to archive.
    pub async fn reset(&self, key: &ConversationKey) -> anyhow::Result<bool> {
        let path = self.file_for(key);
        if fs::metadata(&path).await.is_err() {
            return Ok(false);
        }
        let archived = self.dir.join(format!(
            "{}.{}.jsonl",
            crate::utils::sanitize_file_stem(key.as_str()),
            crate::utils::now_millis()
        ));
        fs::rename(&path, &archived)
            .await
            .with_context(|| format!("archive {}", path.display()))?;
        debug!(from = %path.display(), to = %archived.display(), "transcript archived");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn append_and_load_recent() {
        let tmp = TempDir::new().unwrap();
        let store = TranscriptStore::new(tmp.path());
        let key = ConversationKey::new("main", "console", false, "local");

        for i in 0..5 {
            store.append(&key, &Exchange::new("user", format!("m{i}"))).await.unwrap();
        }
        let recent = store.load_recent(&key, 2).await.unwrap();
        let contents: Vec<&str> = recent.iter().map(|e| e.content.as_str()).collect();
        assert_eq!(contents, vec!["m3", "m4"]);
    }

    #[tokio::test]
    async fn missing_transcript_is_empty() {
        let tmp = TempDir::new().unwrap();
        let store = TranscriptStore::new(tmp.path().join("none"));
        let key = ConversationKey::from("k");
        assert!(store.load_recent(&key, 10).await.unwrap().is_empty());
        assert!(!store.reset(&key).await.unwrap());
    }

    #[tokio::test]
    async fn reset_archives_and_clears_history() {
        let tmp = TempDir::new().unwrap();
        let store = TranscriptStore::new(tmp.path());
        let key = ConversationKey::from("k");
        store.append(&key, &Exchange::new("user", "hello")).await.unwrap();

        assert!(store.reset(&key).await.unwrap());
        assert!(store.load_recent(&key, 10).await.unwrap().is_empty());

        let archived = std::fs::read_dir(tmp.path()).unwrap().count();
        assert_eq!(archived, 1);
    }
}
