use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::comm::AccessPolicy;

/// A reference to a secret value.
///
/// Supports two YAML forms:
///   - Plain string:   `token: $DISCORD_TOKEN` (or a literal value)
///   - Pointer object: `token: { key: "DISCORD_TOKEN", source: "env" }`
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum SecretRef {
    Plain(String),
    Pointer { key: String, source: String },
}

impl SecretRef {
    /// Resolve to the secret value.  Unset variables and unknown sources
    /// resolve to `None`.
    pub fn resolve(&self) -> Option<String> {
        let value = match self {
            SecretRef::Plain(s) => match s.strip_prefix('$') {
                Some(var) if !var.is_empty() => std::env::var(var).ok(),
                _ => Some(s.clone()),
            },
            SecretRef::Pointer { key, source } => match source.as_str() {
                "env" => std::env::var(key).ok(),
                other => {
                    tracing::warn!(source = other, key = %key, "unsupported secret source");
                    None
                }
            },
        };
        value.filter(|v| !v.is_empty())
    }
}

fn default_agent_id() -> String {
    "main".to_string()
}

fn default_true() -> bool {
    true
}

/// Top-level configuration loaded from `config.yaml`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Agent identifier baked into every conversation key.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub approval: ApprovalConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub transcripts: TranscriptsConfig,
    /// Chat platform settings.
    #[serde(default)]
    pub channels: ChannelsConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            queue: QueueConfig::default(),
            approval: ApprovalConfig::default(),
            scheduler: SchedulerConfig::default(),
            backend: BackendConfig::default(),
            transcripts: TranscriptsConfig::default(),
            channels: ChannelsConfig::default(),
            gateway: GatewayConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct QueueConfig {
    /// Seconds a drained conversation queue is kept before teardown.
    #[serde(default = "default_idle_grace_secs")]
    pub idle_grace_secs: u64,
}

fn default_idle_grace_secs() -> u64 {
    crate::queue::DEFAULT_IDLE_GRACE.as_secs()
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            idle_grace_secs: default_idle_grace_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ApprovalConfig {
    /// Seconds to wait for a reply before treating it as "no".
    #[serde(default = "default_approval_timeout_secs")]
    pub timeout_secs: u64,
    /// Tool names that need an explicit yes before they run.
    #[serde(default)]
    pub require_for: Vec<String>,
}

fn default_approval_timeout_secs() -> u64 {
    crate::approval::DEFAULT_APPROVAL_TIMEOUT.as_secs()
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_approval_timeout_secs(),
            require_for: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Job file path.  Default: `<home>/jobs.json`.
    #[serde(default)]
    pub jobs_file: Option<String>,
    /// IANA timezone for cron evaluation (e.g. `Europe/Lisbon`).
    /// Default: the host's local time.
    #[serde(default)]
    pub timezone: Option<String>,
}

impl SchedulerConfig {
    pub fn timezone(&self) -> anyhow::Result<Option<Tz>> {
        self.timezone
            .as_deref()
            .map(|name| {
                name.parse::<Tz>()
                    .map_err(|e| anyhow::anyhow!("config: unknown timezone '{name}': {e}"))
            })
            .transpose()
    }

    pub fn jobs_path(&self) -> PathBuf {
        self.jobs_file
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(crate::scheduler::JobStore::default_path)
    }
}

/// AI backend selection.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct BackendConfig {
    /// `"openai-compat"` or `"echo"`.
    #[serde(default = "default_backend_kind")]
    pub kind: String,
    /// Chat completions URL.
    #[serde(default)]
    pub endpoint: Option<String>,
    /// API key (plain text or env-var reference like `$OPENAI_API_KEY`).
    #[serde(default)]
    pub api_key: Option<SecretRef>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub system_prompt: Option<String>,
    /// Transcript turns replayed to the backend on each run.
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
    #[serde(default = "default_max_tool_iterations")]
    pub max_tool_iterations: usize,
}

fn default_backend_kind() -> String {
    "echo".to_string()
}

fn default_history_limit() -> usize {
    crate::coordinator::DEFAULT_HISTORY_LIMIT
}

fn default_max_tool_iterations() -> usize {
    crate::backend::openai_compat::DEFAULT_MAX_TOOL_ITERATIONS
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: default_backend_kind(),
            endpoint: None,
            api_key: None,
            model: None,
            system_prompt: None,
            history_limit: default_history_limit(),
            max_tool_iterations: default_max_tool_iterations(),
        }
    }
}

impl BackendConfig {
    pub fn resolved_api_key(&self) -> Option<String> {
        self.api_key.as_ref().and_then(SecretRef::resolve)
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct TranscriptsConfig {
    /// Transcript directory.  Default: `<home>/transcripts`.
    #[serde(default)]
    pub dir: Option<String>,
}

impl TranscriptsConfig {
    pub fn dir(&self) -> PathBuf {
        self.dir
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(crate::session::TranscriptStore::default_dir)
    }
}

/// Channel connector settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelsConfig {
    /// Discord bot configuration. Optional so the daemon can start without it.
    #[serde(default)]
    pub discord: Option<DiscordConfig>,
}

/// Discord-specific channel config.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct DiscordConfig {
    /// Bot token: plain string, env-var ref, or secret pointer.
    pub token: SecretRef,
    /// Which chats the bot answers in.
    #[serde(default)]
    pub access: AccessPolicy,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_gateway_addr")]
    pub addr: String,
}

fn default_gateway_addr() -> String {
    "127.0.0.1:4096".to_string()
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            addr: default_gateway_addr(),
        }
    }
}

impl GatewayConfig {
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        self.addr
            .parse()
            .with_context(|| format!("config: invalid gateway addr '{}'", self.addr))
    }
}

impl Config {
    /// Read and parse a YAML configuration file.
    ///
    /// A missing file falls back to `<path>.bak`, then (for a relative
    /// `config.yaml`) to the same names under the clawd home.
    pub async fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = Self::read_with_fallbacks(path).await?;
        let config: Config = serde_yaml_ng::from_str(&contents).context("failed to parse config YAML")?;
        config.validate()?;

        tracing::debug!(
            agent = %config.agent_id,
            backend = %config.backend.kind,
            discord = config.channels.discord.is_some(),
            "configuration loaded"
        );
        Ok(config)
    }

    async fn read_with_fallbacks(path: &Path) -> anyhow::Result<String> {
        let err = match tokio::fs::read_to_string(path).await {
            Ok(c) => return Ok(c),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => e,
            Err(e) => {
                return Err(e).with_context(|| format!("failed to read config file: {}", path.display()));
            }
        };

        let mut candidates = vec![with_bak(path)];
        let filename = path.file_name().and_then(|f| f.to_str());
        if filename == Some("config.yaml") && path.is_relative() {
            let home = crate::clawd_home().join("config.yaml");
            candidates.push(with_bak(&home));
            candidates.insert(1, home);
        }

        for candidate in candidates {
            if let Ok(c) = tokio::fs::read_to_string(&candidate).await {
                tracing::warn!(
                    attempted = %path.display(),
                    found = %candidate.display(),
                    "config file not found, using fallback"
                );
                return Ok(c);
            }
        }
        Err(err).with_context(|| format!("failed to read config file: {}", path.display()))
    }

    /// Validate semantic constraints that serde cannot enforce.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.agent_id.trim().is_empty() || self.agent_id.contains(':') {
            anyhow::bail!("config: agent_id must be non-empty and must not contain ':'");
        }
        if self.queue.idle_grace_secs == 0 {
            anyhow::bail!("config: queue.idle_grace_secs must be positive");
        }
        if self.approval.timeout_secs == 0 {
            anyhow::bail!("config: approval.timeout_secs must be positive");
        }

        let known: Vec<String> = crate::tools::Toolbox::catalogue().into_iter().map(|t| t.name).collect();
        for tool in &self.approval.require_for {
            if !known.contains(tool) {
                anyhow::bail!("config: approval.require_for references unknown tool '{tool}'");
            }
        }

        self.scheduler.timezone()?;

        match self.backend.kind.as_str() {
            "echo" => {}
            "openai-compat" | "openai" => {
                if self.backend.max_tool_iterations == 0 {
                    anyhow::bail!("config: backend.max_tool_iterations must be positive");
                }
            }
            other => anyhow::bail!("config: unknown backend kind '{other}'"),
        }

        if self.gateway.enabled {
            self.gateway.socket_addr()?;
        }
        Ok(())
    }

    pub fn idle_grace(&self) -> Duration {
        Duration::from_secs(self.queue.idle_grace_secs)
    }

    pub fn approval_timeout(&self) -> Duration {
        Duration::from_secs(self.approval.timeout_secs)
    }

    /// Serialize and write the configuration back to a YAML file.
    pub async fn save(&self, path: &Path) -> anyhow::Result<()> {
        let contents = serde_yaml_ng::to_string(self).context("serialize config YAML")?;
        tokio::fs::write(path, &contents)
            .await
            .with_context(|| format!("failed to write config file: {}", path.display()))?;
        tracing::debug!(path = %path.display(), "configuration saved");
        Ok(())
    }
}

fn with_bak(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".bak");
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let cfg: Config = serde_yaml_ng::from_str("{}").unwrap();
        assert_eq!(cfg.agent_id, "main");
        assert_eq!(cfg.queue.idle_grace_secs, 60);
        assert_eq!(cfg.approval.timeout_secs, 120);
        assert_eq!(cfg.backend.kind, "echo");
        assert!(cfg.gateway.enabled);
        cfg.validate().unwrap();
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_yaml_ng::from_str::<Config>("bogus: 1").is_err());
        assert!(serde_yaml_ng::from_str::<Config>("queue: { idle: 3 }").is_err());
    }

    #[test]
    fn secret_refs_resolve() {
        std::env::set_var("CLAWD_TEST_SECRET_REF", "s3cret");
        assert_eq!(
            SecretRef::Plain("$CLAWD_TEST_SECRET_REF".into()).resolve().as_deref(),
            Some("s3cret")
        );
        assert_eq!(SecretRef::Plain("literal".into()).resolve().as_deref(), Some("literal"));
        assert_eq!(
            SecretRef::Pointer { key: "CLAWD_TEST_SECRET_REF".into(), source: "env".into() }
                .resolve()
                .as_deref(),
            Some("s3cret")
        );
        assert!(SecretRef::Plain("$CLAWD_TEST_SECRET_UNSET".into()).resolve().is_none());
        assert!(SecretRef::Pointer { key: "x".into(), source: "vault".into() }.resolve().is_none());
    }

    #[test]
    fn validate_rejects_bad_values() {
        let cfg = Config::default();
        cfg.validate().unwrap();

        let mut bad = cfg.clone();
        bad.approval.require_for = vec!["rm_rf".into()];
        assert!(bad.validate().is_err());

        let mut bad = cfg.clone();
        bad.scheduler.timezone = Some("Mars/Olympus".into());
        assert!(bad.validate().is_err());

        let mut bad = cfg.clone();
        bad.backend.kind = "telepathy".into();
        assert!(bad.validate().is_err());

        let mut bad = cfg;
        bad.agent_id = "a:b".into();
        assert!(bad.validate().is_err());
    }
}
