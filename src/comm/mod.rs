//! Transport seam.
//!
//! Provides [`InboundEvent`] -- the normalized envelope every transport
//! (Discord, console, ...) produces -- and the capability-tagged
//! [`Transport`] trait used for outbound delivery.  Transports register
//! with a [`TransportRegistry`]; optional capabilities (typing indicator,
//! reactions) are recorded once at registration and the registry skips
//! calls a transport cannot serve.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

// ---------------------------------------------------------------------------
// Conversation key
// ---------------------------------------------------------------------------

/// Stable identifier for one conversation:
/// `agent:{agent_id}:{platform}:{dm|group}:{chat_id}`.
///
/// Treated as opaque by the queue, scheduler and approval broker; only
/// the helpers here know its layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationKey(String);

impl ConversationKey {
    pub fn new(agent_id: &str, platform: &str, is_group: bool, chat_id: &str) -> Self {
        let kind = if is_group { "group" } else { "dm" };
        Self(format!("agent:{agent_id}:{platform}:{kind}:{chat_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Platform segment, when the key follows the standard layout.
    pub fn platform(&self) -> Option<&str> {
        let mut parts = self.0.split(':');
        match (parts.next(), parts.next(), parts.next()) {
            (Some("agent"), Some(_), Some(platform)) => Some(platform),
            _ => None,
        }
    }

    /// Chat id segment (everything after the dm/group marker).
    pub fn chat_id(&self) -> Option<&str> {
        let mut parts = self.0.splitn(5, ':');
        match (parts.next(), parts.nth(3)) {
            (Some("agent"), Some(chat)) => Some(chat),
            _ => None,
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ConversationKey {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConversationKey {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Envelopes
// ---------------------------------------------------------------------------

/// Where an outbound message goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTarget {
    pub platform: String,
    pub chat_id: String,
}

impl ChatTarget {
    pub fn new(platform: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            platform: platform.into(),
            chat_id: chat_id.into(),
        }
    }
}

/// An inline image attached to an inbound turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagePayload {
    /// Base64-encoded bytes.
    pub data: String,
    /// MIME type, e.g. `image/png`.
    pub media_type: String,
}

/// A transport-agnostic inbound message, already filtered by the
/// transport's access policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEvent {
    pub conversation_key: ConversationKey,
    pub platform: String,
    pub chat_id: String,
    pub sender_id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<ImagePayload>,
    pub is_group: bool,
    /// Platform message id, used for reactions.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_ref: Option<String>,
}

impl InboundEvent {
    pub fn target(&self) -> ChatTarget {
        ChatTarget::new(&self.platform, &self.chat_id)
    }
}

// ---------------------------------------------------------------------------
// Access policy
// ---------------------------------------------------------------------------

/// Allowlist filter applied by transports before emitting events.
///
/// `"*"` in either list allows every chat of that kind.  Group chats can
/// additionally require an explicit mention of the bot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AccessPolicy {
    #[serde(default)]
    pub allowed_dms: Vec<String>,
    #[serde(default)]
    pub allowed_groups: Vec<String>,
    #[serde(default)]
    pub respond_to_mentions_only: bool,
}

impl AccessPolicy {
    pub fn should_respond(&self, is_group: bool, chat_id: &str, sender_id: &str, mentioned: bool) -> bool {
        if is_group {
            if !allows(&self.allowed_groups, chat_id) {
                return false;
            }
            !self.respond_to_mentions_only || mentioned
        } else {
            allows(&self.allowed_dms, sender_id) || allows(&self.allowed_dms, chat_id)
        }
    }
}

fn allows(list: &[String], id: &str) -> bool {
    list.iter().any(|entry| entry == "*" || entry == id)
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// Split `text` into chunks of at most `limit` bytes, preferring to cut
/// at the last newline inside each window.  Never splits a UTF-8 char.
pub fn chunk_text(text: &str, limit: usize) -> Vec<String> {
    if limit == 0 || text.len() <= limit {
        return vec![text.to_string()];
    }
    let mut chunks = Vec::new();
    let mut rest = text;
    while rest.len() > limit {
        let mut end = limit;
        while end > 0 && !rest.is_char_boundary(end) {
            end -= 1;
        }
        if end == 0 {
            // A single char wider than the limit goes out on its own.
            end = rest.chars().next().map(char::len_utf8).unwrap_or(rest.len());
        }
        let cut = match rest[..end].rfind('\n') {
            Some(nl) if nl > 0 => nl,
            _ => end,
        };
        chunks.push(rest[..cut].to_string());
        rest = rest[cut..].strip_prefix('\n').unwrap_or(&rest[cut..]);
    }
    if !rest.is_empty() {
        chunks.push(rest.to_string());
    }
    chunks
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Optional capabilities a transport can advertise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub typing: bool,
    pub reactions: bool,
}

/// Outbound side of a chat platform.
///
/// `send_message` is the base capability.  The typing and reaction
/// methods are only invoked when [`Transport::capabilities`] advertises
/// them at registration time.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Platform name used in [`ChatTarget::platform`] (e.g. `"discord"`).
    fn platform(&self) -> &str;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Deliver `text` to `chat_id`, chunking at the platform's limit.
    async fn send_message(&self, chat_id: &str, text: &str) -> anyhow::Result<()>;

    async fn send_typing(&self, _chat_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop_typing(&self, _chat_id: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn react(&self, _chat_id: &str, _message_ref: &str, _emoji: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

struct Registered {
    transport: Arc<dyn Transport>,
    caps: Capabilities,
}

/// Owned registry of active transports, keyed by platform name.
#[derive(Clone, Default)]
pub struct TransportRegistry {
    inner: Arc<RwLock<HashMap<String, Registered>>>,
}

impl TransportRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a transport, replacing any previous one for the same
    /// platform.  Capabilities are captured here and not re-queried.
    pub async fn register(&self, transport: Arc<dyn Transport>) {
        let platform = transport.platform().to_string();
        let caps = transport.capabilities();
        info!(platform = %platform, typing = caps.typing, reactions = caps.reactions, "transport registered");
        self.inner
            .write()
            .await
            .insert(platform, Registered { transport, caps });
    }

    pub async fn get(&self, platform: &str) -> Option<Arc<dyn Transport>> {
        self.inner
            .read()
            .await
            .get(platform)
            .map(|r| Arc::clone(&r.transport))
    }

    pub async fn capabilities(&self, platform: &str) -> Option<Capabilities> {
        self.inner.read().await.get(platform).map(|r| r.caps)
    }

    /// Registered platforms, sorted.
    pub async fn platforms(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Send through the target's transport.
    pub async fn send(&self, target: &ChatTarget, text: &str) -> anyhow::Result<()> {
        let transport = self
            .get(&target.platform)
            .await
            .ok_or_else(|| anyhow!("no transport registered for platform '{}'", target.platform))?;
        transport.send_message(&target.chat_id, text).await
    }

    /// Best-effort typing indicator; failures are logged at debug and dropped.
    pub async fn send_typing(&self, target: &ChatTarget) {
        if let Some(t) = self.with_capability(&target.platform, |c| c.typing).await {
            if let Err(e) = t.send_typing(&target.chat_id).await {
                debug!(platform = %target.platform, error = %e, "send_typing failed");
            }
        }
    }

    pub async fn stop_typing(&self, target: &ChatTarget) {
        if let Some(t) = self.with_capability(&target.platform, |c| c.typing).await {
            if let Err(e) = t.stop_typing(&target.chat_id).await {
                debug!(platform = %target.platform, error = %e, "stop_typing failed");
            }
        }
    }

    /// Best-effort reaction on a specific inbound message.
    pub async fn react(&self, target: &ChatTarget, message_ref: &str, emoji: &str) {
        if let Some(t) = self.with_capability(&target.platform, |c| c.reactions).await {
            if let Err(e) = t.react(&target.chat_id, message_ref, emoji).await {
                debug!(platform = %target.platform, error = %e, "react failed");
            }
        }
    }

    async fn with_capability(
        &self,
        platform: &str,
        check: impl Fn(&Capabilities) -> bool,
    ) -> Option<Arc<dyn Transport>> {
        let map = self.inner.read().await;
        map.get(platform)
            .filter(|r| check(&r.caps))
            .map(|r| Arc::clone(&r.transport))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn conversation_key_layout() {
        let key = ConversationKey::new("main", "discord", true, "1234");
        assert_eq!(key.as_str(), "agent:main:discord:group:1234");
        assert_eq!(key.platform(), Some("discord"));
        assert_eq!(key.chat_id(), Some("1234"));

        let opaque = ConversationKey::from("cron:job_1");
        assert_eq!(opaque.platform(), None);
        assert_eq!(opaque.chat_id(), None);
    }

    #[test]
    fn chat_id_may_contain_colons() {
        let key = ConversationKey::new("main", "console", false, "local:tty");
        assert_eq!(key.chat_id(), Some("local:tty"));
    }

    #[test]
    fn access_policy_rules() {
        let policy = AccessPolicy {
            allowed_dms: vec!["42".into()],
            allowed_groups: vec!["*".into()],
            respond_to_mentions_only: true,
        };
        assert!(policy.should_respond(false, "dm-chan", "42", false));
        assert!(!policy.should_respond(false, "dm-chan", "7", false));
        assert!(policy.should_respond(true, "g1", "7", true));
        assert!(!policy.should_respond(true, "g1", "7", false));

        let closed = AccessPolicy::default();
        assert!(!closed.should_respond(false, "c", "42", true));
        assert!(!closed.should_respond(true, "c", "42", true));
    }

    #[test]
    fn chunk_text_prefers_newlines() {
        let text = "aaaa\nbbbb\ncccc";
        let chunks = chunk_text(text, 9);
        assert_eq!(chunks, vec!["aaaa", "bbbb\ncccc"]);
        assert_eq!(chunk_text("short", 100), vec!["short"]);
    }

    #[test]
    fn chunk_text_hard_splits_long_lines() {
        let text = "x".repeat(25);
        let chunks = chunk_text(&text, 10);
        assert_eq!(chunks.len(), 3);
        assert!(chunks.iter().all(|c| c.len() <= 10));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn chunk_text_limit_narrower_than_a_char() {
        assert_eq!(chunk_text("éa", 1), vec!["é", "a"]);
        assert_eq!(chunk_text("🦀🦀", 2), vec!["🦀", "🦀"]);
    }

    struct PlainTransport {
        typed: Mutex<u32>,
    }

    #[async_trait]
    impl Transport for PlainTransport {
        fn platform(&self) -> &str {
            "plain"
        }
        async fn send_message(&self, _chat_id: &str, _text: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn send_typing(&self, _chat_id: &str) -> anyhow::Result<()> {
            *self.typed.lock().unwrap() += 1;
            Ok(())
        }
    }

    #[tokio::test]
    async fn registry_skips_unadvertised_capabilities() {
        let registry = TransportRegistry::new();
        let t = Arc::new(PlainTransport { typed: Mutex::new(0) });
        registry.register(t.clone()).await;

        registry.send_typing(&ChatTarget::new("plain", "c")).await;
        assert_eq!(*t.typed.lock().unwrap(), 0);
        assert_eq!(registry.platforms().await, vec!["plain".to_string()]);
        assert!(registry.send(&ChatTarget::new("missing", "c"), "hi").await.is_err());
    }
}
