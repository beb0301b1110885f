//! Discord transport.
//!
//! Inbound guild and DM messages are filtered through the configured
//! [`AccessPolicy`], normalised into [`InboundEvent`]s and handed to the
//! coordinator.  Outbound messages are chunked at Discord's 2000-char
//! limit.  Typing indicators and reactions are supported.

use std::sync::{Arc, OnceLock};

use anyhow::{anyhow, Context as AnyhowContext};
use async_trait::async_trait;
use base64::Engine as _;
use serenity::async_trait as serenity_async_trait;
use serenity::client::{Client, Context, EventHandler};
use serenity::http::Http;
use serenity::model::channel::{Attachment, Message, ReactionType};
use serenity::model::gateway::{GatewayIntents, Ready};
use serenity::model::id::{ChannelId, MessageId, UserId};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::comm::{self, AccessPolicy, Capabilities, ImagePayload, InboundEvent, Transport};
use crate::config::DiscordConfig;
use crate::coordinator::RunCoordinator;

pub const PLATFORM: &str = "discord";

/// Discord's per-message character limit.
pub const MESSAGE_LIMIT: usize = 2000;

/// Largest image attachment forwarded to the backend (8 MiB, Discord's
/// default upload limit).
const MAX_ATTACHMENT_BYTES: u32 = 8 * 1024 * 1024;

// ── Outbound ─────────────────────────────────────────────────

/// Outbound side, backed by a shared HTTP client.
pub struct DiscordTransport {
    http: Arc<Http>,
}

impl DiscordTransport {
    pub fn new(http: Arc<Http>) -> Self {
        Self { http }
    }
}

fn channel_id(chat_id: &str) -> anyhow::Result<ChannelId> {
    let id: u64 = chat_id
        .parse()
        .with_context(|| format!("invalid channel id: {chat_id}"))?;
    if id == 0 {
        anyhow::bail!("invalid channel id: {chat_id}");
    }
    Ok(ChannelId::new(id))
}

#[async_trait]
impl Transport for DiscordTransport {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            typing: true,
            reactions: true,
        }
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let ch = channel_id(chat_id)?;
        for chunk in comm::chunk_text(text, MESSAGE_LIMIT) {
            if chunk.trim().is_empty() {
                continue;
            }
            ch.say(&self.http, chunk)
                .await
                .map_err(|e| anyhow!("discord send error: {e:?}"))?;
        }
        Ok(())
    }

    async fn send_typing(&self, chat_id: &str) -> anyhow::Result<()> {
        channel_id(chat_id)?
            .broadcast_typing(&self.http)
            .await
            .map_err(|e| anyhow!("discord typing error: {e:?}"))
    }

    async fn react(&self, chat_id: &str, message_ref: &str, emoji: &str) -> anyhow::Result<()> {
        let message: u64 = message_ref
            .parse()
            .with_context(|| format!("invalid message id: {message_ref}"))?;
        channel_id(chat_id)?
            .create_reaction(&self.http, MessageId::new(message), ReactionType::Unicode(emoji.to_string()))
            .await
            .map_err(|e| anyhow!("discord reaction error: {e:?}"))
    }
}

// ── Inbound ──────────────────────────────────────────────────

struct Handler {
    coordinator: RunCoordinator,
    policy: AccessPolicy,
    bot_id: OnceLock<UserId>,
    downloads: reqwest::Client,
}

/// Remove `<@id>` / `<@!id>` mentions of the bot from `content`.
fn strip_mention(content: &str, bot_id: Option<u64>) -> String {
    let Some(id) = bot_id else {
        return content.trim().to_string();
    };
    content
        .replace(&format!("<@{id}>"), "")
        .replace(&format!("<@!{id}>"), "")
        .trim()
        .to_string()
}

impl Handler {
    async fn download_image(&self, attachment: &Attachment) -> anyhow::Result<ImagePayload> {
        let media_type = attachment
            .content_type
            .clone()
            .unwrap_or_else(|| "image/png".to_string());
        let bytes = self
            .downloads
            .get(&attachment.url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        Ok(ImagePayload {
            data: base64::engine::general_purpose::STANDARD.encode(&bytes),
            media_type,
        })
    }

    async fn first_image(&self, msg: &Message) -> Option<ImagePayload> {
        let attachment = msg.attachments.iter().find(|a| {
            a.content_type.as_deref().is_some_and(|t| t.starts_with("image/")) && a.size <= MAX_ATTACHMENT_BYTES
        })?;
        match self.download_image(attachment).await {
            Ok(image) => Some(image),
            Err(e) => {
                warn!(error = %e, url = %attachment.url, "failed to download discord attachment");
                None
            }
        }
    }
}

#[serenity_async_trait]
impl EventHandler for Handler {
    async fn ready(&self, _ctx: Context, ready: Ready) {
        let _ = self.bot_id.set(ready.user.id);
        info!(user = %ready.user.name, "discord bot connected");
    }

    async fn message(&self, _ctx: Context, msg: Message) {
        // Ignore messages from bots (including ourselves).
        if msg.author.bot {
            return;
        }

        let bot_id = self.bot_id.get().copied();
        let is_group = msg.guild_id.is_some();
        let chat_id = msg.channel_id.to_string();
        let sender_id = msg.author.id.to_string();
        let mentioned = bot_id.is_some_and(|id| msg.mentions.iter().any(|u| u.id == id));

        if !self.policy.should_respond(is_group, &chat_id, &sender_id, mentioned) {
            debug!(channel_id = %chat_id, sender = %sender_id, group = is_group, "discord message filtered by access policy");
            return;
        }

        let text = strip_mention(&msg.content, bot_id.map(|id| id.get()));
        let image = self.first_image(&msg).await;
        if text.is_empty() && image.is_none() {
            return;
        }

        debug!(
            author = %msg.author.name,
            channel_id = %chat_id,
            content_len = text.len(),
            "discord message received"
        );

        let event = InboundEvent {
            conversation_key: self.coordinator.conversation_key(PLATFORM, is_group, &chat_id),
            platform: PLATFORM.to_string(),
            chat_id,
            sender_id,
            text,
            image,
            is_group,
            message_ref: Some(msg.id.to_string()),
        };
        self.coordinator.dispatch(event);
    }
}

/// Register the Discord transport and spawn the gateway client.
///
/// Fails when the token cannot be resolved.  Connection errors after
/// startup are logged by the background task.
pub async fn start(cfg: &DiscordConfig, coordinator: RunCoordinator) -> anyhow::Result<JoinHandle<()>> {
    let token = cfg
        .token
        .resolve()
        .ok_or_else(|| anyhow!("discord token is not set"))?;

    let http = Arc::new(Http::new(&token));
    coordinator
        .transports()
        .register(Arc::new(DiscordTransport::new(http)))
        .await;

    let policy = cfg.access.clone();
    let handle = tokio::spawn(async move {
        // Message content is a privileged intent; fall back without it
        // when the application hasn't been granted it.
        let full = GatewayIntents::GUILD_MESSAGES | GatewayIntents::DIRECT_MESSAGES | GatewayIntents::MESSAGE_CONTENT;
        let reduced = GatewayIntents::GUILD_MESSAGES | GatewayIntents::DIRECT_MESSAGES;

        for (attempt, intents) in [full, reduced].into_iter().enumerate() {
            let handler = Handler {
                coordinator: coordinator.clone(),
                policy: policy.clone(),
                bot_id: OnceLock::new(),
                downloads: reqwest::Client::new(),
            };
            let mut client = match Client::builder(&token, intents).event_handler(handler).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(error = %e, "failed to build Discord client");
                    return;
                }
            };

            info!(attempt, "starting Discord bot");
            match client.start().await {
                Ok(()) => return,
                Err(e) => {
                    let s = e.to_string();
                    if attempt == 0 && (s.contains("Disallowed gateway intents") || s.contains("Disallowed intent")) {
                        warn!(error = %e, "discord rejected MESSAGE_CONTENT intent, retrying without it");
                        continue;
                    }
                    warn!(error = %e, "Discord client error");
                    return;
                }
            }
        }
    });

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_both_mention_forms() {
        assert_eq!(strip_mention("<@42> hello", Some(42)), "hello");
        assert_eq!(strip_mention("hey <@!42>  ", Some(42)), "hey");
        assert_eq!(strip_mention("<@7> hi", Some(42)), "<@7> hi");
        assert_eq!(strip_mention("  plain ", None), "plain");
    }

    #[test]
    fn channel_ids_must_be_numeric() {
        assert!(channel_id("123456789").is_ok());
        assert!(channel_id("general").is_err());
        assert!(channel_id("0").is_err());
    }

    #[test]
    fn advertises_typing_and_reactions() {
        let t = DiscordTransport::new(Arc::new(Http::new("token")));
        assert_eq!(t.platform(), "discord");
        assert_eq!(
            t.capabilities(),
            Capabilities {
                typing: true,
                reactions: true
            }
        );
    }
}
