//! Per-run backend driver.
//!
//! [`RunExecutor`] is the [`RunHandler`] the coordinator hands to the
//! queue.  For each run it records the user turn, streams the backend,
//! flushes accumulated text to the reply target whenever the backend
//! switches to a tool (and once more at the end), then records the
//! assistant turn.  A reply that cannot be delivered is followed by one
//! best-effort failure notice; the run itself still completes.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::GENERIC_FAILURE_NOTICE;
use crate::backend::{Backend, BackendEvent, BackendRequest};
use crate::comm::{ChatTarget, ConversationKey, TransportRegistry};
use crate::events::{CoordinatorEvent, EventBus};
use crate::queue::{RunHandler, RunRequest};
use crate::session::{Exchange, TranscriptStore};
use crate::tools::{ToolContext, Toolbox};

pub const DEFAULT_HISTORY_LIMIT: usize = 20;

pub struct RunExecutor {
    backend: Arc<dyn Backend>,
    toolbox: Toolbox,
    transports: TransportRegistry,
    transcripts: TranscriptStore,
    events: EventBus,
    history_limit: usize,
}

impl RunExecutor {
    pub fn new(
        backend: Arc<dyn Backend>,
        toolbox: Toolbox,
        transports: TransportRegistry,
        transcripts: TranscriptStore,
        events: EventBus,
        history_limit: usize,
    ) -> Self {
        Self {
            backend,
            toolbox,
            transports,
            transcripts,
            events,
            history_limit,
        }
    }

    async fn flush(&self, target: &ChatTarget, pending: &mut String) {
        let text = pending.trim();
        if !text.is_empty() {
            if let Err(e) = self.transports.send(target, text).await {
                warn!(platform = %target.platform, chat = %target.chat_id, error = %e, "failed to deliver reply");
                if let Err(e) = self.transports.send(target, GENERIC_FAILURE_NOTICE).await {
                    debug!(platform = %target.platform, error = %e, "failed to send delivery notice");
                }
            }
        }
        pending.clear();
    }

    async fn record(&self, key: &ConversationKey, exchange: Exchange) {
        if let Err(e) = self.transcripts.append(key, &exchange).await {
            warn!(key = %key, error = %e, "failed to append transcript");
        }
    }
}

/// Reply target for a run: the explicit one, or the chat encoded in the key.
fn reply_target(run: &RunRequest) -> ChatTarget {
    if let Some(target) = &run.input.reply_to {
        return target.clone();
    }
    let key = &run.conversation_key;
    ChatTarget::new(
        key.platform().unwrap_or("internal"),
        key.chat_id().unwrap_or(key.as_str()),
    )
}

#[async_trait]
impl RunHandler for RunExecutor {
    async fn execute(&self, run: RunRequest, cancel: CancellationToken) -> anyhow::Result<String> {
        let key = run.conversation_key.clone();
        let target = reply_target(&run);

        let history = match self.transcripts.load_recent(&key, self.history_limit).await {
            Ok(h) => h,
            Err(e) => {
                warn!(key = %key, error = %e, "failed to load transcript, continuing without history");
                Vec::new()
            }
        };
        self.record(
            &key,
            Exchange::new("user", run.input.text.clone())
                .with_metadata(json!({ "run_id": run.id, "image": run.input.image.is_some() })),
        )
        .await;

        self.transports.send_typing(&target).await;

        let request = BackendRequest {
            run_id: run.id.clone(),
            text: run.input.text.clone(),
            image: run.input.image.clone(),
            history,
            context: ToolContext {
                conversation_key: key.clone(),
                target: target.clone(),
            },
        };

        let mut stream = self.backend.run(request, self.toolbox.clone(), cancel.clone());
        let mut full = String::new();
        let mut pending = String::new();
        let mut tools_used: Vec<String> = Vec::new();

        while let Some(event) = stream.next().await {
            match event? {
                BackendEvent::Text(text) => {
                    if !full.is_empty() {
                        full.push_str("\n\n");
                    }
                    full.push_str(&text);
                    if !pending.is_empty() {
                        pending.push_str("\n\n");
                    }
                    pending.push_str(&text);
                }
                BackendEvent::ToolUse { name, .. } => {
                    self.flush(&target, &mut pending).await;
                    self.events.publish(CoordinatorEvent::ToolUsed {
                        conversation_key: key.to_string(),
                        tool: name.clone(),
                    });
                    tools_used.push(name);
                }
                BackendEvent::ToolResult { name, output } => {
                    debug!(run_id = %run.id, tool = %name, failed = output.get("error").is_some(), "tool finished");
                }
                BackendEvent::Done => break,
            }
        }
        drop(stream);

        if cancel.is_cancelled() {
            anyhow::bail!("run cancelled");
        }

        self.flush(&target, &mut pending).await;
        self.transports.stop_typing(&target).await;

        self.record(
            &key,
            Exchange::new("assistant", full.clone()).with_metadata(json!({ "run_id": run.id, "tools": tools_used })),
        )
        .await;

        debug!(run_id = %run.id, key = %key, chars = full.len(), "run finished");
        Ok(full)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::RunInput;
    use std::time::Instant;

    fn run(key: &str, reply_to: Option<ChatTarget>) -> RunRequest {
        let mut input = RunInput::text("hi");
        input.reply_to = reply_to;
        RunRequest {
            id: "run_1".into(),
            conversation_key: ConversationKey::from(key),
            input,
            enqueued_at: Instant::now(),
        }
    }

    #[test]
    fn explicit_reply_target_wins() {
        let target = ChatTarget::new("discord", "9");
        let r = run("agent:main:console:dm:local", Some(target.clone()));
        assert_eq!(reply_target(&r), target);
    }

    #[test]
    fn reply_target_falls_back_to_key() {
        let r = run("agent:main:discord:group:123", None);
        assert_eq!(reply_target(&r), ChatTarget::new("discord", "123"));

        let r = run("cron:job_abc", None);
        assert_eq!(reply_target(&r), ChatTarget::new("internal", "cron:job_abc"));
    }
}
