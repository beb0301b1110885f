//! Shared fixtures for integration tests: a recording transport, a
//! scripted backend and a fully wired coordinator.

#![allow(dead_code)]

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clawd::approval::ApprovalBroker;
use clawd::backend::{Backend, BackendEvent, BackendRequest, BackendStream};
use clawd::comm::{Capabilities, ChatTarget, InboundEvent, Transport, TransportRegistry};
use clawd::coordinator::{Collaborators, RunCoordinator};
use clawd::events::EventBus;
use clawd::queue::SessionQueue;
use clawd::scheduler::{JobDue, JobStore, Scheduler};
use clawd::session::TranscriptStore;
use clawd::tools::{ToolPolicy, Toolbox};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

pub const PLATFORM: &str = "test";
pub const CHAT: &str = "chat-1";

// ── Transport ────────────────────────────────────────────────

#[derive(Default)]
pub struct RecordingTransport {
    caps: Capabilities,
    sent: Mutex<Vec<(String, String)>>,
    reactions: Mutex<Vec<(String, String)>>,
    typing: AtomicUsize,
    failing_sends: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Self {
        Self {
            caps: Capabilities {
                typing: true,
                reactions: true,
            },
            ..Default::default()
        }
    }

    pub fn without_capabilities() -> Self {
        Self::default()
    }

    /// Make the next `n` sends fail without recording anything.
    pub fn fail_next_sends(&self, n: usize) {
        self.failing_sends.store(n, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.sent().into_iter().map(|(_, t)| t).collect()
    }

    /// `(message_ref, emoji)` pairs.
    pub fn reactions(&self) -> Vec<(String, String)> {
        self.reactions.lock().unwrap().clone()
    }

    pub fn typing_count(&self) -> usize {
        self.typing.load(Ordering::SeqCst)
    }

    /// Poll until at least `n` messages were sent.
    pub async fn wait_for_messages(&self, n: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let texts = self.texts();
            if texts.len() >= n {
                return texts;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "timed out waiting for {n} messages, got {texts:?}"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn platform(&self) -> &str {
        PLATFORM
    }

    fn capabilities(&self) -> Capabilities {
        self.caps
    }

    async fn send_message(&self, chat_id: &str, text: &str) -> anyhow::Result<()> {
        let failing = self
            .failing_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("send to {chat_id} failed");
        }
        self.sent.lock().unwrap().push((chat_id.to_string(), text.to_string()));
        Ok(())
    }

    async fn send_typing(&self, _chat_id: &str) -> anyhow::Result<()> {
        self.typing.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn react(&self, _chat_id: &str, message_ref: &str, emoji: &str) -> anyhow::Result<()> {
        self.reactions
            .lock()
            .unwrap()
            .push((message_ref.to_string(), emoji.to_string()));
        Ok(())
    }
}

// ── Backend ──────────────────────────────────────────────────

/// Behaviour is picked from the turn text:
/// - `fail`            → stream error
/// - `wait`            → block until [`ScriptedBackend::release`] or cancel
/// - `tool:<name> <j>` → invoke tool `<name>` with JSON args `<j>`, then
///   reply with the tool output
/// - anything else     → `reply: <text>`
#[derive(Default)]
pub struct ScriptedBackend {
    gate: Notify,
    history_lens: Mutex<Vec<usize>>,
}

impl ScriptedBackend {
    pub fn release(&self) {
        self.gate.notify_one();
    }

    pub fn history_lens(&self) -> Vec<usize> {
        self.history_lens.lock().unwrap().clone()
    }
}

impl Backend for ScriptedBackend {
    fn name(&self) -> &str {
        "scripted"
    }

    fn run<'a>(&'a self, request: BackendRequest, tools: Toolbox, cancel: CancellationToken) -> BackendStream<'a> {
        self.history_lens.lock().unwrap().push(request.history.len());
        Box::pin(async_stream::try_stream! {
            let text = request.text.trim().to_string();
            if text == "fail" {
                Err::<(), _>(anyhow::anyhow!("backend exploded"))?;
            } else if text == "wait" {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = self.gate.notified() => {}
                }
                yield BackendEvent::Text("released".to_string());
            } else if let Some(rest) = text.strip_prefix("tool:") {
                let (name, args) = rest.split_once(' ').unwrap_or((rest, "{}"));
                let args: serde_json::Value = serde_json::from_str(args)?;
                yield BackendEvent::ToolUse { name: name.to_string(), input: args.clone() };
                let output = tools.invoke(name, args, &request.context).await;
                yield BackendEvent::ToolResult { name: name.to_string(), output: output.clone() };
                yield BackendEvent::Text(format!("tool result: {output}"));
            } else {
                yield BackendEvent::Text(format!("reply: {text}"));
            }
            yield BackendEvent::Done;
        })
    }
}

// ── Harness ──────────────────────────────────────────────────

pub struct Harness {
    pub coordinator: RunCoordinator,
    pub transport: Arc<RecordingTransport>,
    pub backend: Arc<ScriptedBackend>,
    pub due_rx: Option<mpsc::UnboundedReceiver<JobDue>>,
}

pub async fn harness(dir: &Path) -> Harness {
    harness_with_policy(dir, ToolPolicy::default()).await
}

pub async fn harness_with_policy(dir: &Path, policy: ToolPolicy) -> Harness {
    let events = EventBus::new();
    let transports = TransportRegistry::new();
    let transport = Arc::new(RecordingTransport::new());
    transports.register(transport.clone()).await;

    let queue = SessionQueue::new(events.clone(), Duration::from_secs(60));
    let (scheduler, due_rx) = Scheduler::new(JobStore::new(dir.join("jobs.json")), events.clone(), None)
        .await
        .unwrap();
    let approvals = ApprovalBroker::new(transports.clone(), events.clone());
    let transcripts = TranscriptStore::new(dir.join("transcripts"));
    let backend = Arc::new(ScriptedBackend::default());

    let parts = Collaborators {
        queue,
        scheduler,
        approvals,
        transports,
        transcripts,
        events,
    };
    let coordinator = RunCoordinator::new("main", parts, backend.clone(), policy, 20);

    Harness {
        coordinator,
        transport,
        backend,
        due_rx: Some(due_rx),
    }
}

impl Harness {
    pub fn inbound(&self, text: &str, message_ref: Option<&str>) -> InboundEvent {
        InboundEvent {
            conversation_key: self.coordinator.conversation_key(PLATFORM, false, CHAT),
            platform: PLATFORM.to_string(),
            chat_id: CHAT.to_string(),
            sender_id: "user-1".to_string(),
            text: text.to_string(),
            image: None,
            is_group: false,
            message_ref: message_ref.map(String::from),
        }
    }

    pub fn target(&self) -> ChatTarget {
        ChatTarget::new(PLATFORM, CHAT)
    }

    /// Poll until the conversation's queue has an executing run.
    pub async fn wait_until_processing(&self) {
        let key = self.coordinator.conversation_key(PLATFORM, false, CHAT);
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !self.coordinator.queue().status(&key).processing {
            assert!(tokio::time::Instant::now() < deadline, "run never started");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
