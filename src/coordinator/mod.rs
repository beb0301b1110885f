//! Run coordinator: the orchestrator between transports, the queue, the
//! scheduler and the approval broker.
//!
//! Inbound turns are checked in order: approval reply, slash command,
//! then a normal turn that is queued per conversation and executed by the
//! [`RunExecutor`].  Scheduler-fired jobs come back in through
//! [`RunCoordinator::spawn_job_dispatcher`] and take the same queue path
//! (or a direct send for jobs that don't involve the backend).

pub mod executor;

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use executor::{RunExecutor, DEFAULT_HISTORY_LIMIT};

use crate::approval::ApprovalBroker;
use crate::backend::Backend;
use crate::comm::{ChatTarget, ConversationKey, InboundEvent, TransportRegistry};
use crate::events::EventBus;
use crate::queue::{QueueError, RunHandler, RunInput, SessionQueue};
use crate::scheduler::{JobDue, Scheduler};
use crate::session::TranscriptStore;
use crate::slash;
use crate::tools::{ToolPolicy, Toolbox};

/// Sent when a run fails.  Internal detail stays in the logs.
pub const GENERIC_FAILURE_NOTICE: &str = "Sorry, I ran into an error. Please try again.";

/// Reaction added to a message that had to wait behind another run.
pub const BUSY_REACTION: &str = "⏳";

/// The shared components a coordinator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub queue: SessionQueue,
    pub scheduler: Scheduler,
    pub approvals: ApprovalBroker,
    pub transports: TransportRegistry,
    pub transcripts: TranscriptStore,
    pub events: EventBus,
}

/// What happened to an inbound turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundOutcome {
    /// Consumed as the reply to a pending approval.
    ApprovalReply,
    /// Handled by a slash command.
    Command,
    /// Ran to completion; carries the backend's full text.
    Completed(String),
    Cancelled,
    /// Failed; the generic notice was sent.
    Failed,
    /// Not accepted by the queue (empty input).
    Rejected,
}

struct Inner {
    agent_id: String,
    parts: Collaborators,
    slash: slash::Registry,
    executor: Arc<RunExecutor>,
}

/// Cloneable handle to the coordinator.
#[derive(Clone)]
pub struct RunCoordinator {
    inner: Arc<Inner>,
}

impl RunCoordinator {
    pub fn new(
        agent_id: impl Into<String>,
        parts: Collaborators,
        backend: Arc<dyn Backend>,
        policy: ToolPolicy,
        history_limit: usize,
    ) -> Self {
        let toolbox = Toolbox::new(
            parts.scheduler.clone(),
            parts.approvals.clone(),
            parts.transports.clone(),
            parts.queue.clone(),
            policy,
        );
        let executor = Arc::new(RunExecutor::new(
            backend,
            toolbox,
            parts.transports.clone(),
            parts.transcripts.clone(),
            parts.events.clone(),
            history_limit,
        ));
        Self {
            inner: Arc::new(Inner {
                agent_id: agent_id.into(),
                parts,
                slash: slash::Registry::with_builtins(),
                executor,
            }),
        }
    }

    pub fn agent_id(&self) -> &str {
        &self.inner.agent_id
    }

    pub fn parts(&self) -> &Collaborators {
        &self.inner.parts
    }

    pub fn queue(&self) -> &SessionQueue {
        &self.inner.parts.queue
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.parts.scheduler
    }

    pub fn approvals(&self) -> &ApprovalBroker {
        &self.inner.parts.approvals
    }

    pub fn transports(&self) -> &TransportRegistry {
        &self.inner.parts.transports
    }

    pub fn events(&self) -> &EventBus {
        &self.inner.parts.events
    }

    /// Build the conversation key for a chat under this coordinator's agent.
    pub fn conversation_key(&self, platform: &str, is_group: bool, chat_id: &str) -> ConversationKey {
        ConversationKey::new(&self.inner.agent_id, platform, is_group, chat_id)
    }

    fn handler(&self) -> Arc<dyn RunHandler> {
        self.inner.executor.clone()
    }

    /// Process one inbound turn to completion.
    pub async fn handle_inbound(&self, event: InboundEvent) -> InboundOutcome {
        let parts = &self.inner.parts;
        let key = &event.conversation_key;
        let target = event.target();

        debug!(
            key = %key,
            sender = %event.sender_id,
            group = event.is_group,
            text_len = event.text.len(),
            image = event.image.is_some(),
            "inbound message"
        );

        if parts.approvals.resolve(key, &event.text) {
            debug!(key = %key, "inbound message resolved a pending approval");
            return InboundOutcome::ApprovalReply;
        }

        if self.inner.slash.is_command(&event.text) {
            let ctx = slash::Context {
                conversation_key: key.clone(),
                platform: event.platform.clone(),
                queue: parts.queue.clone(),
                scheduler: parts.scheduler.clone(),
                approvals: parts.approvals.clone(),
                transcripts: parts.transcripts.clone(),
            };
            let reply = match self.inner.slash.dispatch(&event.text, &ctx).await {
                Ok(resp) => resp.into_text(),
                Err(e) => {
                    warn!(error = %e, cmd = %event.text.trim(), "slash command error");
                    format!("error: {e}")
                }
            };
            if let Err(e) = parts.transports.send(&target, &reply).await {
                warn!(key = %key, error = %e, "failed to send slash reply");
            }
            return InboundOutcome::Command;
        }

        if parts.queue.is_busy(key) {
            if let Some(message_ref) = &event.message_ref {
                parts.transports.react(&target, message_ref, BUSY_REACTION).await;
            }
        }
        parts.transports.send_typing(&target).await;

        let input = RunInput {
            text: event.text.clone(),
            image: event.image.clone(),
            reply_to: Some(target.clone()),
        };
        let result = parts.queue.enqueue(key, input, self.handler()).await;

        parts.transports.stop_typing(&target).await;

        match result {
            Ok(text) => InboundOutcome::Completed(text),
            Err(QueueError::Cancelled) => {
                info!(key = %key, "run cancelled");
                InboundOutcome::Cancelled
            }
            Err(e @ (QueueError::EmptyKey | QueueError::EmptyInput)) => {
                debug!(key = %key, error = %e, "inbound message rejected");
                InboundOutcome::Rejected
            }
            Err(e) => {
                warn!(key = %key, error = %e, "run failed");
                self.notify_failure(&target).await;
                InboundOutcome::Failed
            }
        }
    }

    /// Handle an inbound turn in the background so the transport never
    /// blocks on a run.
    pub fn dispatch(&self, event: InboundEvent) -> JoinHandle<InboundOutcome> {
        let this = self.clone();
        tokio::spawn(async move { this.handle_inbound(event).await })
    }

    /// Consume fired jobs until the scheduler goes away.
    pub fn spawn_job_dispatcher(&self, mut rx: mpsc::UnboundedReceiver<JobDue>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            while let Some(due) = rx.recv().await {
                let this = this.clone();
                tokio::spawn(async move { this.handle_job_due(due).await });
            }
            debug!("job dispatcher stopped");
        })
    }

    /// Deliver one fired job: through the backend when requested,
    /// otherwise as a plain message.
    pub async fn handle_job_due(&self, due: JobDue) {
        let parts = &self.inner.parts;
        info!(job = %due.job_id, backend = due.invoke_backend, "executing scheduled job");

        if !due.invoke_backend {
            if let Err(e) = parts.transports.send(&due.target, &due.message).await {
                warn!(job = %due.job_id, platform = %due.target.platform, error = %e, "failed to deliver scheduled message");
            }
            return;
        }

        let key = due
            .conversation_key
            .clone()
            .unwrap_or_else(|| ConversationKey::from(format!("cron:{}", due.job_id)));
        let input = RunInput::text(due.message.clone()).reply_to(due.target.clone());
        match parts.queue.enqueue(&key, input, self.handler()).await {
            Ok(_) | Err(QueueError::Cancelled) => {}
            Err(e) => {
                warn!(job = %due.job_id, key = %key, error = %e, "scheduled run failed");
                self.notify_failure(&due.target).await;
            }
        }
    }

    async fn notify_failure(&self, target: &ChatTarget) {
        if let Err(e) = self.inner.parts.transports.send(target, GENERIC_FAILURE_NOTICE).await {
            warn!(platform = %target.platform, error = %e, "failed to send error notice");
        }
    }
}
