//! Typed coordinator event bus.
//!
//! Queue, scheduler and approval activity is published as
//! [`CoordinatorEvent`]s on a `tokio::sync::broadcast` channel.  Publishing
//! never blocks and never fails: with no subscribers, or with a lagging
//! subscriber, events are simply dropped for that subscriber.  Consumers
//! (the log monitor, the gateway `/ws` stream) observe; they never steer.

use serde::Serialize;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Capacity of the event broadcast channel.
const EVENT_CAPACITY: usize = 512;

/// How an approval wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalOutcome {
    Replied,
    TimedOut,
    Preempted,
    SendFailed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    RunQueued {
        run_id: String,
        conversation_key: String,
        position: usize,
    },
    RunStarted {
        run_id: String,
        conversation_key: String,
        waited_ms: u64,
        remaining: usize,
    },
    RunCompleted {
        run_id: String,
        conversation_key: String,
        elapsed_ms: u64,
    },
    RunFailed {
        run_id: String,
        conversation_key: String,
        error: String,
    },
    RunCancelled {
        run_id: String,
        conversation_key: String,
    },
    ToolUsed {
        conversation_key: String,
        tool: String,
    },
    JobScheduled {
        job_id: String,
        kind: String,
        description: String,
    },
    JobFired {
        job_id: String,
        run_count: u64,
        invoke_backend: bool,
    },
    JobCancelled {
        job_id: String,
    },
    ApprovalRequested {
        conversation_key: String,
    },
    ApprovalResolved {
        conversation_key: String,
        outcome: ApprovalOutcome,
    },
}

/// Cloneable handle to the broadcast bus.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<CoordinatorEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CAPACITY);
        Self { tx }
    }

    /// Best-effort publish.
    pub fn publish(&self, event: CoordinatorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.tx.subscribe()
    }
}

/// Spawn a background task that logs every event through `tracing`.
pub fn spawn_monitor(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "event monitor lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("event monitor stopped");
    })
}

fn log_event(event: &CoordinatorEvent) {
    match event {
        CoordinatorEvent::RunQueued { run_id, conversation_key, position } => {
            debug!(run = %run_id, key = %conversation_key, position, "run queued");
        }
        CoordinatorEvent::RunStarted { run_id, conversation_key, waited_ms, remaining } => {
            debug!(run = %run_id, key = %conversation_key, waited_ms, remaining, "run started");
        }
        CoordinatorEvent::RunCompleted { run_id, conversation_key, elapsed_ms } => {
            info!(run = %run_id, key = %conversation_key, elapsed_ms, "run completed");
        }
        CoordinatorEvent::RunFailed { run_id, conversation_key, error } => {
            warn!(run = %run_id, key = %conversation_key, error = %error, "run failed");
        }
        CoordinatorEvent::RunCancelled { run_id, conversation_key } => {
            info!(run = %run_id, key = %conversation_key, "run cancelled");
        }
        CoordinatorEvent::ToolUsed { conversation_key, tool } => {
            debug!(key = %conversation_key, tool = %tool, "tool used");
        }
        CoordinatorEvent::JobScheduled { job_id, kind, description } => {
            info!(job = %job_id, kind = %kind, description = %description, "job scheduled");
        }
        CoordinatorEvent::JobFired { job_id, run_count, invoke_backend } => {
            info!(job = %job_id, run_count, invoke_backend, "job fired");
        }
        CoordinatorEvent::JobCancelled { job_id } => {
            info!(job = %job_id, "job cancelled");
        }
        CoordinatorEvent::ApprovalRequested { conversation_key } => {
            debug!(key = %conversation_key, "approval requested");
        }
        CoordinatorEvent::ApprovalResolved { conversation_key, outcome } => {
            debug!(key = %conversation_key, outcome = ?outcome, "approval resolved");
        }
    }
}
