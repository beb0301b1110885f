//! Per-conversation FIFO run queue.
//!
//! Every conversation key gets its own queue, created lazily on first
//! submit.  A single worker task per key pops runs in order and executes
//! them one at a time, so a key never has more than one run in flight
//! while unrelated keys progress independently.  Each run gets its own
//! [`CancellationToken`]; [`SessionQueue::abort`] cancels only the run
//! currently executing.
//!
//! A drained queue lingers for an idle grace period and is then removed;
//! its counters are folded into a retired tally so global totals are
//! always the sum of per-key state.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::comm::{ChatTarget, ConversationKey, ImagePayload};
use crate::events::{CoordinatorEvent, EventBus};

/// Default time a drained queue is kept before teardown.
pub const DEFAULT_IDLE_GRACE: Duration = Duration::from_secs(60);

// ── Types ────────────────────────────────────────────────────

/// What a run carries into the backend.
#[derive(Debug, Clone)]
pub struct RunInput {
    pub text: String,
    pub image: Option<ImagePayload>,
    /// Where replies produced while running should be delivered.
    pub reply_to: Option<ChatTarget>,
}

impl RunInput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            image: None,
            reply_to: None,
        }
    }

    pub fn reply_to(mut self, target: ChatTarget) -> Self {
        self.reply_to = Some(target);
        self
    }

    fn is_empty(&self) -> bool {
        self.text.trim().is_empty() && self.image.is_none()
    }
}

/// A run handed to a [`RunHandler`].
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub id: String,
    pub conversation_key: ConversationKey,
    pub input: RunInput,
    pub enqueued_at: Instant,
}

/// Executes one run.  Implementations must honour `cancel`; the queue
/// also drops the execution future when the token fires.
#[async_trait]
pub trait RunHandler: Send + Sync + 'static {
    async fn execute(&self, run: RunRequest, cancel: CancellationToken) -> anyhow::Result<String>;
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("conversation key must not be empty")]
    EmptyKey,
    #[error("run input must carry text or an image")]
    EmptyInput,
    #[error("run failed: {0}")]
    Failed(String),
    #[error("run was cancelled")]
    Cancelled,
    #[error("run was dropped before it completed")]
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStatus {
    pub pending: usize,
    pub processing: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_pending: usize,
    /// Conversations with a run executing right now.
    pub active_conversations: usize,
    /// Conversations with a live queue (busy or within the idle grace).
    pub conversations: usize,
}

/// Handle to a submitted run.
pub struct RunTicket {
    pub run_id: String,
    /// 1-based position among pending runs at submit time.
    pub position: usize,
    rx: oneshot::Receiver<Result<String, QueueError>>,
}

impl RunTicket {
    /// Wait for the run to finish.
    pub async fn wait(self) -> Result<String, QueueError> {
        self.rx.await.unwrap_or(Err(QueueError::Dropped))
    }
}

// ── Internal state ───────────────────────────────────────────

struct Run {
    request: RunRequest,
    handler: Arc<dyn RunHandler>,
    reply: oneshot::Sender<Result<String, QueueError>>,
}

#[derive(Debug, Clone, Copy, Default)]
struct Tally {
    enqueued: u64,
    processed: u64,
    failed: u64,
    cancelled: u64,
}

impl Tally {
    fn absorb(&mut self, other: &Tally) {
        self.enqueued += other.enqueued;
        self.processed += other.processed;
        self.failed += other.failed;
        self.cancelled += other.cancelled;
    }
}

#[derive(Default)]
struct ConversationQueue {
    pending: VecDeque<Run>,
    processing: bool,
    active: Option<CancellationToken>,
    tally: Tally,
    /// Bumped each time the worker drains; teardown only proceeds if the
    /// epoch it captured is still current.
    idle_epoch: u64,
}

#[derive(Default)]
struct State {
    queues: HashMap<String, ConversationQueue>,
    retired: Tally,
}

struct Inner {
    state: Mutex<State>,
    events: EventBus,
    idle_grace: Duration,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ── SessionQueue ─────────────────────────────────────────────

/// Cloneable handle; all clones share the same queues.
#[derive(Clone)]
pub struct SessionQueue {
    inner: Arc<Inner>,
}

impl SessionQueue {
    pub fn new(events: EventBus, idle_grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                events,
                idle_grace,
            }),
        }
    }

    /// Append a run to `key`'s queue and start the worker if it was idle.
    ///
    /// The append happens before this returns, so the order of `submit`
    /// calls is the execution order.
    pub fn submit(
        &self,
        key: &ConversationKey,
        input: RunInput,
        handler: Arc<dyn RunHandler>,
    ) -> Result<RunTicket, QueueError> {
        if key.as_str().trim().is_empty() {
            return Err(QueueError::EmptyKey);
        }
        if input.is_empty() {
            return Err(QueueError::EmptyInput);
        }

        let run_id = crate::utils::short_id("run");
        let (tx, rx) = oneshot::channel();
        let run = Run {
            request: RunRequest {
                id: run_id.clone(),
                conversation_key: key.clone(),
                input,
                enqueued_at: Instant::now(),
            },
            handler,
            reply: tx,
        };

        let (position, start_worker) = {
            let mut state = self.inner.lock();
            let queue = state.queues.entry(key.as_str().to_string()).or_default();
            queue.pending.push_back(run);
            queue.tally.enqueued += 1;
            let start = !queue.processing;
            queue.processing = true;
            (queue.pending.len(), start)
        };

        self.inner.events.publish(CoordinatorEvent::RunQueued {
            run_id: run_id.clone(),
            conversation_key: key.to_string(),
            position,
        });

        if start_worker {
            tokio::spawn(drain(Arc::clone(&self.inner), key.as_str().to_string()));
        }

        Ok(RunTicket { run_id, position, rx })
    }

    /// Submit and wait for the output.
    pub async fn enqueue(
        &self,
        key: &ConversationKey,
        input: RunInput,
        handler: Arc<dyn RunHandler>,
    ) -> Result<String, QueueError> {
        self.submit(key, input, handler)?.wait().await
    }

    pub fn status(&self, key: &ConversationKey) -> QueueStatus {
        let state = self.inner.lock();
        state
            .queues
            .get(key.as_str())
            .map(|q| QueueStatus {
                pending: q.pending.len(),
                processing: q.active.is_some(),
            })
            .unwrap_or_default()
    }

    /// True when a run is executing or waiting for `key`.
    pub fn is_busy(&self, key: &ConversationKey) -> bool {
        let status = self.status(key);
        status.processing || status.pending > 0
    }

    /// Cancel the run currently executing for `key`.  Queued runs are
    /// left alone.  Returns whether there was an active run.
    pub fn abort(&self, key: &ConversationKey) -> bool {
        let state = self.inner.lock();
        match state.queues.get(key.as_str()).and_then(|q| q.active.as_ref()) {
            Some(token) => {
                token.cancel();
                debug!(key = %key, "abort requested for active run");
                true
            }
            None => false,
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        let mut tally = state.retired;
        let mut stats = QueueStats {
            conversations: state.queues.len(),
            ..QueueStats::default()
        };
        for q in state.queues.values() {
            tally.absorb(&q.tally);
            stats.total_pending += q.pending.len();
            if q.active.is_some() {
                stats.active_conversations += 1;
            }
        }
        stats.total_enqueued = tally.enqueued;
        stats.total_processed = tally.processed;
        stats.total_failed = tally.failed;
        stats.total_cancelled = tally.cancelled;
        stats
    }

    /// Per-conversation status for every live queue, sorted by key.
    pub fn conversations(&self) -> Vec<(String, QueueStatus)> {
        let state = self.inner.lock();
        let mut out: Vec<(String, QueueStatus)> = state
            .queues
            .iter()
            .map(|(k, q)| {
                (
                    k.clone(),
                    QueueStatus {
                        pending: q.pending.len(),
                        processing: q.active.is_some(),
                    },
                )
            })
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

// ── Worker ───────────────────────────────────────────────────

async fn drain(inner: Arc<Inner>, key: String) {
    loop {
        let next = {
            let mut state = inner.lock();
            let Some(queue) = state.queues.get_mut(&key) else {
                return;
            };
            match queue.pending.pop_front() {
                Some(run) => {
                    let token = CancellationToken::new();
                    queue.active = Some(token.clone());
                    Ok((run, token, queue.pending.len()))
                }
                None => {
                    queue.processing = false;
                    queue.active = None;
                    queue.idle_epoch += 1;
                    Err(queue.idle_epoch)
                }
            }
        };

        let (run, token, remaining) = match next {
            Ok(next) => next,
            Err(epoch) => {
                schedule_teardown(inner, key, epoch);
                return;
            }
        };

        let run_id = run.request.id.clone();
        let started = Instant::now();
        inner.events.publish(CoordinatorEvent::RunStarted {
            run_id: run_id.clone(),
            conversation_key: key.clone(),
            waited_ms: started.duration_since(run.request.enqueued_at).as_millis() as u64,
            remaining,
        });

        let outcome = execute(run.handler, run.request, token).await;

        {
            let mut state = inner.lock();
            if let Some(queue) = state.queues.get_mut(&key) {
                queue.active = None;
                match &outcome {
                    Ok(_) => queue.tally.processed += 1,
                    Err(QueueError::Cancelled) => queue.tally.cancelled += 1,
                    Err(_) => queue.tally.failed += 1,
                }
            }
        }

        let event = match &outcome {
            Ok(_) => CoordinatorEvent::RunCompleted {
                run_id,
                conversation_key: key.clone(),
                elapsed_ms: started.elapsed().as_millis() as u64,
            },
            Err(QueueError::Cancelled) => CoordinatorEvent::RunCancelled {
                run_id,
                conversation_key: key.clone(),
            },
            Err(e) => CoordinatorEvent::RunFailed {
                run_id,
                conversation_key: key.clone(),
                error: e.to_string(),
            },
        };
        inner.events.publish(event);

        // The caller may have stopped waiting; that is fine.
        let _ = run.reply.send(outcome);
    }
}

/// Run the handler in its own task so a panic or a cancel cannot take
/// the worker down with it.
async fn execute(
    handler: Arc<dyn RunHandler>,
    request: RunRequest,
    token: CancellationToken,
) -> Result<String, QueueError> {
    let child = token.clone();
    let mut task = tokio::spawn(async move { handler.execute(request, child).await });

    tokio::select! {
        biased;
        _ = token.cancelled() => {
            task.abort();
            Err(QueueError::Cancelled)
        }
        joined = &mut task => match joined {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(QueueError::Failed(format!("{e:#}"))),
            Err(e) if e.is_cancelled() => Err(QueueError::Cancelled),
            Err(e) => {
                warn!(error = %e, "run handler panicked");
                Err(QueueError::Failed("run handler panicked".to_string()))
            }
        },
    }
}

fn schedule_teardown(inner: Arc<Inner>, key: String, epoch: u64) {
    let grace = inner.idle_grace;
    tokio::spawn(async move {
        tokio::time::sleep(grace).await;
        let mut state = inner.lock();
        let still_idle = state
            .queues
            .get(&key)
            .is_some_and(|q| !q.processing && q.pending.is_empty() && q.idle_epoch == epoch);
        if still_idle {
            if let Some(queue) = state.queues.remove(&key) {
                state.retired.absorb(&queue.tally);
                debug!(key = %key, "idle queue torn down");
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Upper;

    #[async_trait]
    impl RunHandler for Upper {
        async fn execute(&self, run: RunRequest, _cancel: CancellationToken) -> anyhow::Result<String> {
            Ok(run.input.text.to_uppercase())
        }
    }

    fn queue() -> SessionQueue {
        SessionQueue::new(EventBus::new(), Duration::from_millis(50))
    }

    #[tokio::test]
    async fn rejects_empty_key_and_input() {
        let q = queue();
        let err = q
            .enqueue(&ConversationKey::from(""), RunInput::text("hi"), Arc::new(Upper))
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::EmptyKey);

        let err = q
            .enqueue(&ConversationKey::from("k"), RunInput::text("  "), Arc::new(Upper))
            .await
            .unwrap_err();
        assert_eq!(err, QueueError::EmptyInput);
        assert_eq!(q.stats().total_enqueued, 0);
    }

    #[tokio::test]
    async fn image_only_input_is_accepted() {
        let q = queue();
        let input = RunInput {
            text: String::new(),
            image: Some(ImagePayload {
                data: "aGk=".into(),
                media_type: "image/png".into(),
            }),
            reply_to: None,
        };
        let out = q.enqueue(&ConversationKey::from("k"), input, Arc::new(Upper)).await;
        assert_eq!(out.unwrap(), "");
    }

    #[tokio::test]
    async fn idle_queue_is_torn_down_and_totals_survive() {
        let q = queue();
        let key = ConversationKey::from("k");
        q.enqueue(&key, RunInput::text("a"), Arc::new(Upper)).await.unwrap();
        assert_eq!(q.stats().conversations, 1);

        tokio::time::sleep(Duration::from_millis(200)).await;
        let stats = q.stats();
        assert_eq!(stats.conversations, 0);
        assert_eq!(stats.total_enqueued, 1);
        assert_eq!(stats.total_processed, 1);
    }

    #[tokio::test]
    async fn abort_without_active_run_returns_false() {
        let q = queue();
        assert!(!q.abort(&ConversationKey::from("nobody")));
        assert_eq!(q.status(&ConversationKey::from("nobody")), QueueStatus::default());
    }
}
