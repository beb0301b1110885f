//! Per-conversation approval handshake.
//!
//! In-flight work that needs a human decision calls
//! [`ApprovalBroker::request_approval`]: the prompt is sent to the
//! conversation and the caller suspends until the inbound path hands a
//! reply to [`ApprovalBroker::resolve`], the timeout elapses, or a newer
//! request for the same conversation pre-empts it.  Each conversation has
//! at most one outstanding wait; every way out of a wait resolves it, so
//! no caller is ever left hanging.

pub mod prompts;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::comm::{ChatTarget, ConversationKey, TransportRegistry};
use crate::events::{ApprovalOutcome, CoordinatorEvent, EventBus};

/// Default wait before an unanswered prompt resolves to `None`.
pub const DEFAULT_APPROVAL_TIMEOUT: Duration = Duration::from_secs(120);

struct PendingApproval {
    ticket: u64,
    reply: oneshot::Sender<Option<String>>,
}

struct Inner {
    pending: Mutex<HashMap<String, PendingApproval>>,
    next_ticket: AtomicU64,
    transports: TransportRegistry,
    events: EventBus,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, PendingApproval>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Remove the wait for `key` only if it still belongs to `ticket`.
    fn clear_if_owned(&self, key: &str, ticket: u64) -> bool {
        let mut pending = self.lock();
        if pending.get(key).is_some_and(|p| p.ticket == ticket) {
            pending.remove(key);
            true
        } else {
            false
        }
    }

    fn resolved(&self, key: &ConversationKey, outcome: ApprovalOutcome) {
        self.events.publish(CoordinatorEvent::ApprovalResolved {
            conversation_key: key.to_string(),
            outcome,
        });
    }
}

/// Cloneable handle; clones share the same wait map.
#[derive(Clone)]
pub struct ApprovalBroker {
    inner: Arc<Inner>,
}

impl ApprovalBroker {
    pub fn new(transports: TransportRegistry, events: EventBus) -> Self {
        Self {
            inner: Arc::new(Inner {
                pending: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(1),
                transports,
                events,
            }),
        }
    }

    /// Send `prompt` to `target` and wait for the reply to `key`.
    ///
    /// Resolves to `None` on timeout, when pre-empted by a newer request,
    /// when cancelled, or when the prompt could not be delivered.
    pub async fn request_approval(
        &self,
        key: &ConversationKey,
        target: &ChatTarget,
        prompt: &str,
        timeout: Duration,
    ) -> Option<String> {
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let (tx, mut rx) = oneshot::channel();

        let previous = self
            .inner
            .lock()
            .insert(key.as_str().to_string(), PendingApproval { ticket, reply: tx });
        if let Some(old) = previous {
            let _ = old.reply.send(None);
            debug!(key = %key, "approval wait pre-empted by a newer request");
            self.inner.resolved(key, ApprovalOutcome::Preempted);
        }
        self.inner.events.publish(CoordinatorEvent::ApprovalRequested {
            conversation_key: key.to_string(),
        });

        if let Err(e) = self.inner.transports.send(target, prompt).await {
            warn!(key = %key, platform = %target.platform, error = %e, "failed to deliver approval prompt");
            if self.inner.clear_if_owned(key.as_str(), ticket) {
                self.inner.resolved(key, ApprovalOutcome::SendFailed);
                return None;
            }
            // Someone already answered or replaced us; fall through.
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => None,
            Err(_) => {
                if self.inner.clear_if_owned(key.as_str(), ticket) {
                    debug!(key = %key, timeout_ms = timeout.as_millis() as u64, "approval wait timed out");
                    self.inner.resolved(key, ApprovalOutcome::TimedOut);
                    None
                } else {
                    // Resolved or pre-empted right at the deadline.
                    rx.try_recv().ok().flatten()
                }
            }
        }
    }

    /// Deliver `reply` to the outstanding wait for `key`.
    ///
    /// Returns `false` when nothing is waiting, in which case the caller
    /// should treat the message as a normal turn.
    pub fn resolve(&self, key: &ConversationKey, reply: &str) -> bool {
        let Some(pending) = self.inner.lock().remove(key.as_str()) else {
            return false;
        };
        let delivered = pending.reply.send(Some(reply.to_string())).is_ok();
        if delivered {
            self.inner.resolved(key, ApprovalOutcome::Replied);
        }
        delivered
    }

    pub fn is_pending(&self, key: &ConversationKey) -> bool {
        self.inner.lock().contains_key(key.as_str())
    }

    /// Resolve any outstanding wait for `key` with `None`.
    pub fn cancel(&self, key: &ConversationKey) -> bool {
        let Some(pending) = self.inner.lock().remove(key.as_str()) else {
            return false;
        };
        let _ = pending.reply.send(None);
        self.inner.resolved(key, ApprovalOutcome::Cancelled);
        true
    }

    /// Number of conversations currently awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.lock().len()
    }
}
