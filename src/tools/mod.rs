//! Tools the backend can call while a run is executing.
//!
//! The [`Toolbox`] is an owned handle over the coordinator's collaborators
//! (scheduler, approval broker, transports, queue).  Every call carries an
//! explicit [`ToolContext`] naming the conversation it runs on behalf of;
//! nothing here reads ambient "current conversation" state.
//!
//! Tools named in [`ToolPolicy::require_approval`] are gated behind a
//! permission prompt sent through the [`ApprovalBroker`].

pub mod scheduling;
pub mod messaging;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::approval::{self, ApprovalBroker};
use crate::comm::{ChatTarget, ConversationKey, TransportRegistry};
use crate::queue::SessionQueue;
use crate::scheduler::Scheduler;

/// Metadata describing a tool available to the backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolMeta {
    /// Short machine-friendly name (e.g. `"schedule_delayed"`).
    pub name: String,
    /// Human-readable one-liner describing what the tool does.
    pub description: String,
    /// JSON Schema object describing the expected `args` value.
    pub args_schema: Value,
}

/// Who a tool call is acting for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolContext {
    pub conversation_key: ConversationKey,
    /// Where the conversation's replies go.
    pub target: ChatTarget,
}

#[derive(Debug, Clone)]
pub struct ToolPolicy {
    pub require_approval: HashSet<String>,
    pub approval_timeout: Duration,
}

impl Default for ToolPolicy {
    fn default() -> Self {
        Self {
            require_approval: HashSet::new(),
            approval_timeout: approval::DEFAULT_APPROVAL_TIMEOUT,
        }
    }
}

/// Cloneable tool dispatcher.
#[derive(Clone)]
pub struct Toolbox {
    pub(crate) scheduler: Scheduler,
    pub(crate) approvals: ApprovalBroker,
    pub(crate) transports: TransportRegistry,
    pub(crate) queue: SessionQueue,
    policy: Arc<ToolPolicy>,
}

impl Toolbox {
    pub fn new(
        scheduler: Scheduler,
        approvals: ApprovalBroker,
        transports: TransportRegistry,
        queue: SessionQueue,
        policy: ToolPolicy,
    ) -> Self {
        Self {
            scheduler,
            approvals,
            transports,
            queue,
            policy: Arc::new(policy),
        }
    }

    /// Every tool, in a stable order.
    pub fn catalogue() -> Vec<ToolMeta> {
        let mut tools = scheduling::metas();
        tools.extend(messaging::metas());
        tools
    }

    /// Catalogue in the chat-completions `tools` format.
    pub fn definitions(&self) -> Vec<Value> {
        Self::catalogue()
            .into_iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description,
                        "parameters": t.args_schema,
                    }
                })
            })
            .collect()
    }

    pub fn requires_approval(&self, name: &str) -> bool {
        self.policy.require_approval.contains(name)
    }

    /// Dispatch a tool by name without any permission check.
    pub async fn call(&self, name: &str, args: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
        debug!(tool = name, key = %ctx.conversation_key, "tool call");
        match name {
            "schedule_delayed" => scheduling::schedule_delayed(self, args, ctx).await,
            "schedule_recurring" => scheduling::schedule_recurring(self, args, ctx).await,
            "schedule_cron" => scheduling::schedule_cron(self, args, ctx).await,
            "list_scheduled" => scheduling::list_scheduled(self, args, ctx).await,
            "cancel_scheduled" => scheduling::cancel_scheduled(self, args, ctx).await,
            "send_message" => messaging::send_message(self, args, ctx).await,
            "broadcast_message" => messaging::broadcast_message(self, args, ctx).await,
            "list_platforms" => messaging::list_platforms(self, args, ctx).await,
            "get_queue_status" => messaging::get_queue_status(self, args, ctx).await,
            "get_current_context" => messaging::get_current_context(self, args, ctx).await,
            "ask_user" => messaging::ask_user(self, args, ctx).await,
            other => anyhow::bail!("unknown tool '{other}'"),
        }
    }

    /// Ask the conversation for permission when `name` is gated.  A
    /// timeout or anything other than a yes denies.
    pub async fn authorize(&self, name: &str, args: &Value, ctx: &ToolContext) -> bool {
        if !self.requires_approval(name) {
            return true;
        }
        let prompt = approval::prompts::permission_prompt(name, args);
        let reply = self
            .approvals
            .request_approval(&ctx.conversation_key, &ctx.target, &prompt, self.policy.approval_timeout)
            .await;
        let allowed = reply.as_deref().is_some_and(approval::prompts::parse_permission);
        info!(tool = name, key = %ctx.conversation_key, allowed, "tool permission decided");
        allowed
    }

    /// Authorize then call.  Failures come back as `{"error": ...}` so
    /// the model can see and react to them.
    pub async fn invoke(&self, name: &str, args: Value, ctx: &ToolContext) -> Value {
        if !self.authorize(name, &args, ctx).await {
            return json!({ "error": format!("permission to use '{name}' was denied") });
        }
        match self.call(name, args, ctx).await {
            Ok(v) => v,
            Err(e) => {
                warn!(tool = name, error = %e, "tool call failed");
                json!({ "error": e.to_string() })
            }
        }
    }
}

/// Required string argument.
pub(crate) fn str_arg<'a>(tool: &str, args: &'a Value, field: &str) -> anyhow::Result<&'a str> {
    args[field]
        .as_str()
        .filter(|s| !s.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("{tool} requires a '{field}' string"))
}

/// Required positive whole-number argument.  Fractions and negatives are
/// rejected rather than rounded.
pub(crate) fn secs_arg(tool: &str, args: &Value, field: &str) -> anyhow::Result<u64> {
    args[field]
        .as_u64()
        .filter(|n| *n > 0)
        .ok_or_else(|| anyhow::anyhow!("{tool} requires '{field}' as a positive whole number of seconds"))
}
