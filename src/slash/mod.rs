//! Channel-agnostic slash command registry and dispatch.
//!
//! Provides a [`Registry`] that maps command names to async [`Handler`]s,
//! plus [`register_builtin_commands`] which wires up the operational
//! commands (`/status`, `/queue`, `/stop`, `/jobs`, `/cancel`, `/new`,
//! `/help`).  Text that starts with `/` but names no registered command
//! is not a slash command: [`Registry::is_command`] returns `false` and the
//! caller hands it to the backend as a normal turn.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::approval::ApprovalBroker;
use crate::comm::ConversationKey;
use crate::queue::SessionQueue;
use crate::scheduler::Scheduler;
use crate::session::TranscriptStore;

// ── Types ────────────────────────────────────────────────────

/// Metadata describing a registered slash command.
#[derive(Debug, Clone)]
pub struct Command {
    pub name: String,
    pub description: String,
    pub usage: String,
}

/// Parsed arguments supplied to a command handler.
#[derive(Debug, Clone)]
pub struct CommandArgs {
    /// Remaining text after the command name (trimmed).
    pub raw: String,
    /// Whitespace-split tokens from `raw`.
    pub args: Vec<String>,
}

/// Execution context provided to every handler invocation.
#[derive(Clone)]
pub struct Context {
    pub conversation_key: ConversationKey,
    /// Platform the command originated from (e.g. `"discord"`).
    pub platform: String,
    pub queue: SessionQueue,
    pub scheduler: Scheduler,
    pub approvals: ApprovalBroker,
    pub transcripts: TranscriptStore,
}

/// Possible responses from a slash command handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlashResponse {
    /// Plain text reply to display to the user.
    Text(String),
}

impl SlashResponse {
    pub fn into_text(self) -> String {
        match self {
            SlashResponse::Text(t) => t,
        }
    }
}

/// Errors during slash command dispatch or execution.
#[derive(Debug, Error)]
pub enum SlashError {
    #[error("unknown command: /{0}")]
    UnknownCommand(String),
    #[error("{0}")]
    Handler(String),
}

// ── Handler type alias ───────────────────────────────────────

/// A slash command handler: receives owned [`Context`] + [`CommandArgs`],
/// returns a boxed future producing a [`SlashResponse`] or [`SlashError`].
pub type Handler = Arc<
    dyn Fn(Context, CommandArgs) -> Pin<Box<dyn Future<Output = Result<SlashResponse, SlashError>> + Send>>
        + Send
        + Sync,
>;

// ── Registry ─────────────────────────────────────────────────

/// Thread-safe registry mapping command names to metadata + handlers.
pub struct Registry {
    commands: RwLock<HashMap<String, (Command, Handler)>>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// Split `/name rest` into the command name and its arguments.
fn parse(raw: &str) -> Option<(&str, CommandArgs)> {
    let without_slash = raw.trim().strip_prefix('/')?;
    if without_slash.starts_with(char::is_whitespace) {
        return None;
    }
    let name = without_slash.split_whitespace().next()?;
    let args_str = without_slash[name.len()..].trim();
    Some((
        name,
        CommandArgs {
            raw: args_str.to_string(),
            args: args_str.split_whitespace().map(String::from).collect(),
        },
    ))
}

impl Registry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            commands: RwLock::new(HashMap::new()),
        }
    }

    /// Registry with the built-in commands already registered.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        register_builtin_commands(&registry);
        registry
    }

    /// Register a command and its handler.
    pub fn register(&self, cmd: Command, handler: Handler) {
        let name = cmd.name.clone();
        let mut map = self.commands.write().unwrap_or_else(PoisonError::into_inner);
        map.insert(name, (cmd, handler));
    }

    /// True when `raw` is `/name ...` for a registered `name`.
    pub fn is_command(&self, raw: &str) -> bool {
        let Some((name, _)) = parse(raw) else {
            return false;
        };
        self.commands
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(name)
    }

    /// Dispatch raw user input (e.g. `"/cancel job_1a2b"`) to the matching
    /// command handler.
    pub async fn dispatch(&self, raw: &str, ctx: &Context) -> Result<SlashResponse, SlashError> {
        let (name, cmd_args) = parse(raw).ok_or_else(|| SlashError::UnknownCommand(String::new()))?;

        let handler = {
            let map = self.commands.read().unwrap_or_else(PoisonError::into_inner);
            let (_, handler) = map
                .get(name)
                .ok_or_else(|| SlashError::UnknownCommand(name.to_string()))?;
            Arc::clone(handler)
        };

        debug!(command = name, key = %ctx.conversation_key, "dispatching slash command");
        handler(ctx.clone(), cmd_args).await
    }

    /// Return metadata for all registered commands, sorted by name.
    pub fn list(&self) -> Vec<Command> {
        let map = self.commands.read().unwrap_or_else(PoisonError::into_inner);
        let mut cmds: Vec<Command> = map.values().map(|(cmd, _)| cmd.clone()).collect();
        cmds.sort_by(|a, b| a.name.cmp(&b.name));
        cmds
    }
}

// ── Built-in command registration ────────────────────────────

fn cmd(name: &str, description: &str, usage: &str) -> Command {
    Command {
        name: name.to_string(),
        description: description.to_string(),
        usage: usage.to_string(),
    }
}

fn text(s: impl Into<String>) -> Result<SlashResponse, SlashError> {
    Ok(SlashResponse::Text(s.into()))
}

/// Register all built-in slash commands into the given registry.
pub fn register_builtin_commands(registry: &Registry) {
    // /status: queue counters, job count, pending approvals
    registry.register(
        cmd("status", "Show coordinator status", "/status"),
        Arc::new(|ctx, _args| {
            Box::pin(async move {
                let stats = ctx.queue.stats();
                let jobs = ctx.scheduler.list().await.len();
                text(format!(
                    "conversation: {}\nplatform: {}\nactive conversations: {}\npending runs: {}\nprocessed: {} (failed {}, cancelled {})\nscheduled jobs: {jobs}\npending approvals: {}",
                    ctx.conversation_key,
                    ctx.platform,
                    stats.active_conversations,
                    stats.total_pending,
                    stats.total_processed,
                    stats.total_failed,
                    stats.total_cancelled,
                    ctx.approvals.pending_count(),
                ))
            })
        }),
    );

    // /queue: this conversation's queue
    registry.register(
        cmd("queue", "Show this conversation's queue", "/queue"),
        Arc::new(|ctx, _args| {
            Box::pin(async move {
                let status = ctx.queue.status(&ctx.conversation_key);
                let state = if status.processing { "processing" } else { "idle" };
                text(format!("queue: {state}, {} pending", status.pending))
            })
        }),
    );

    // /stop: abort the active run and any wait it is parked on
    registry.register(
        cmd("stop", "Stop the run currently executing", "/stop"),
        Arc::new(|ctx, _args| {
            Box::pin(async move {
                ctx.approvals.cancel(&ctx.conversation_key);
                if ctx.queue.abort(&ctx.conversation_key) {
                    text("⏹️ Stopped the current run.")
                } else {
                    text("Nothing is running.")
                }
            })
        }),
    );

    // /jobs: list scheduled jobs
    registry.register(
        cmd("jobs", "List scheduled jobs", "/jobs"),
        Arc::new(|ctx, _args| {
            Box::pin(async move {
                let jobs = ctx.scheduler.list().await;
                if jobs.is_empty() {
                    return text("no scheduled jobs");
                }
                let listing = jobs
                    .iter()
                    .map(|j| {
                        let next = j
                            .next_run
                            .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
                            .unwrap_or_else(|| "-".into());
                        format!("  {}: {} (next: {next}, runs: {})", j.id, j.description, j.run_count)
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                text(format!("scheduled jobs ({}):\n{listing}", jobs.len()))
            })
        }),
    );

    // /cancel <id>: cancel a scheduled job
    registry.register(
        cmd("cancel", "Cancel a scheduled job", "/cancel <job_id>"),
        Arc::new(|ctx, args| {
            Box::pin(async move {
                let Some(job_id) = args.args.first() else {
                    return text("usage: /cancel <job_id>");
                };
                if ctx.scheduler.cancel(job_id).await {
                    text(format!("cancelled job: {job_id}"))
                } else {
                    text(format!("no job with id: {job_id}"))
                }
            })
        }),
    );

    // /new: archive the transcript and start fresh
    registry.register(
        cmd("new", "Start a new conversation", "/new"),
        Arc::new(|ctx, _args| {
            Box::pin(async move {
                let archived = ctx
                    .transcripts
                    .reset(&ctx.conversation_key)
                    .await
                    .map_err(|e| SlashError::Handler(format!("reset transcript: {e}")))?;
                if archived {
                    text("🆕 Started a new conversation.")
                } else {
                    text("🆕 Already a fresh conversation.")
                }
            })
        }),
    );

    // /help
    registry.register(
        cmd("help", "List available slash commands", "/help"),
        Arc::new(|_ctx, _args| {
            Box::pin(async move {
                let lines = [
                    "/status          Show coordinator status",
                    "/queue           Show this conversation's queue",
                    "/stop            Stop the run currently executing",
                    "/jobs            List scheduled jobs",
                    "/cancel <id>     Cancel a scheduled job",
                    "/new             Start a new conversation",
                    "/help            Show this help message",
                ];
                text(lines.join("\n"))
            })
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_splits_name_and_args() {
        let (name, args) = parse("  /cancel job_1  extra ").unwrap();
        assert_eq!(name, "cancel");
        assert_eq!(args.raw, "job_1  extra");
        assert_eq!(args.args, vec!["job_1", "extra"]);
    }

    #[test]
    fn parse_rejects_plain_text() {
        assert!(parse("hello").is_none());
        assert!(parse("/").is_none());
        assert!(parse("/   ").is_none());
    }

    #[test]
    fn unknown_commands_are_not_commands() {
        let registry = Registry::with_builtins();
        assert!(registry.is_command("/status"));
        assert!(registry.is_command("/cancel job_1"));
        assert!(!registry.is_command("/etc/hosts is a file"));
        assert!(!registry.is_command("status"));
    }

    #[test]
    fn builtins_are_listed_sorted() {
        let names: Vec<String> = Registry::with_builtins().list().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["cancel", "help", "jobs", "new", "queue", "status", "stop"]);
    }
}
