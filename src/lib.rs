//! clawd: chat-platform router with per-conversation run queues.
//!
//! This library crate re-exports modules so integration tests
//! (under `tests/`) can access them.

pub mod approval;
pub mod backend;
pub mod cli;
pub mod comm;
pub mod config;
pub mod console;
pub mod coordinator;
pub mod discord;
pub mod events;
pub mod gateway;
pub mod queue;
pub mod scheduler;
pub mod session;
pub mod slash;
pub mod tools;
pub mod utils;

/// Return the clawd home directory.
///
/// Resolution order:
/// 1. `CLAWD_HOME` environment variable
/// 2. `$HOME/.clawd`
pub fn clawd_home() -> std::path::PathBuf {
    if let Ok(p) = std::env::var("CLAWD_HOME") {
        std::path::PathBuf::from(p)
    } else {
        dirs::home_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join(".clawd")
    }
}
