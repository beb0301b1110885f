//! Local stdin/stdout transport used by `clawd console`.
//!
//! Every line read from stdin becomes an inbound turn on a single DM
//! conversation.  Turns are dispatched in the background so that a reply
//! to an approval prompt can be typed while a run is still waiting.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::debug;

use crate::comm::{InboundEvent, Transport};
use crate::coordinator::RunCoordinator;

pub const PLATFORM: &str = "console";
pub const CHAT_ID: &str = "local";

pub struct ConsoleTransport;

#[async_trait]
impl Transport for ConsoleTransport {
    fn platform(&self) -> &str {
        PLATFORM
    }

    async fn send_message(&self, _chat_id: &str, text: &str) -> anyhow::Result<()> {
        let mut out = tokio::io::stdout();
        out.write_all(format!("\n{text}\n\n").as_bytes()).await?;
        out.flush().await?;
        Ok(())
    }
}

/// Build the inbound event for one console line.
pub fn inbound(coordinator: &RunCoordinator, line: &str) -> InboundEvent {
    InboundEvent {
        conversation_key: coordinator.conversation_key(PLATFORM, false, CHAT_ID),
        platform: PLATFORM.to_string(),
        chat_id: CHAT_ID.to_string(),
        sender_id: "console".to_string(),
        text: line.to_string(),
        image: None,
        is_group: false,
        message_ref: None,
    }
}

/// Read stdin until EOF or `/exit`.
pub async fn run(coordinator: RunCoordinator) -> anyhow::Result<()> {
    coordinator.transports().register(Arc::new(ConsoleTransport)).await;

    let mut out = tokio::io::stdout();
    out.write_all(b"clawd console. Type /help for commands, /exit to quit.\n\n")
        .await?;
    out.flush().await?;

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if matches!(line, "/exit" | "/quit") {
            break;
        }
        debug!(len = line.len(), "console input");
        coordinator.dispatch(inbound(&coordinator, line));
    }
    Ok(())
}
