//! AI backend abstraction.
//!
//! A [`Backend`] turns one run into a stream of [`BackendEvent`]s: text
//! segments interleaved with tool invocations.  Tools are reached through
//! the [`Toolbox`] passed in with an explicit [`ToolContext`] on the
//! request, never through ambient state.  Implementations must stop
//! promptly once the cancellation token fires.

pub mod openai_compat;

use std::pin::Pin;
use std::sync::Arc;

use futures_core::Stream;
use tokio_util::sync::CancellationToken;

use crate::comm::ImagePayload;
use crate::config::BackendConfig;
use crate::session::Exchange;
use crate::tools::{ToolContext, Toolbox};

pub use openai_compat::OpenAiCompatBackend;

/// One item produced by a backend run.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendEvent {
    Text(String),
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        name: String,
        output: serde_json::Value,
    },
    Done,
}

pub type BackendStream<'a> = Pin<Box<dyn Stream<Item = anyhow::Result<BackendEvent>> + Send + 'a>>;

/// Input for one backend run.
#[derive(Debug, Clone)]
pub struct BackendRequest {
    pub run_id: String,
    pub text: String,
    pub image: Option<ImagePayload>,
    /// Recent transcript, oldest first, excluding the current turn.
    pub history: Vec<Exchange>,
    pub context: ToolContext,
}

/// Trait implemented by every AI backend.
pub trait Backend: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn run<'a>(
        &'a self,
        request: BackendRequest,
        tools: Toolbox,
        cancel: CancellationToken,
    ) -> BackendStream<'a>;
}

// ---------------------------------------------------------------------------
// EchoBackend
// ---------------------------------------------------------------------------

/// Replies with the input text.  Useful for wiring checks without a model.
pub struct EchoBackend;

impl Backend for EchoBackend {
    fn name(&self) -> &str {
        "echo"
    }

    fn run<'a>(
        &'a self,
        request: BackendRequest,
        _tools: Toolbox,
        cancel: CancellationToken,
    ) -> BackendStream<'a> {
        Box::pin(async_stream::try_stream! {
            if cancel.is_cancelled() {
                return;
            }
            let mut reply = format!("echo: {}", request.text);
            if request.image.is_some() {
                reply.push_str(" [image]");
            }
            yield BackendEvent::Text(reply);
            yield BackendEvent::Done;
        })
    }
}

/// Build the backend selected in config.
pub fn build_backend(cfg: &BackendConfig) -> anyhow::Result<Arc<dyn Backend>> {
    match cfg.kind.as_str() {
        "echo" => Ok(Arc::new(EchoBackend)),
        "openai-compat" | "openai" => {
            let endpoint = cfg
                .endpoint
                .clone()
                .unwrap_or_else(|| "https://api.openai.com/v1/chat/completions".to_string());
            let api_key = cfg.resolved_api_key().unwrap_or_default();
            let model = cfg.model.clone().unwrap_or_else(|| "gpt-4o-mini".to_string());
            let backend = OpenAiCompatBackend::new(endpoint, api_key, model)?
                .with_system_prompt(cfg.system_prompt.clone())
                .with_max_tool_iterations(cfg.max_tool_iterations);
            Ok(Arc::new(backend))
        }
        other => anyhow::bail!("unknown backend kind '{other}'"),
    }
}
