//! Backend for any OpenAI-compatible chat completions API.
//!
//! Works with OpenAI itself, OpenRouter, Ollama, Groq, LM Studio, vLLM and
//! friends.  Tools are offered as functions; when the model asks for
//! one, the call goes through the [`Toolbox`] and the result is fed back
//! until the model answers with plain text or the iteration cap is hit.
//!
//! Config example:
//! ```yaml
//! backend:
//!   kind: openai-compat
//!   model: llama3
//!   endpoint: http://localhost:11434/v1/chat/completions
//!   api_key: $OLLAMA_KEY   # optional, some local servers need none
//! ```

use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Backend, BackendEvent, BackendRequest, BackendStream};
use crate::tools::Toolbox;

pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 8;

/// Backend that talks to an OpenAI-compatible chat completions endpoint.
pub struct OpenAiCompatBackend {
    api_key: String,
    endpoint: String,
    model: String,
    system_prompt: Option<String>,
    max_tool_iterations: usize,
    client: Client,
}

/// One tool call requested by the model.
#[derive(Debug, Clone, PartialEq)]
struct ToolCall {
    id: String,
    name: String,
    arguments: Value,
}

impl OpenAiCompatBackend {
    /// `api_key` may be empty for local servers that don't require auth.
    pub fn new(endpoint: String, api_key: String, model: String) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(90))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            api_key,
            endpoint,
            model,
            system_prompt: None,
            max_tool_iterations: DEFAULT_MAX_TOOL_ITERATIONS,
            client,
        })
    }

    pub fn with_system_prompt(mut self, prompt: Option<String>) -> Self {
        self.system_prompt = prompt.filter(|p| !p.trim().is_empty());
        self
    }

    pub fn with_max_tool_iterations(mut self, n: usize) -> Self {
        self.max_tool_iterations = n.max(1);
        self
    }

    fn initial_messages(&self, request: &BackendRequest) -> Vec<Value> {
        let mut messages = Vec::with_capacity(request.history.len() + 2);
        if let Some(prompt) = &self.system_prompt {
            messages.push(json!({ "role": "system", "content": prompt }));
        }
        for exchange in &request.history {
            let role = match exchange.role.as_str() {
                "assistant" => "assistant",
                _ => "user",
            };
            messages.push(json!({ "role": role, "content": exchange.content }));
        }

        let content = match &request.image {
            Some(image) => json!([
                { "type": "text", "text": request.text },
                {
                    "type": "image_url",
                    "image_url": { "url": format!("data:{};base64,{}", image.media_type, image.data) }
                }
            ]),
            None => json!(request.text),
        };
        messages.push(json!({ "role": "user", "content": content }));
        messages
    }

    async fn complete(&self, messages: &[Value], functions: &[Value]) -> anyhow::Result<Value> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if !functions.is_empty() {
            body["tools"] = Value::Array(functions.to_vec());
            body["tool_choice"] = json!("auto");
        }

        let mut req = self.client.post(&self.endpoint).json(&body);
        if !self.api_key.is_empty() {
            req = req.bearer_auth(&self.api_key);
        }
        let resp = req.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            anyhow::bail!("OpenAI-compat API returned {status}: {text}");
        }
        Ok(resp.json().await?)
    }
}

/// Extract tool calls from a completion.  Arguments that fail to parse
/// are passed through as a string so the tool can report the problem.
fn parse_tool_calls(json: &Value) -> Vec<ToolCall> {
    let Some(calls) = json["choices"][0]["message"]["tool_calls"].as_array() else {
        return Vec::new();
    };
    calls
        .iter()
        .filter_map(|tc| {
            let func = tc.get("function")?;
            let name = func.get("name")?.as_str()?.to_string();
            let raw = func.get("arguments").and_then(Value::as_str).unwrap_or("{}");
            let arguments = serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()));
            let id = tc.get("id").and_then(Value::as_str).unwrap_or_default().to_string();
            Some(ToolCall { id, name, arguments })
        })
        .collect()
}

impl Backend for OpenAiCompatBackend {
    fn name(&self) -> &str {
        "openai-compat"
    }

    fn run<'a>(
        &'a self,
        request: BackendRequest,
        tools: Toolbox,
        cancel: CancellationToken,
    ) -> BackendStream<'a> {
        Box::pin(async_stream::try_stream! {
            let functions = tools.definitions();
            let mut messages = self.initial_messages(&request);

            for iteration in 0..self.max_tool_iterations {
                let completion = tokio::select! {
                    _ = cancel.cancelled() => None,
                    res = self.complete(&messages, &functions) => Some(res),
                };
                let Some(completion) = completion else {
                    debug!(run_id = %request.run_id, "backend run cancelled");
                    return;
                };
                let completion = completion?;

                let message = &completion["choices"][0]["message"];
                let content = message["content"].as_str().unwrap_or_default().to_string();
                let calls = parse_tool_calls(&completion);

                if !content.trim().is_empty() {
                    yield BackendEvent::Text(content.clone());
                }
                if calls.is_empty() {
                    yield BackendEvent::Done;
                    return;
                }

                debug!(run_id = %request.run_id, iteration, calls = calls.len(), "model requested tools");
                let assistant_content = if content.is_empty() { Value::Null } else { json!(content) };
                messages.push(json!({
                    "role": "assistant",
                    "content": assistant_content,
                    "tool_calls": message["tool_calls"].clone(),
                }));

                for call in calls {
                    if cancel.is_cancelled() {
                        return;
                    }
                    yield BackendEvent::ToolUse {
                        name: call.name.clone(),
                        input: call.arguments.clone(),
                    };
                    let output = tools.invoke(&call.name, call.arguments, &request.context).await;
                    messages.push(json!({
                        "role": "tool",
                        "tool_call_id": call.id,
                        "content": output.to_string(),
                    }));
                    yield BackendEvent::ToolResult { name: call.name, output };
                }
            }

            warn!(run_id = %request.run_id, limit = self.max_tool_iterations, "tool iteration limit reached");
            yield BackendEvent::Text("I stopped after too many tool calls without reaching an answer.".to_string());
            yield BackendEvent::Done;
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::{ChatTarget, ConversationKey, ImagePayload};
    use crate::session::Exchange;
    use crate::tools::ToolContext;

    fn request(text: &str) -> BackendRequest {
        BackendRequest {
            run_id: "run_test".into(),
            text: text.into(),
            image: None,
            history: vec![Exchange::new("user", "earlier"), Exchange::new("assistant", "reply")],
            context: ToolContext {
                conversation_key: ConversationKey::from("k"),
                target: ChatTarget::new("console", "local"),
            },
        }
    }

    fn backend() -> OpenAiCompatBackend {
        OpenAiCompatBackend::new(
            "http://localhost:11434/v1/chat/completions".into(),
            String::new(),
            "llama3".into(),
        )
        .unwrap()
    }

    #[test]
    fn construct_with_empty_key() {
        let b = backend();
        assert_eq!(b.model, "llama3");
        assert!(b.api_key.is_empty());
        assert_eq!(b.max_tool_iterations, DEFAULT_MAX_TOOL_ITERATIONS);
    }

    #[test]
    fn blank_system_prompt_is_ignored() {
        let b = backend().with_system_prompt(Some("   ".into()));
        assert!(b.system_prompt.is_none());
        let b = backend().with_max_tool_iterations(0);
        assert_eq!(b.max_tool_iterations, 1);
    }

    #[test]
    fn messages_include_system_history_and_turn() {
        let b = backend().with_system_prompt(Some("be brief".into()));
        let msgs = b.initial_messages(&request("now"));
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[0]["role"], "system");
        assert_eq!(msgs[1]["content"], "earlier");
        assert_eq!(msgs[2]["role"], "assistant");
        assert_eq!(msgs[3]["content"], "now");
    }

    #[test]
    fn image_turn_uses_content_parts() {
        let mut req = request("look");
        req.image = Some(ImagePayload {
            data: "aGk=".into(),
            media_type: "image/png".into(),
        });
        let msgs = backend().initial_messages(&req);
        let parts = msgs.last().unwrap()["content"].as_array().unwrap().clone();
        assert_eq!(parts[0]["text"], "look");
        assert_eq!(parts[1]["image_url"]["url"], "data:image/png;base64,aGk=");
    }

    #[test]
    fn parses_tool_calls() {
        let completion = json!({
            "choices": [{
                "message": {
                    "content": null,
                    "tool_calls": [
                        { "id": "c1", "type": "function",
                          "function": { "name": "list_scheduled", "arguments": "{}" } },
                        { "id": "c2", "type": "function",
                          "function": { "name": "cancel_scheduled", "arguments": "not json" } }
                    ]
                }
            }]
        });
        let calls = parse_tool_calls(&completion);
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].name, "list_scheduled");
        assert_eq!(calls[0].arguments, json!({}));
        assert_eq!(calls[1].arguments, json!("not json"));
    }

    #[test]
    fn no_tool_calls_in_plain_answer() {
        let completion = json!({ "choices": [{ "message": { "content": "hi" } }] });
        assert!(parse_tool_calls(&completion).is_empty());
    }
}
