//! Messaging and introspection tools.
//!
//! - `send_message { text, platform?, chat_id? }`: defaults to the calling conversation
//! - `broadcast_message { text, targets: [{platform, chat_id}] }`
//! - `list_platforms {}`
//! - `get_queue_status {}`
//! - `get_current_context {}`
//! - `ask_user { question, options? }`: waits for the user's reply

use serde_json::{json, Value};

use super::{str_arg, ToolContext, ToolMeta, Toolbox};
use crate::approval::prompts;
use crate::comm::ChatTarget;

/// `send_message`: deliver text to a chat, the current one by default.
pub async fn send_message(tb: &Toolbox, args: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
    let text = str_arg("send_message", &args, "text")?;
    let target = match (args["platform"].as_str(), args["chat_id"].as_str()) {
        (None, None) => ctx.target.clone(),
        (Some(platform), Some(chat_id)) => ChatTarget::new(platform, chat_id),
        (Some(platform), None) if platform == ctx.target.platform => ctx.target.clone(),
        _ => anyhow::bail!("send_message needs both 'platform' and 'chat_id' to address another chat"),
    };
    tb.transports.send(&target, text).await?;
    Ok(json!({ "status": "sent", "platform": target.platform, "chat_id": target.chat_id }))
}

/// `broadcast_message`: deliver the same text to several chats.  One
/// failing target does not stop the others.
pub async fn broadcast_message(tb: &Toolbox, args: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
    let text = str_arg("broadcast_message", &args, "text")?;
    let targets: Vec<ChatTarget> = args["targets"]
        .as_array()
        .map(|arr| {
            arr.iter()
                .filter_map(|t| {
                    Some(ChatTarget::new(t["platform"].as_str()?, t["chat_id"].as_str()?))
                })
                .collect()
        })
        .unwrap_or_default();
    if targets.is_empty() {
        anyhow::bail!("broadcast_message requires a non-empty 'targets' array of {{platform, chat_id}}");
    }

    let mut results = Vec::with_capacity(targets.len());
    let mut sent = 0usize;
    for target in &targets {
        match tb.transports.send(target, text).await {
            Ok(()) => {
                sent += 1;
                results.push(json!({ "platform": target.platform, "chat_id": target.chat_id, "ok": true }));
            }
            Err(e) => results.push(json!({
                "platform": target.platform,
                "chat_id": target.chat_id,
                "ok": false,
                "error": e.to_string(),
            })),
        }
    }
    Ok(json!({ "sent": sent, "failed": targets.len() - sent, "results": results }))
}

/// `list_platforms`: registered transports and what they support.
pub async fn list_platforms(tb: &Toolbox, _args: Value, _ctx: &ToolContext) -> anyhow::Result<Value> {
    let mut platforms = Vec::new();
    for name in tb.transports.platforms().await {
        let caps = tb.transports.capabilities(&name).await.unwrap_or_default();
        platforms.push(json!({ "platform": name, "capabilities": caps }));
    }
    Ok(json!({ "platforms": platforms }))
}

/// `get_queue_status`: global counters plus this conversation's queue.
pub async fn get_queue_status(tb: &Toolbox, _args: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
    Ok(json!({
        "conversation": tb.queue.status(&ctx.conversation_key),
        "global": tb.queue.stats(),
    }))
}

/// `get_current_context`: who and where this run is for.
pub async fn get_current_context(_tb: &Toolbox, _args: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
    Ok(json!({
        "conversation_key": ctx.conversation_key,
        "platform": ctx.target.platform,
        "chat_id": ctx.target.chat_id,
    }))
}

/// `ask_user`: ask a clarifying question and wait for the answer.
pub async fn ask_user(tb: &Toolbox, args: Value, ctx: &ToolContext) -> anyhow::Result<Value> {
    let question = str_arg("ask_user", &args, "question")?;
    let options: Vec<String> = args["options"]
        .as_array()
        .map(|arr| arr.iter().filter_map(|o| o.as_str().map(String::from)).collect())
        .unwrap_or_default();

    let prompt = prompts::question_prompt(question, &options);
    let reply = tb
        .approvals
        .request_approval(&ctx.conversation_key, &ctx.target, &prompt, tb.policy.approval_timeout)
        .await;

    Ok(match reply {
        Some(reply) => json!({ "answered": true, "answer": prompts::parse_choice(&reply, &options) }),
        None => json!({ "answered": false, "answer": Value::Null }),
    })
}

pub fn metas() -> Vec<ToolMeta> {
    vec![
        ToolMeta {
            name: "send_message".into(),
            description: "Send a message to a chat. Defaults to the current conversation; pass platform and chat_id to address another chat.".into(),
            args_schema: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Message text" },
                    "platform": { "type": "string", "description": "Target platform (e.g. 'discord')" },
                    "chat_id": { "type": "string", "description": "Target chat/channel id" }
                },
                "required": ["text"]
            }),
        },
        ToolMeta {
            name: "broadcast_message".into(),
            description: "Send the same message to several chats across platforms.".into(),
            args_schema: json!({
                "type": "object",
                "properties": {
                    "text": { "type": "string", "description": "Message text" },
                    "targets": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "platform": { "type": "string" },
                                "chat_id": { "type": "string" }
                            },
                            "required": ["platform", "chat_id"]
                        }
                    }
                },
                "required": ["text", "targets"]
            }),
        },
        ToolMeta {
            name: "list_platforms".into(),
            description: "List the chat platforms currently connected and their capabilities.".into(),
            args_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolMeta {
            name: "get_queue_status".into(),
            description: "Show pending work for this conversation and global run counters.".into(),
            args_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolMeta {
            name: "get_current_context".into(),
            description: "Return the conversation key, platform and chat id of the current conversation.".into(),
            args_schema: json!({ "type": "object", "properties": {} }),
        },
        ToolMeta {
            name: "ask_user".into(),
            description: "Ask the user a clarifying question, optionally with numbered options, and wait for the reply.".into(),
            args_schema: json!({
                "type": "object",
                "properties": {
                    "question": { "type": "string" },
                    "options": { "type": "array", "items": { "type": "string" } }
                },
                "required": ["question"]
            }),
        },
    ]
}
