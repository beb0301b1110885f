//! Prompt text and reply parsing for approval waits.

use crate::utils::truncate_str;

/// Tool input is shown inline only below this size.
const INLINE_INPUT_LIMIT: usize = 500;

/// Build the permission prompt for a sensitive tool call.
pub fn permission_prompt(tool: &str, input: &serde_json::Value) -> String {
    let mut prompt = format!("🔐 Permission request\n\nThe assistant wants to use: {tool}");
    if let Ok(rendered) = serde_json::to_string_pretty(input) {
        if rendered.len() < INLINE_INPUT_LIMIT {
            prompt.push_str("\n\n");
            prompt.push_str(&rendered);
        }
    }
    prompt.push_str("\n\nReply Y to allow, N to deny");
    prompt
}

/// True when `reply` grants permission.  Anything unrecognised denies.
pub fn parse_permission(reply: &str) -> bool {
    matches!(
        reply.trim().to_lowercase().as_str(),
        "y" | "yes" | "s" | "sim" | "ok" | "allow"
    )
}

/// Build a multiple-choice clarification prompt.
pub fn question_prompt(question: &str, options: &[String]) -> String {
    let mut prompt = format!("❓ {question}");
    if !options.is_empty() {
        prompt.push('\n');
        for (i, option) in options.iter().enumerate() {
            prompt.push_str(&format!("\n{}. {}", i + 1, truncate_str(option, 200)));
        }
        prompt.push_str("\n\nReply with a number or type your own answer");
    }
    prompt
}

/// Map a numeric reply to its option label; free text passes through.
pub fn parse_choice(reply: &str, options: &[String]) -> String {
    let trimmed = reply.trim();
    trimmed
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|i| options.get(i))
        .cloned()
        .unwrap_or_else(|| trimmed.to_string())
}
