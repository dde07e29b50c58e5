use crate::chat_types::{ChatMessage, ChatRole};

const UNKNOWN_TOOL: &str = "unknown_tool";

/// Rewrites client tool-result entries into ordinary user turns, since the
/// backend has no tool role.
///
/// Each result is restated with the name of the tool from the assistant turn
/// that declared its call id. Consecutive results are merged into a single
/// user message so the newest one is never separated from its siblings.
pub fn adapt_tool_results(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if !messages.iter().any(|m| m.role == ChatRole::Tool) {
        return messages;
    }

    let mut adapted: Vec<ChatMessage> = Vec::with_capacity(messages.len());
    let mut previous_was_tool = false;

    for (index, message) in messages.iter().enumerate() {
        if message.role != ChatRole::Tool {
            adapted.push(message.clone());
            previous_was_tool = false;
            continue;
        }

        let text = restate(message, &messages[..index]);
        match adapted.last_mut() {
            Some(last) if previous_was_tool => {
                let merged = format!("{}\n\n{text}", last.flatten_text());
                *last = ChatMessage::text(ChatRole::User, merged);
            }
            _ => adapted.push(ChatMessage::text(ChatRole::User, text)),
        }
        previous_was_tool = true;
    }

    adapted
}

fn restate(result: &ChatMessage, preceding: &[ChatMessage]) -> String {
    let call_id = result.tool_call_id.as_deref().unwrap_or_default();
    let tool_name = declared_tool_name(call_id, preceding)
        .or(result.name.as_deref())
        .unwrap_or(UNKNOWN_TOOL);
    format!(
        "Result of `{tool_name}` (call `{call_id}`): {}",
        result.flatten_text()
    )
}

fn declared_tool_name<'a>(call_id: &str, preceding: &'a [ChatMessage]) -> Option<&'a str> {
    if call_id.is_empty() {
        return None;
    }
    preceding
        .iter()
        .rev()
        .filter(|m| m.role == ChatRole::Assistant)
        .flat_map(|m| m.tool_calls.iter().flatten())
        .find(|call| call.id == call_id)
        .map(|call| call.function.name.as_str())
}
