use crate::chat_types::{ChatMessage, ChatRole};
use crate::errors::AppError;
use crate::models::{Session, ToolDefinition, WireMessage, WireRequest, WireRole};
use crate::tools::inject_tool_prompt;

/// Rejects histories that cannot produce a backend request.
pub fn validate_history(messages: &[ChatMessage]) -> Result<(), AppError> {
    match messages.last() {
        None => Err(AppError::invalid_request("messages must not be empty")),
        Some(last) if last.role == ChatRole::System => Err(AppError::invalid_request(
            "the last message must not be a system message",
        )),
        Some(_) => Ok(()),
    }
}

/// Builds the outbound request for one exchange.
///
/// The first exchange carries the system instructions (with the tool block
/// injected) followed by the newest message; later exchanges carry only the
/// newest message, chained to the session's current parent reference. The
/// backend keeps everything else server-side.
pub fn build_backend_request(
    messages: &[ChatMessage],
    tools: &[ToolDefinition],
    session: &Session,
    model: &str,
    stream: bool,
) -> Result<WireRequest, AppError> {
    validate_history(messages)?;
    let mut wire_messages = Vec::with_capacity(2);

    if session.is_first_exchange() {
        if let Some(system) = system_instructions(messages, tools) {
            wire_messages.push(WireMessage::system(system));
        }
    }

    if let Some(last) = messages.last() {
        wire_messages.push(WireMessage {
            role: wire_role(last.role),
            content: last.flatten_text(),
            parent_ref: session.current_parent_ref.clone(),
        });
    }

    Ok(WireRequest {
        chat_id: session.backend_chat_id.clone(),
        model: model.to_string(),
        stream,
        messages: wire_messages,
    })
}

/// All system messages joined, with the tool block appended when tools are
/// declared. `None` when there is neither.
fn system_instructions(messages: &[ChatMessage], tools: &[ToolDefinition]) -> Option<String> {
    let system_text = messages
        .iter()
        .filter(|m| m.role == ChatRole::System)
        .map(ChatMessage::flatten_text)
        .filter(|t| !t.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n\n");

    let content = inject_tool_prompt(&system_text, tools);
    (!content.trim().is_empty()).then_some(content)
}

fn wire_role(role: ChatRole) -> WireRole {
    match role {
        ChatRole::System => WireRole::System,
        ChatRole::Assistant => WireRole::Assistant,
        ChatRole::User | ChatRole::Tool => WireRole::User,
    }
}
