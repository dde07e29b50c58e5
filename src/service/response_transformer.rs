use chrono::Utc;

use crate::chat_types::{ChatCompletionResponse, Choice, ResponseMessage, ToolCallPayload};
use crate::models::{AssistantOutcome, FinishReason, ToolDefinition, Usage};
use crate::tools::parse_tool_call;

/// Interprets a complete backend reply.
///
/// With a detected call, content is the text that preceded it (`None` when
/// there was none) and anything after the call is dropped. Without one, the
/// whole reply is the content. Either way surrounding whitespace is trimmed,
/// matching what the streaming path delivers.
pub fn transform_reply(text: &str, tools: &[ToolDefinition]) -> AssistantOutcome {
    let parsed = parse_tool_call(text, tools);
    match parsed.call {
        Some(call) => AssistantOutcome {
            content: Some(parsed.text_before).filter(|t| !t.is_empty()),
            tool_call: Some(call),
            finish_reason: FinishReason::ToolCall,
        },
        None => AssistantOutcome {
            content: Some(text.trim().to_string()),
            tool_call: None,
            finish_reason: FinishReason::Stop,
        },
    }
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn build_response(
    id: String,
    model: &str,
    outcome: &AssistantOutcome,
    usage: Option<Usage>,
) -> ChatCompletionResponse {
    ChatCompletionResponse {
        id,
        object: "chat.completion".to_string(),
        created: Utc::now().timestamp(),
        model: model.to_string(),
        choices: vec![Choice {
            index: 0,
            message: ResponseMessage {
                role: "assistant".to_string(),
                content: outcome.content.clone(),
                tool_calls: outcome
                    .tool_call
                    .as_ref()
                    .map(|call| vec![ToolCallPayload::from(call)]),
            },
            finish_reason: outcome.finish_reason,
        }],
        usage,
    }
}
