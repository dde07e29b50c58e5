use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};

use crate::chat_types::{ChatCompletionChunk, ChunkChoice, Delta, FunctionDelta, ToolCallDelta};
use crate::errors::AppError;
use crate::models::{AssistantOutcome, FinishReason, ParsedToolCall, ToolDefinition, Usage};
use crate::tools::parser::{
    detect, has_tool_invocation, pending_tag_start, Detection, ToolMatch,
};

/// Stream terminator sent after the last chunk or error frame.
pub const DONE_FRAME: &[u8] = b"data: [DONE]\n\n";

/// Encodes one server-sent event `data:` frame.
pub fn sse_frame<T: Serialize>(value: &T) -> Result<Bytes, AppError> {
    let json = serde_json::to_string(value)
        .map_err(|e| AppError::Unexpected(format!("failed to encode stream frame: {e}")))?;
    Ok(Bytes::from(format!("data: {json}\n\n")))
}

/// Frame reporting a failure after the response has started.
pub fn error_frame(err: &AppError) -> Bytes {
    Bytes::from(format!("data: {}\n\n", err.envelope()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamPhase {
    /// Plain text; forwarded as it arrives.
    Text,
    /// A known opening tag appeared at `start`; nothing is forwarded until it
    /// closes or the stream ends.
    Candidate { start: usize },
    /// A complete call was forwarded. Later text is kept but never sent.
    Emitted,
}

/// Per-response state turning backend text deltas into client chunks.
///
/// Text is released as soon as it cannot be part of a tool tag. Trailing
/// whitespace and partial opening tags (`"<re"` for a `read` tool) are held
/// back, and leading whitespace of the response is dropped, so the delivered
/// content always equals the trimmed content of the non-streaming path.
pub struct StreamTransformer {
    id: String,
    created: i64,
    model: String,
    tools: Arc<[ToolDefinition]>,
    accumulated: String,
    /// Byte offset in `accumulated` up to which text has been forwarded or
    /// dropped.
    released: usize,
    sent_content: String,
    phase: StreamPhase,
    role_sent: bool,
    tool_call: Option<ParsedToolCall>,
    finish_reason: FinishReason,
}

impl StreamTransformer {
    pub fn new(id: String, model: String, tools: Arc<[ToolDefinition]>) -> Self {
        Self {
            id,
            created: Utc::now().timestamp(),
            model,
            tools,
            accumulated: String::new(),
            released: 0,
            sent_content: String::new(),
            phase: StreamPhase::Text,
            role_sent: false,
            tool_call: None,
            finish_reason: FinishReason::Stop,
        }
    }

    /// Feeds one backend text delta and returns the chunks to forward.
    pub fn push_delta(&mut self, delta: &str) -> Vec<ChatCompletionChunk> {
        if delta.is_empty() {
            return Vec::new();
        }
        self.accumulated.push_str(delta);
        if self.phase == StreamPhase::Emitted {
            return Vec::new();
        }

        if !self.tools.is_empty() {
            match detect(&self.accumulated, &self.tools) {
                Detection::Complete(found) => return self.emit_call(found),
                Detection::Candidate { start } => {
                    if self.phase == StreamPhase::Text {
                        debug!(offset = start, "Possible tool call opened; buffering");
                    }
                    self.phase = StreamPhase::Candidate { start };
                    return Vec::new();
                }
                Detection::None => {}
            }
        }

        let limit = pending_tag_start(&self.accumulated, &self.tools)
            .unwrap_or(self.accumulated.len())
            .max(self.released);
        self.release_until(limit).into_iter().collect()
    }

    /// Closes the response: flushes held text (an unfinished tag becomes plain
    /// content), then the finish chunk, then the usage chunk when known.
    pub fn finish(&mut self, usage: Option<Usage>) -> Vec<ChatCompletionChunk> {
        let mut chunks = Vec::new();

        if self.phase != StreamPhase::Emitted {
            if let StreamPhase::Candidate { .. } = self.phase {
                debug!("Stream ended inside an unfinished tool tag; sending as text");
            }
            let end = self.accumulated.len();
            let rest = self.take_text(end);
            if !rest.is_empty() {
                chunks.push(self.content_chunk(rest));
            }
            self.finish_reason = FinishReason::Stop;
        } else if self.ignored_extra_call() {
            warn!(
                tool = self.tool_call.as_ref().map(|c| c.name.as_str()).unwrap_or_default(),
                "Ignoring additional tool invocation after the first"
            );
        }

        let finish_reason = self.finish_reason;
        chunks.push(self.chunk(Delta::default(), Some(finish_reason)));

        if let Some(usage) = usage {
            chunks.push(ChatCompletionChunk {
                id: self.id.clone(),
                object: "chat.completion.chunk".to_string(),
                created: self.created,
                model: self.model.clone(),
                choices: Vec::new(),
                usage: Some(usage),
            });
        }
        chunks
    }

    /// What the client has been sent so far; complete once [`finish`] ran.
    ///
    /// [`finish`]: StreamTransformer::finish
    pub fn outcome(&self) -> AssistantOutcome {
        let content = if self.tool_call.is_some() && self.sent_content.is_empty() {
            None
        } else {
            Some(self.sent_content.clone())
        };
        AssistantOutcome {
            content,
            tool_call: self.tool_call.clone(),
            finish_reason: self.finish_reason,
        }
    }

    /// True when text after the forwarded call opens another known tool tag.
    /// Only the first call of a turn is honored.
    pub fn ignored_extra_call(&self) -> bool {
        self.phase == StreamPhase::Emitted
            && has_tool_invocation(&self.accumulated[self.released..], &self.tools)
    }

    fn emit_call(&mut self, found: ToolMatch) -> Vec<ChatCompletionChunk> {
        let mut chunks = Vec::with_capacity(3);

        let before = self.take_text(found.start);
        if !before.is_empty() {
            chunks.push(self.content_chunk(before));
        }

        let call = found.call;
        chunks.push(self.chunk(
            Delta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: 0,
                    id: Some(call.id.clone()),
                    kind: Some("function".to_string()),
                    function: FunctionDelta {
                        name: Some(call.name.clone()),
                        arguments: String::new(),
                    },
                }]),
                ..Default::default()
            },
            None,
        ));
        chunks.push(self.chunk(
            Delta {
                tool_calls: Some(vec![ToolCallDelta {
                    index: 0,
                    id: None,
                    kind: None,
                    function: FunctionDelta { name: None, arguments: call.arguments_json() },
                }]),
                ..Default::default()
            },
            None,
        ));

        debug!(tool = %call.name, call_id = %call.id, "Tool call detected in stream");
        self.released = found.end;
        self.tool_call = Some(call);
        self.finish_reason = FinishReason::ToolCall;
        self.phase = StreamPhase::Emitted;
        chunks
    }

    /// Releases text up to `limit`, keeping trailing whitespace back.
    fn release_until(&mut self, limit: usize) -> Option<ChatCompletionChunk> {
        let mut start = self.released;
        if self.sent_content.is_empty() {
            let segment = &self.accumulated[start..limit];
            start += segment.len() - segment.trim_start().len();
            self.released = start;
        }

        let kept = self.accumulated[start..limit].trim_end();
        if kept.is_empty() {
            return None;
        }
        let kept = kept.to_string();
        self.released = start + kept.len();
        Some(self.content_chunk(kept))
    }

    /// Takes all unreleased text before `end`, trimmed the way the final
    /// content is trimmed.
    fn take_text(&mut self, end: usize) -> String {
        let segment = &self.accumulated[self.released..end];
        let segment = if self.sent_content.is_empty() {
            segment.trim()
        } else {
            segment.trim_end()
        };
        let text = segment.to_string();
        self.released = end;
        text
    }

    fn content_chunk(&mut self, text: String) -> ChatCompletionChunk {
        self.sent_content.push_str(&text);
        self.chunk(Delta { content: Some(text), ..Default::default() }, None)
    }

    fn chunk(
        &mut self,
        mut delta: Delta,
        finish_reason: Option<FinishReason>,
    ) -> ChatCompletionChunk {
        if !self.role_sent {
            delta.role = Some("assistant".to_string());
            self.role_sent = true;
        }
        ChatCompletionChunk {
            id: self.id.clone(),
            object: "chat.completion.chunk".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChunkChoice { index: 0, delta, finish_reason }],
            usage: None,
        }
    }
}
