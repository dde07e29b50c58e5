use std::collections::HashSet;
use std::io;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::backend::{with_retry, BackendEventStream, ChatBackend};
use crate::chat_types::{ChatCompletionRequest, ChatCompletionResponse, ModelCard, ModelList};
use crate::config::RetryConfig;
use crate::db::{ExchangeDirection, ExchangeLog};
use crate::errors::AppError;
use crate::models::{AssistantOutcome, BackendEvent, ToolDefinition, Usage, WireRequest};
use crate::service::request_builder::{build_backend_request, validate_history};
use crate::service::response_transformer::{build_response, completion_id, transform_reply};
use crate::service::stream_transformer::{error_frame, sse_frame, StreamTransformer, DONE_FRAME};
use crate::service::tool_results::adapt_tool_results;
use crate::session::{SessionHandle, SessionManager};

const STREAM_BUFFER: usize = 64;

pub type ByteStream = ReceiverStream<Result<Bytes, io::Error>>;

pub enum ChatReply {
    Complete(ChatCompletionResponse),
    /// Server-sent event frames, ending with `[DONE]`.
    Stream(ByteStream),
}

/// Everything one exchange needs once the session is resolved.
struct PreparedExchange {
    handle: SessionHandle,
    request: WireRequest,
    tools: Arc<[ToolDefinition]>,
    model: String,
}

#[derive(Clone)]
pub struct ChatService {
    sessions: SessionManager,
    backend: Arc<dyn ChatBackend>,
    exchange_log: Arc<dyn ExchangeLog>,
    retry: RetryConfig,
    models: Arc<[String]>,
}

impl ChatService {
    pub fn new(
        sessions: SessionManager,
        backend: Arc<dyn ChatBackend>,
        exchange_log: Arc<dyn ExchangeLog>,
        retry: RetryConfig,
        models: Vec<String>,
    ) -> Self {
        Self { sessions, backend, exchange_log, retry, models: models.into() }
    }

    pub fn list_models(&self) -> ModelList {
        ModelList {
            object: "list",
            data: self
                .models
                .iter()
                .map(|id| ModelCard { id: id.clone(), object: "model", owned_by: "chat_relay" })
                .collect(),
        }
    }

    pub async fn complete(&self, request: ChatCompletionRequest) -> Result<ChatReply, AppError> {
        let stream = request.stream;
        let prepared = self.prepare(request).await?;

        if stream {
            self.complete_streaming(prepared).await.map(ChatReply::Stream)
        } else {
            self.complete_blocking(prepared).await.map(ChatReply::Complete)
        }
    }

    async fn prepare(&self, request: ChatCompletionRequest) -> Result<PreparedExchange, AppError> {
        // ── Validation ────────────────────────────────────────────────────────
        validate_history(&request.messages)?;
        let tools = tool_definitions(&request)?;
        let model = self.resolve_model(request.model)?;

        // ── Session ───────────────────────────────────────────────────────────
        let messages = adapt_tool_results(request.messages);
        let handle = self.sessions.resolve(&messages).await?;

        // ── Outbound request ──────────────────────────────────────────────────
        let wire =
            build_backend_request(&messages, &tools, &handle.session, &model, request.stream)?;
        debug!(
            session_id = %handle.session.session_id,
            chat_id = %wire.chat_id,
            new_session = handle.is_new,
            first_exchange = handle.is_first_exchange(),
            wire_messages = wire.messages.len(),
            tools = tools.len(),
            "Prepared backend request"
        );
        self.audit(&handle.session.session_id, ExchangeDirection::Request, &wire).await;

        Ok(PreparedExchange { handle, request: wire, tools, model })
    }

    fn resolve_model(&self, requested: String) -> Result<String, AppError> {
        if !requested.trim().is_empty() {
            return Ok(requested);
        }
        self.models
            .first()
            .cloned()
            .ok_or_else(|| AppError::invalid_request("model must be specified"))
    }

    async fn complete_blocking(
        &self,
        prepared: PreparedExchange,
    ) -> Result<ChatCompletionResponse, AppError> {
        let PreparedExchange { handle, request, tools, model } = prepared;

        let reply =
            with_retry(&self.retry, "exchange", |_| self.backend.exchange(&request)).await?;
        let outcome = transform_reply(&reply.content, &tools);
        self.sessions.commit(&handle, &reply.message_id, &outcome).await?;

        let response = build_response(completion_id(), &model, &outcome, reply.usage);
        info!(
            session_id = %handle.session.session_id,
            finish_reason = ?outcome.finish_reason,
            "Completed exchange"
        );
        self.audit(&handle.session.session_id, ExchangeDirection::Response, &response).await;
        Ok(response)
    }

    /// Opens the backend stream (retried, since nothing reached the client
    /// yet) and hands it to a relay task.
    async fn complete_streaming(&self, prepared: PreparedExchange) -> Result<ByteStream, AppError> {
        let events = with_retry(&self.retry, "exchange_stream", |_| {
            self.backend.exchange_stream(&prepared.request)
        })
        .await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let service = self.clone();
        tokio::spawn(async move {
            service.relay(prepared, events, tx).await;
        });
        Ok(ReceiverStream::new(rx))
    }

    /// Forwards backend events to the client until the backend completes, fails,
    /// or the client goes away. The session only advances on completion.
    async fn relay(
        self,
        prepared: PreparedExchange,
        mut events: BackendEventStream,
        tx: mpsc::Sender<Result<Bytes, io::Error>>,
    ) {
        let PreparedExchange { handle, tools, model, .. } = prepared;
        let session_id = handle.session.session_id.clone();
        let mut transformer = StreamTransformer::new(completion_id(), model, tools);

        loop {
            let event = tokio::select! {
                _ = tx.closed() => {
                    info!(session_id = %session_id, "Client disconnected; aborting backend stream");
                    return;
                }
                event = events.next() => event,
            };

            match event {
                Some(Ok(BackendEvent::Delta { content })) => {
                    for chunk in transformer.push_delta(&content) {
                        if send_chunk(&tx, &chunk).await.is_err() {
                            return;
                        }
                    }
                }
                Some(Ok(BackendEvent::Done { message_id, usage })) => {
                    let closing = transformer.finish(usage);
                    let outcome = transformer.outcome();
                    if let Err(err) = self.sessions.commit(&handle, &message_id, &outcome).await {
                        error!(
                            session_id = %session_id,
                            "Failed to commit streamed exchange: {err}"
                        );
                        fail(&tx, &err).await;
                        return;
                    }
                    for chunk in &closing {
                        if send_chunk(&tx, chunk).await.is_err() {
                            return;
                        }
                    }
                    let _ = tx.send(Ok(Bytes::from_static(DONE_FRAME))).await;

                    info!(
                        session_id = %session_id,
                        finish_reason = ?outcome.finish_reason,
                        "Completed streamed exchange"
                    );
                    let summary = outcome_summary(&outcome, usage);
                    self.audit(&session_id, ExchangeDirection::Response, &summary).await;
                    return;
                }
                Some(Ok(BackendEvent::Error { message })) => {
                    warn!(session_id = %session_id, "Backend reported a stream error: {message}");
                    fail(&tx, &AppError::BackendUnavailable { message }).await;
                    return;
                }
                Some(Err(err)) => {
                    warn!(session_id = %session_id, "Backend stream failed: {err}");
                    fail(&tx, &err).await;
                    return;
                }
                None => {
                    let err = AppError::BackendProtocol {
                        message: "stream ended before completion".to_string(),
                    };
                    warn!(session_id = %session_id, "{err}");
                    fail(&tx, &err).await;
                    return;
                }
            }
        }
    }

    /// Audit records never affect the response.
    async fn audit<T: serde::Serialize>(
        &self,
        session_id: &str,
        direction: ExchangeDirection,
        payload: &T,
    ) {
        let value = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                error!(session_id, "Failed to encode audit payload: {e}");
                return;
            }
        };
        if let Err(e) = self.exchange_log.record(session_id, direction, &value).await {
            error!(session_id, direction = direction.as_str(), "Failed to record exchange: {e}");
        }
    }
}

/// Converts client tool specs, rejecting names that cannot serve as XML tags.
fn tool_definitions(request: &ChatCompletionRequest) -> Result<Arc<[ToolDefinition]>, AppError> {
    let mut seen = HashSet::new();
    let mut tools = Vec::with_capacity(request.tools.len());

    for spec in &request.tools {
        let name = spec.function.name.as_str();
        if !is_tag_name(name) {
            return Err(AppError::invalid_request(format!("invalid tool name {name:?}")));
        }
        if !seen.insert(name) {
            return Err(AppError::invalid_request(format!("duplicate tool name {name:?}")));
        }
        tools.push(spec.to_definition());
    }
    Ok(tools.into())
}

fn is_tag_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

fn outcome_summary(outcome: &AssistantOutcome, usage: Option<Usage>) -> serde_json::Value {
    json!({
        "content": outcome.content,
        "tool_call": outcome.tool_call.as_ref().map(|call| json!({
            "id": call.id,
            "name": call.name,
            "arguments": call.arguments,
        })),
        "finish_reason": outcome.finish_reason,
        "usage": usage,
    })
}

async fn send_chunk<T: serde::Serialize>(
    tx: &mpsc::Sender<Result<Bytes, io::Error>>,
    chunk: &T,
) -> Result<(), ()> {
    let frame = match sse_frame(chunk) {
        Ok(frame) => frame,
        Err(err) => {
            error!("{err}");
            fail(tx, &err).await;
            return Err(());
        }
    };
    tx.send(Ok(frame)).await.map_err(|_| {
        debug!("Client receiver dropped");
    })
}

async fn fail(tx: &mpsc::Sender<Result<Bytes, io::Error>>, err: &AppError) {
    if tx.send(Ok(error_frame(err))).await.is_ok() {
        let _ = tx.send(Ok(Bytes::from_static(DONE_FRAME))).await;
    }
}
