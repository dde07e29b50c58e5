use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::debug;

use crate::chat_types::ChatCompletionRequest;
use crate::errors::AppError;
use crate::service::{ChatReply, ChatService};

/// POST `/v1/chat/completions`: JSON reply, or an event stream when
/// `stream` is set.
pub async fn chat_completions_handler(
    State(svc): State<ChatService>,
    payload: Result<Json<ChatCompletionRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload.map_err(|rejection| {
        debug!("Rejected request body: {rejection}");
        AppError::invalid_request(rejection.body_text())
    })?;

    match svc.complete(request).await? {
        ChatReply::Complete(response) => Ok(Json(response).into_response()),
        ChatReply::Stream(frames) => Ok(event_stream_response(Body::from_stream(frames))),
    }
}

/// GET `/v1/models`
pub async fn list_models_handler(State(svc): State<ChatService>) -> impl IntoResponse {
    Json(svc.list_models())
}

/// GET `/health`
pub async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

fn event_stream_response(body: Body) -> Response {
    (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "text/event-stream"),
            (header::CACHE_CONTROL, "no-cache"),
            (header::CONNECTION, "keep-alive"),
        ],
        body,
    )
        .into_response()
}
