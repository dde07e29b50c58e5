use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, error};

use crate::backend::sse::event_stream;
use crate::backend::{BackendEventStream, ChatBackend};
use crate::config::BackendConfig;
use crate::errors::AppError;
use crate::models::{BackendReply, CreatedChat, WireRequest};

/// reqwest-based client for the backend chat service.
#[derive(Clone)]
pub struct HttpBackend {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpBackend {
    pub fn new(config: &BackendConfig) -> Result<Self, AppError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .read_timeout(config.read_timeout)
            .build()
            .map_err(|e| AppError::Unexpected(format!("Failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            api_key: config.api_key.clone(),
        })
    }

    fn post(&self, path: &str) -> RequestBuilder {
        let builder = self.client.post(format!("{}{path}", self.base_url));
        match &self.api_key {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, AppError> {
        let response = builder.send().await.map_err(map_transport_error)?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|e| format!("<unreadable body: {e}>"));
        error!("Backend answered {status}: {body}");
        Err(map_status_error(status, body))
    }
}

#[async_trait]
impl ChatBackend for HttpBackend {
    async fn create_chat(&self) -> Result<String, AppError> {
        let response = self.send(self.post("/chats").json(&serde_json::json!({}))).await?;
        let created: CreatedChat = response.json().await.map_err(map_transport_error)?;
        debug!(chat_id = %created.chat_id, "Created backend chat");
        Ok(created.chat_id)
    }

    async fn exchange(&self, request: &WireRequest) -> Result<BackendReply, AppError> {
        let path = format!("/chats/{}/messages", request.chat_id);
        let response = self.send(self.post(&path).json(request)).await?;
        response.json().await.map_err(map_transport_error)
    }

    async fn exchange_stream(
        &self,
        request: &WireRequest,
    ) -> Result<BackendEventStream, AppError> {
        let path = format!("/chats/{}/messages", request.chat_id);
        let builder = self
            .post(&path)
            .header("Accept", "text/event-stream")
            .json(request);
        let response = self.send(builder).await?;
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(map_transport_error))
            .boxed();
        Ok(event_stream(bytes))
    }
}

fn map_transport_error(e: reqwest::Error) -> AppError {
    if e.is_timeout() {
        AppError::BackendTimeout { message: e.to_string() }
    } else if e.is_decode() {
        AppError::BackendProtocol { message: e.to_string() }
    } else {
        AppError::BackendUnavailable { message: e.to_string() }
    }
}

fn map_status_error(status: StatusCode, body: String) -> AppError {
    let retryable = status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT;
    if retryable {
        AppError::BackendUnavailable { message: format!("status {status}: {body}") }
    } else {
        AppError::BackendRejected { status: status.as_u16(), message: body }
    }
}
