#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header::CONTENT_TYPE, Request, StatusCode};
use axum::Router;
use futures_util::stream::{self, StreamExt};
use serde_json::Value;
use tower::ServiceExt;

use chat_relay::backend::{BackendEventStream, ChatBackend};
use chat_relay::build_router;
use chat_relay::config::RetryConfig;
use chat_relay::db::{MemoryExchangeLog, MemorySessionStore};
use chat_relay::errors::AppError;
use chat_relay::models::{BackendEvent, BackendReply, WireRequest};
use chat_relay::service::ChatService;
use chat_relay::session::SessionManager;

/// In-process backend that replays scripted replies and records every request.
#[derive(Default)]
pub struct ScriptedBackend {
    chats_created: AtomicU32,
    replies: Mutex<VecDeque<Result<BackendReply, AppError>>>,
    streams: Mutex<VecDeque<BackendEventStream>>,
    requests: Mutex<Vec<WireRequest>>,
}

impl ScriptedBackend {
    pub fn push_reply(&self, message_id: &str, content: &str) {
        self.replies.lock().unwrap().push_back(Ok(BackendReply {
            message_id: message_id.to_string(),
            content: content.to_string(),
            usage: None,
        }));
    }

    pub fn push_failure(&self, err: AppError) {
        self.replies.lock().unwrap().push_back(Err(err));
    }

    pub fn push_stream(&self, events: Vec<Result<BackendEvent, AppError>>) {
        self.push_event_stream(stream::iter(events).boxed());
    }

    pub fn push_event_stream(&self, events: BackendEventStream) {
        self.streams.lock().unwrap().push_back(events);
    }

    pub fn requests(&self) -> Vec<WireRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn chats_created(&self) -> u32 {
        self.chats_created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChatBackend for ScriptedBackend {
    async fn create_chat(&self) -> Result<String, AppError> {
        let n = self.chats_created.fetch_add(1, Ordering::SeqCst);
        Ok(format!("chat-{n}"))
    }

    async fn exchange(&self, request: &WireRequest) -> Result<BackendReply, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        self.replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(AppError::Unexpected("no scripted reply".into())))
    }

    async fn exchange_stream(&self, request: &WireRequest) -> Result<BackendEventStream, AppError> {
        self.requests.lock().unwrap().push(request.clone());
        self.streams
            .lock()
            .unwrap()
            .pop_front()
            .ok_or_else(|| AppError::Unexpected("no scripted stream".into()))
    }
}

pub struct TestGateway {
    pub app: Router,
    pub backend: Arc<ScriptedBackend>,
    pub store: Arc<MemorySessionStore>,
    pub exchange_log: Arc<MemoryExchangeLog>,
}

impl TestGateway {
    pub fn new() -> Self {
        let backend = Arc::new(ScriptedBackend::default());
        let ttl = chrono::Duration::hours(1);
        let store = Arc::new(MemorySessionStore::new(ttl));
        let exchange_log = Arc::new(MemoryExchangeLog::new());
        let retry = RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
            backoff_multiplier: 2.0,
            jitter_factor: 0.0,
        };

        let sessions = SessionManager::new(store.clone(), backend.clone(), retry.clone(), ttl);
        let service = ChatService::new(
            sessions,
            backend.clone(),
            exchange_log.clone(),
            retry,
            vec!["relay-1".to_string()],
        );

        Self { app: build_router(service), backend, store, exchange_log }
    }

    pub async fn post_json(&self, uri: &str, body: Value) -> (StatusCode, Option<String>, Vec<u8>) {
        self.send(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header(CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
        )
        .await
    }

    pub async fn get(&self, uri: &str) -> (StatusCode, Option<String>, Vec<u8>) {
        self.send(Request::builder().uri(uri).body(Body::empty()).unwrap()).await
    }

    /// Posts `body` and hands back the response body undrained.
    pub async fn open_stream(&self, uri: &str, body: Value) -> (StatusCode, Body) {
        let request = Request::builder()
            .method("POST")
            .uri(uri)
            .header(CONTENT_TYPE, "application/json")
            .body(Body::from(serde_json::to_string(&body).unwrap()))
            .unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        (response.status(), response.into_body())
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Option<String>, Vec<u8>) {
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, content_type, body.to_vec())
    }
}

/// Sets its flag when dropped, to observe when a backend stream is released.
pub struct DropFlag(Arc<AtomicBool>);

impl DropFlag {
    pub fn new() -> (Self, Arc<AtomicBool>) {
        let flag = Arc::new(AtomicBool::new(false));
        (Self(flag.clone()), flag)
    }
}

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

pub fn json_body(body: &[u8]) -> Value {
    serde_json::from_slice(body).unwrap()
}

/// Splits an event-stream body into its `data:` payloads.
pub fn sse_payloads(body: &[u8]) -> Vec<String> {
    std::str::from_utf8(body)
        .unwrap()
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .map(str::to_string)
        .collect()
}
