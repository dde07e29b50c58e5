//! Outbound side: the session-oriented backend chat service.

pub mod client;
pub mod retry;
pub mod sse;

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::errors::AppError;
use crate::models::{BackendEvent, BackendReply, WireRequest};

pub use client::HttpBackend;
pub use retry::with_retry;

pub type BackendEventStream = BoxStream<'static, Result<BackendEvent, AppError>>;

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Allocates a new backend conversation and returns its handle.
    async fn create_chat(&self) -> Result<String, AppError>;

    /// Exchanges one request for a complete reply.
    async fn exchange(&self, request: &WireRequest) -> Result<BackendReply, AppError>;

    /// Opens a streamed exchange. Dropping the returned stream aborts it.
    async fn exchange_stream(&self, request: &WireRequest)
        -> Result<BackendEventStream, AppError>;
}
