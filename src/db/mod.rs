//! Storage collaborators: the session store and the append-only exchange log.
//!
//! Both come in a PostgreSQL flavour (via `sqlx`) and an in-memory flavour used
//! when no database is configured and in tests.

pub mod exchange_repository;
pub mod memory;
pub mod session_repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::errors::AppError;
use crate::models::{Session, SessionKey};

pub use exchange_repository::PgExchangeLog;
pub use memory::{MemoryExchangeLog, MemorySessionStore};
pub use session_repository::PgSessionRepository;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fingerprint lookups skip expired sessions and return the most recently
    /// accessed match.
    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, AppError>;

    /// Inserts or updates. `backend_chat_id` and an already-set fingerprint
    /// are never overwritten.
    async fn put(&self, session: &Session) -> Result<(), AppError>;

    /// Refreshes the expiry of a session.
    async fn touch(&self, session_id: &str) -> Result<(), AppError>;

    async fn delete(&self, session_id: &str) -> Result<bool, AppError>;

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeDirection {
    Request,
    Response,
}

impl ExchangeDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeDirection::Request => "request",
            ExchangeDirection::Response => "response",
        }
    }
}

/// Append-only audit trail of payloads. Never read back by the gateway.
#[async_trait]
pub trait ExchangeLog: Send + Sync {
    async fn record(
        &self,
        session_id: &str,
        direction: ExchangeDirection,
        payload: &Value,
    ) -> Result<(), AppError>;
}
