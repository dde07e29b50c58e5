use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde_json::Value;
use std::sync::Mutex;

use crate::db::{ExchangeDirection, ExchangeLog, SessionStore};
use crate::errors::AppError;
use crate::models::{Session, SessionKey};

/// Process-local session store.
pub struct MemorySessionStore {
    sessions: DashMap<String, Session>,
    ttl: Duration,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self { sessions: DashMap::new(), ttl }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, AppError> {
        let found = match key {
            SessionKey::Id(id) => self.sessions.get(id).map(|s| s.clone()),
            SessionKey::Fingerprint(fp) => {
                let now = Utc::now();
                self.sessions
                    .iter()
                    .filter(|s| {
                        s.conversation_fingerprint.as_deref() == Some(fp.as_str())
                            && !s.is_expired(now)
                    })
                    .max_by_key(|s| s.last_accessed_at)
                    .map(|s| s.clone())
            }
        };
        Ok(found)
    }

    async fn put(&self, session: &Session) -> Result<(), AppError> {
        self.sessions
            .entry(session.session_id.clone())
            .and_modify(|existing| {
                existing.current_parent_ref = session.current_parent_ref.clone();
                if existing.conversation_fingerprint.is_none() {
                    existing.conversation_fingerprint = session.conversation_fingerprint.clone();
                }
                existing.message_count = session.message_count;
                existing.last_accessed_at = session.last_accessed_at;
                existing.expires_at = session.expires_at;
            })
            .or_insert_with(|| session.clone());
        Ok(())
    }

    async fn touch(&self, session_id: &str) -> Result<(), AppError> {
        if let Some(mut session) = self.sessions.get_mut(session_id) {
            session.touch(self.ttl);
        }
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, AppError> {
        Ok(self.sessions.remove(session_id).is_some())
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let before = self.sessions.len();
        self.sessions.retain(|_, s| !s.is_expired(now));
        Ok((before - self.sessions.len()) as u64)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExchangeRecord {
    pub session_id: String,
    pub direction: ExchangeDirection,
    pub payload: Value,
}

/// Keeps exchange records in memory; handy for inspection in tests.
#[derive(Default)]
pub struct MemoryExchangeLog {
    records: Mutex<Vec<ExchangeRecord>>,
}

impl MemoryExchangeLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ExchangeRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ExchangeLog for MemoryExchangeLog {
    async fn record(
        &self,
        session_id: &str,
        direction: ExchangeDirection,
        payload: &Value,
    ) -> Result<(), AppError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| AppError::Unexpected("exchange log lock poisoned".into()))?;
        records.push(ExchangeRecord {
            session_id: session_id.to_string(),
            direction,
            payload: payload.clone(),
        });
        Ok(())
    }
}
