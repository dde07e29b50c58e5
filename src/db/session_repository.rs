use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;
use tracing::error;

use crate::db::SessionStore;
use crate::errors::AppError;
use crate::models::{Session, SessionKey};

const SESSION_COLUMNS: &str = "session_id, backend_chat_id, current_parent_ref, \
     first_user_message_text, conversation_fingerprint, message_count, \
     created_at, last_accessed_at, expires_at";

#[derive(Clone)]
pub struct PgSessionRepository {
    pool: PgPool,
    ttl: Duration,
}

impl PgSessionRepository {
    pub fn new(pool: PgPool, ttl: Duration) -> Self {
        Self { pool, ttl }
    }
}

#[async_trait]
impl SessionStore for PgSessionRepository {
    async fn get(&self, key: &SessionKey) -> Result<Option<Session>, AppError> {
        let (sql, value) = match key {
            SessionKey::Id(id) => (
                format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE session_id = $1"),
                id,
            ),
            SessionKey::Fingerprint(fp) => (
                format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions
                     WHERE conversation_fingerprint = $1 AND expires_at > NOW()
                     ORDER BY last_accessed_at DESC
                     LIMIT 1"
                ),
                fp,
            ),
        };

        sqlx::query_as::<_, Session>(&sql)
            .bind(value)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to find session {key:?}: {e}");
                AppError::db_query("Failed to find session", e)
            })
    }

    async fn put(&self, session: &Session) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO sessions (session_id, backend_chat_id, current_parent_ref,
                 first_user_message_text, conversation_fingerprint, message_count,
                 created_at, last_accessed_at, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
             ON CONFLICT (session_id) DO UPDATE SET
                 current_parent_ref = EXCLUDED.current_parent_ref,
                 conversation_fingerprint =
                     COALESCE(sessions.conversation_fingerprint, EXCLUDED.conversation_fingerprint),
                 message_count = EXCLUDED.message_count,
                 last_accessed_at = EXCLUDED.last_accessed_at,
                 expires_at = EXCLUDED.expires_at",
        )
        .bind(&session.session_id)
        .bind(&session.backend_chat_id)
        .bind(&session.current_parent_ref)
        .bind(&session.first_user_message_text)
        .bind(&session.conversation_fingerprint)
        .bind(session.message_count)
        .bind(session.created_at)
        .bind(session.last_accessed_at)
        .bind(session.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save session {}: {e}", session.session_id);
            AppError::db_query("Failed to save session", e)
        })?;
        Ok(())
    }

    async fn touch(&self, session_id: &str) -> Result<(), AppError> {
        let now = Utc::now();
        sqlx::query("UPDATE sessions SET last_accessed_at = $1, expires_at = $2 WHERE session_id = $3")
            .bind(now)
            .bind(now + self.ttl)
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to touch session {session_id}: {e}");
                AppError::db_query("Failed to refresh session", e)
            })?;
        Ok(())
    }

    async fn delete(&self, session_id: &str) -> Result<bool, AppError> {
        let result = sqlx::query("DELETE FROM sessions WHERE session_id = $1")
            .bind(session_id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to delete session {session_id}: {e}");
                AppError::db_query("Failed to delete session", e)
            })?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_expired(&self, now: DateTime<Utc>) -> Result<u64, AppError> {
        let result = sqlx::query("DELETE FROM sessions WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to purge expired sessions: {e}");
                AppError::db_query("Failed to purge expired sessions", e)
            })?;
        Ok(result.rows_affected())
    }
}
