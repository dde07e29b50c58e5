use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use sqlx::PgPool;
use tracing::error;

use crate::db::{ExchangeDirection, ExchangeLog};
use crate::errors::AppError;

#[derive(Clone)]
pub struct PgExchangeLog {
    pool: PgPool,
}

impl PgExchangeLog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ExchangeLog for PgExchangeLog {
    async fn record(
        &self,
        session_id: &str,
        direction: ExchangeDirection,
        payload: &Value,
    ) -> Result<(), AppError> {
        sqlx::query(
            "INSERT INTO exchange_records (id, session_id, direction, payload, created_at)
             VALUES ($1, $2, $3, $4::jsonb, $5)",
        )
        .bind(uuid::Uuid::new_v4().to_string())
        .bind(session_id)
        .bind(direction.as_str())
        .bind(payload.to_string())
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to record {} for session {session_id}: {e}", direction.as_str());
            AppError::db_query("Failed to record exchange", e)
        })?;
        Ok(())
    }
}
