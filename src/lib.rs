//! Chat-completions gateway in front of a stateful, session-oriented chat
//! backend.
//!
//! Clients send the whole conversation on every request and may declare
//! function-calling tools. The backend keeps conversation state server-side,
//! expects one new message per exchange chained to a parent reference, and has
//! no native tool support. The gateway bridges the two: it tracks sessions,
//! prompts the backend to invoke tools as XML tags, and turns those tags back
//! into structured tool calls, in both complete and streamed responses.

pub mod backend;
pub mod chat_types;
pub mod config;
pub mod db;
pub mod errors;
pub mod models;
pub mod routes;
pub mod service;
pub mod session;
pub mod tools;

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use crate::db::SessionStore;
use crate::routes::{chat_completions_handler, health_handler, list_models_handler};
use crate::service::ChatService;

pub fn build_router(chat_service: ChatService) -> Router {
    Router::new()
        .route("/v1/chat/completions", post(chat_completions_handler))
        .route("/v1/models", get(list_models_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(chat_service)
}

/// Periodically deletes expired sessions.
pub fn spawn_session_sweeper(store: Arc<dyn SessionStore>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match store.delete_expired(Utc::now()).await {
                Ok(0) => {}
                Ok(removed) => info!(removed, "Swept expired sessions"),
                Err(e) => error!("Session sweep failed: {e}"),
            }
        }
    })
}
