use std::sync::Arc;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

use chat_relay::backend::{ChatBackend, HttpBackend};
use chat_relay::config::GatewayConfig;
use chat_relay::db::{
    ExchangeLog, MemoryExchangeLog, MemorySessionStore, PgExchangeLog, PgSessionRepository,
    SessionStore,
};
use chat_relay::service::ChatService;
use chat_relay::session::SessionManager;
use chat_relay::{build_router, spawn_session_sweeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present (development convenience)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chat_relay=debug,tower_http=debug".into()),
        )
        .init();

    let config = GatewayConfig::from_env().context("Invalid configuration")?;

    // ── Storage ───────────────────────────────────────────────────────────────
    let (store, exchange_log): (Arc<dyn SessionStore>, Arc<dyn ExchangeLog>) =
        match &config.database_url {
            Some(database_url) => {
                let pool = PgPoolOptions::new()
                    .max_connections(config.database_max_connections)
                    .connect(database_url)
                    .await
                    .context("Failed to connect to PostgreSQL")?;

                sqlx::migrate!("./migrations")
                    .run(&pool)
                    .await
                    .context("Failed to run database migrations")?;

                info!("Database connection established and migrations applied");
                (
                    Arc::new(PgSessionRepository::new(pool.clone(), config.session.ttl))
                        as Arc<dyn SessionStore>,
                    Arc::new(PgExchangeLog::new(pool)) as Arc<dyn ExchangeLog>,
                )
            }
            None => {
                warn!("DATABASE_URL not set; sessions are kept in memory only");
                (
                    Arc::new(MemorySessionStore::new(config.session.ttl)) as Arc<dyn SessionStore>,
                    Arc::new(MemoryExchangeLog::new()) as Arc<dyn ExchangeLog>,
                )
            }
        };

    // ── Dependency wiring ─────────────────────────────────────────────────────
    let backend: Arc<dyn ChatBackend> =
        Arc::new(HttpBackend::new(&config.backend).context("Failed to build backend client")?);
    let sessions = SessionManager::new(
        store.clone(),
        backend.clone(),
        config.retry.clone(),
        config.session.ttl,
    );
    let chat_service = ChatService::new(
        sessions,
        backend,
        exchange_log,
        config.retry.clone(),
        config.models.clone(),
    );

    spawn_session_sweeper(store, config.session.sweep_interval);

    // ── Listen ────────────────────────────────────────────────────────────────
    let app = build_router(chat_service);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(backend = %config.backend.base_url, "Listening on http://{addr}/");

    axum::serve(listener, app).await?;
    Ok(())
}
