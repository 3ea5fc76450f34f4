//! taskhive worker daemon.
//!
//! Runs one agent runtime: poll for assigned tasks, claim atomically,
//! execute, heartbeat, and drain gracefully on SIGINT.
//!
//! # Environment Variables
//!
//! - `AGENT_ID` — this agent's identity (default: "worker-1")
//! - `AGENT_NAME` / `AGENT_ROLE` — registration details
//! - `CONTROL_PLANE_URL` — register/heartbeat over HTTP instead of the store
//! - `POLL_INTERVAL_MS` / `HEARTBEAT_INTERVAL_MS` / `NOISE_BUDGET_PER_HOUR`
//! - `HIVE_STORE` / `DATABASE_URL` — storage backend, as for the server

use std::sync::Arc;

use taskhive::runtime::{AckProcessor, WorkerConfig, WorkerRuntime};
use taskhive::store::MemoryStore;
use taskhive::{Settings, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,taskhive=debug".into()),
        )
        .init();

    let settings = Settings::from_env();
    let store = build_store(&settings).await;

    let agent_id = std::env::var("AGENT_ID").unwrap_or_else(|_| "worker-1".to_string());
    let mut config = WorkerConfig::new(agent_id.clone());
    if let Ok(name) = std::env::var("AGENT_NAME") {
        config.name = name;
    }
    if let Ok(role) = std::env::var("AGENT_ROLE") {
        config.role = role;
    }
    config.poll_interval = settings.poll_interval;
    config.heartbeat_interval = settings.heartbeat_interval;
    config.patrol_interval = settings.patrol_interval;
    config.noise_budget_per_hour = settings.noise_budget_per_hour;
    config.control_plane_url = std::env::var("CONTROL_PLANE_URL").ok();

    let runtime = WorkerRuntime::new(config, store, Arc::new(AckProcessor));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    tracing::info!(agent = %agent_id, "worker starting");
    runtime.run(shutdown_rx).await;
    Ok(())
}

async fn build_store(settings: &Settings) -> Arc<dyn Store> {
    #[cfg(feature = "postgres")]
    if settings.store_backend == "postgres" {
        match &settings.database_url {
            Some(url) => match sqlx::PgPool::connect(url).await {
                Ok(pool) => {
                    let store = taskhive::store::postgres::PgStore::new(pool);
                    if let Err(e) = store.migrate().await {
                        tracing::error!(error = %e, "migration failed");
                    }
                    return Arc::new(store);
                }
                Err(e) => {
                    tracing::error!(error = %e, "PostgreSQL unavailable, falling back to memory store");
                }
            },
            None => tracing::warn!("HIVE_STORE=postgres but DATABASE_URL not set"),
        }
    }
    Arc::new(MemoryStore::new())
}
