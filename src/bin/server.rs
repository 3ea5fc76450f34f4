//! taskhive control-plane daemon.
//!
//! Serves the coordination HTTP surface and, when agent profiles are
//! configured, runs the message-routing dispatcher in the same process.
//!
//! # Environment Variables
//!
//! - `HIVE_PORT` — HTTP port (default: 8789)
//! - `HIVE_STORE` — "memory" (default) or "postgres"
//! - `DATABASE_URL` — PostgreSQL connection string (HIVE_STORE=postgres)
//! - `AGENT_PROFILES_PATH` — routing profiles JSON; enables the dispatcher
//! - `WORKFLOWS_PATH` / `CRITIC_CHAINS_PATH` — orchestration config JSON
//! - `RUST_LOG` — tracing filter (default: "info,taskhive=debug")
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin server
//! # or durable:
//! HIVE_STORE=postgres DATABASE_URL=postgres://... cargo run --bin server --features postgres
//! ```

use std::sync::Arc;

use taskhive::routing::{profile, DispatcherConfig, RouteDispatcher};
use taskhive::server::{app_router, AppState};
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

    let state = AppState::new(store.clone(), settings.clone());
    let loaded = state.tracker.load_from_store().await;
    if loaded > 0 {
        tracing::info!(count = loaded, "seeded outcome window from store");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    // Routing dispatcher runs alongside the HTTP surface when profiles
    // are configured.
    if let Some(path) = &settings.profiles_path {
        match profile::load_profiles(path) {
            Ok(profiles) => {
                tracing::info!(count = profiles.len(), "routing dispatcher enabled");
                let dispatcher = RouteDispatcher::new(
                    store.clone(),
                    state.tracker.clone(),
                    profiles,
                    DispatcherConfig {
                        poll_interval: settings.route_poll_interval,
                        score_threshold: settings.score_threshold,
                        fallback_agent: settings.fallback_agent.clone(),
                        ..DispatcherConfig::default()
                    },
                );
                let rx = shutdown_rx.clone();
                tokio::spawn(async move { dispatcher.run(rx).await });
            }
            Err(e) => tracing::error!(error = %e, "agent profiles unreadable, routing disabled"),
        }
    }

    let bind_addr = format!("0.0.0.0:{}", settings.port);
    let app = app_router(state);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "taskhive control plane listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

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
                    tracing::info!("using PostgreSQL store");
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
