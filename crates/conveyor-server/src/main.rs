// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Conveyor orchestrator binary.

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use sqlx::postgres::PgPoolOptions;

use conveyor_core::store::{MemoryStore, PostgresStore};
use conveyor_core::Store;
use conveyor_server::api::{self, AppState};
use conveyor_server::dispatch::RunnerRegistry;
use conveyor_server::pool::TaskPool;
use conveyor_server::state::{MemoryPoolState, PoolStateStore, SharedPoolState};
use conveyor_server::Config;

#[derive(Parser)]
#[command(name = "conveyor-server", about = "Conveyor automation orchestrator")]
struct Cli {
    /// HTTP port (overrides CONVEYOR_PORT)
    #[arg(short, long)]
    port: Option<u16>,

    /// PostgreSQL connection URL (overrides CONVEYOR_DATABASE_URL)
    #[arg(long, env = "CONVEYOR_DATABASE_URL")]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();

    let mut config = Config::from_env()?;
    if let Some(port) = cli.port {
        config.listen_addr = SocketAddr::from(([0, 0, 0, 0], port));
    }
    if let Some(database_url) = cli.database_url {
        config.database_url = database_url;
    }

    tracing::info!("Starting Conveyor server...");

    let (store, shared_state): (Arc<dyn Store>, Option<Arc<SharedPoolState>>) =
        if config.database_url.is_empty() {
            tracing::warn!("no database configured, using the in-memory store");
            (Arc::new(MemoryStore::new()), None)
        } else {
            let pg = PgPoolOptions::new()
                .max_connections(config.db_pool_size)
                .connect(&config.database_url)
                .await?;

            tracing::info!("Running database migrations...");
            PostgresStore::migrate(&pg).await?;
            conveyor_server::state::postgres::migrate(&pg).await?;
            tracing::info!("Database migrations completed.");

            let shared = config
                .ha_mode
                .then(|| Arc::new(SharedPoolState::new(pg.clone())));
            (Arc::new(PostgresStore::new(pg)), shared)
        };

    let state_store: Arc<dyn PoolStateStore> = match shared_state {
        Some(shared) => Arc::new(shared),
        None => Arc::new(MemoryPoolState::new()),
    };

    let registry = Arc::new(RunnerRegistry::new());
    let pool = TaskPool::new(store.clone(), state_store, registry.clone(), config.clone());

    {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run().await });
    }

    let app = api::router(AppState {
        pool,
        store,
        registry,
        config: config.clone(),
    });

    tracing::info!("Conveyor server listening on {}", config.listen_addr);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
