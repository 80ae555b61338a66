// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Duragraph Core - Durable Graph-Run Control Plane
//!
//! Standalone process: connects to the database, runs migrations, recovers the task queue
//! and keeps the outbox relay and worker liveness monitor running until interrupted.
//! The HTTP API is served by the embedding application.

use std::sync::Arc;

use anyhow::Result;
use sqlx::postgres::PgPoolOptions;
use tracing::{error, info};

use duragraph_core::config::Config;
use duragraph_core::migrations;
use duragraph_core::persistence::{Persistence, PostgresPersistence, SqlitePersistence};
use duragraph_core::runtime::ControlPlaneBuilder;

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("duragraph_core=info".parse()?),
        )
        .init();

    info!("Starting Duragraph Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        base_url = %config.base_url,
        worker_liveness_secs = config.worker_liveness.as_secs(),
        relay_interval_ms = config.relay_interval.as_millis() as u64,
        backend = if config.is_sqlite() { "sqlite" } else { "postgres" },
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let persistence: Arc<dyn Persistence> = if config.is_sqlite() {
        // Migrations run on connect.
        Arc::new(SqlitePersistence::connect(&config.database_url, config.max_db_connections).await?)
    } else {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_db_connections)
            .connect(&config.database_url)
            .await?;
        info!("Running database migrations...");
        migrations::run_postgres(&pool).await?;
        info!("Migrations completed");
        Arc::new(PostgresPersistence::new(pool))
    };

    if !persistence.health_check().await? {
        anyhow::bail!("database health check failed");
    }
    info!("Database health check passed");

    let plane = ControlPlaneBuilder::from_config(&config)
        .persistence(persistence)
        .build()?
        .start()
        .await?;

    info!("Duragraph Core initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    plane.shutdown().await?;
    info!("Shutdown complete");

    Ok(())
}
