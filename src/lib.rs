//! trendwatch -- trend detection and alerting engine.
//!
//! This crate turns a stream of entity-tagged content items into per-entity
//! rolling baselines, ranked trend scores and deduplicated, safety-gated
//! alerts, with a cron-driven scheduler and a small read API on top.

pub mod aggregate;
pub mod alert;
pub mod api;
pub mod baseline;
pub mod config;
pub mod coordinator;
pub mod ingest;
pub mod scheduler;
pub mod storage;
pub mod trend;

use std::sync::Arc;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::coordinator::Engine;

/// Start the trendwatch daemon: API server and refresh scheduler.
pub async fn serve(config: Config) -> Result<()> {
    // 1. Initialize Storage
    tracing::info!(db_path = %config.storage.db_path.display(), "Initializing database");
    let pool = storage::open_pool(&config.storage.db_path)?;
    storage::prune_history(&pool, config.storage.history_days)?;

    // 2. Initialize Engine
    let engine = Arc::new(Engine::from_config(&config)?.with_pool(pool.clone())?);

    // 3. Start Scheduler Engine (background task)
    let scheduler = scheduler::Scheduler::new(&config.schedule.cron)?;
    let scheduler_engine = Arc::clone(&engine);
    let items_path = config.schedule.items_path.clone();
    tokio::spawn(async move {
        scheduler::run_scheduler_loop(scheduler, scheduler_engine, items_path).await;
    });

    // 4. Start API Server
    let addr: std::net::SocketAddr = config
        .api
        .bind
        .parse()
        .with_context(|| format!("invalid bind address '{}'", config.api.bind))?;
    let app = api::router(api::state::AppState {
        engine,
        pool,
        items_path: config.schedule.items_path.clone(),
    });

    tracing::info!(%addr, "trendwatch listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
