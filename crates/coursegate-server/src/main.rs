//! # coursegate-server
//!
//! HTTP front end for the progressive content-unlock engine.
//!
//! This binary provides:
//! - **REST API** (axum) for playback progress, gating state, quiz
//!   completion and currency unlocks
//! - **Server-sent events** pushing re-derived gating state when another
//!   session of the same learner makes progress
//! - **Admin API** for crediting coins from external reward flows

mod api;
mod config;
mod error;

use std::sync::Arc;

use anyhow::Context;
use coursegate_engine::catalogue::CatalogueFile;
use coursegate_engine::{Engine, EngineConfig};
use coursegate_store::SqliteProgressStore;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::ServerConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,coursegate_server=debug,coursegate_engine=debug")
        }))
        .init();

    info!("Starting coursegate server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    let engine_config = EngineConfig::from_env();
    info!(?config, "Loaded configuration");
    info!(?engine_config, "Loaded engine configuration");

    // -----------------------------------------------------------------------
    // 3. Open the store and build the engine
    // -----------------------------------------------------------------------
    let store = match &config.database_path {
        Some(path) => SqliteProgressStore::open_at(path)
            .with_context(|| format!("opening database at {}", path.display()))?,
        None => SqliteProgressStore::open_default().context("opening default database")?,
    };
    let engine = Arc::new(Engine::new(Arc::new(store), engine_config));

    if let Some(path) = &config.catalogue_path {
        let raw = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading catalogue {}", path.display()))?;
        let file: CatalogueFile = serde_json::from_str(&raw)
            .with_context(|| format!("parsing catalogue {}", path.display()))?;
        engine.catalogue().import(&file).await?;
        info!(courses = file.courses.len(), path = %path.display(), "Catalogue imported");
    }

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Periodic metadata cache cleanup
    let purger = engine.clone();
    let purge_every = config.cache_purge_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(purge_every);
        loop {
            interval.tick().await;
            purger.purge_caches();
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server (blocks until shutdown)
    // -----------------------------------------------------------------------
    let http_addr = config.http_addr;
    let app_state = AppState {
        engine,
        config: Arc::new(config),
    };

    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
