mod handlers;
mod routes;

use anyhow::{Context, Result};
use axum::Router;
use gauntlet_common::config::EngineConfig;
use gauntlet_engine::{ExecutionQueue, GradingOrchestrator, RuntimeConfigManager};
use std::path::Path;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::info;

#[derive(Clone)]
pub struct AppState {
    pub queue: ExecutionQueue,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    info!("Gauntlet ops server booting...");

    let config = EngineConfig::from_env();
    let runtime_configs = RuntimeConfigManager::load_or_builtin(Path::new(&config.runtime_config_path))?;
    info!("Loaded runtime configurations for: {:?}", runtime_configs.list_runtimes());

    let orchestrator = GradingOrchestrator::new(config, &runtime_configs)?;
    let state = Arc::new(AppState {
        queue: ExecutionQueue::new(orchestrator),
    });

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = std::env::var("GAUNTLET_OPS_ADDR").unwrap_or_else(|_| "0.0.0.0:3001".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Ops server listening on {}", addr);

    axum::serve(listener, app).await.context("Server error")?;
    Ok(())
}
