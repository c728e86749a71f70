mod auth;
mod error;
mod handlers;
mod routes;
mod state;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use sandbox_fc::{FirecrackerConfig, FirecrackerFactory};
use sandbox_manager::{ManagerConfig, SandboxManager};

use state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = ManagerConfig::from_env()?;
    let listen_addr = std::env::var("LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    let fc_config = FirecrackerConfig {
        binary_path: config.firecracker_bin.clone(),
        base_dir: config.base_dir.clone(),
        boot_timeout: config.boot_timeout,
    };
    let factory = Arc::new(FirecrackerFactory::new(fc_config));
    let manager = Arc::new(SandboxManager::new(config, factory));
    manager.startup().await?;

    let app = routes::build_router(AppState { manager });

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "facade listening");
    axum::serve(listener, app).await?;

    Ok(())
}
