use std::sync::Arc;

use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voxcast_server::directory::UuidDirectory;
use voxcast_server::engine::inproc::InProcEngine;
use voxcast_server::state::Config;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voxcast_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Voxcast SFU server...");

    let config = Config::load()?;

    // The in-process engine stands in for a native media engine during
    // development; production deployments supply their own.
    let engine = Arc::new(InProcEngine::new());
    let directory = Arc::new(UuidDirectory);
    let (app, _state) = voxcast_server::create_app(config.clone(), engine, directory).await?;

    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    tracing::info!("Listening on {}", config.bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
