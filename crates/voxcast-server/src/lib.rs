//! Voxcast SFU server library
//!
//! Exposes the signaling router and SFU components for testing and
//! embedding.

pub mod directory;
pub mod engine;
pub mod error;
pub mod sfu;
pub mod state;
pub mod ws;

use std::sync::Arc;

use axum::routing::get;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::directory::UserDirectory;
use crate::engine::MediaEngine;
use crate::state::{AppState, Config};

/// Builds the signaling application on top of a media engine and a user
/// directory. The state is returned alongside the router so embedders and
/// tests can reach the managers directly.
pub async fn create_app(
    config: Config,
    engine: Arc<dyn MediaEngine>,
    directory: Arc<dyn UserDirectory>,
) -> anyhow::Result<(axum::Router, AppState)> {
    let state = AppState::new(config, engine, directory).await?;
    let router = axum::Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state.clone());
    Ok((router, state))
}
