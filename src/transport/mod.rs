// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! HTTP + WebSocket transport for the Clawline provider: the media plane
//! (`/version`, `/upload`, `/download/:assetId`) and the WebSocket front
//! door (`/ws`) sharing one port.

pub mod auth;
pub mod http;
pub mod ws;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::ProviderState;

/// Build the axum `Router` serving both the WebSocket front door and the
/// HTTP media plane, behind one shared state.
pub fn build_router(state: Arc<ProviderState>) -> Router {
    Router::new()
        .route("/version", get(http::version))
        .route("/upload", post(http::upload))
        .route("/download/{assetId}", get(http::download))
        .route("/ws", get(ws::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
