//! Thin HTTP adapter over the Reader Registry (spec §6.3/§6.4). Exposes a
//! range-aware streaming endpoint, a pool status endpoint, and an explicit
//! release endpoint; owns no streaming logic of its own.

pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::pool::SessionPool;
use crate::registry::ReaderRegistry;

/// Shared state handed to every route handler.
pub struct AppState {
    pub registry: Arc<ReaderRegistry>,
    pub pool: Arc<SessionPool>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/media/{id}", get(routes::stream_media))
        .route("/media/{id}/release", post(routes::release_media))
        .route("/status", get(routes::get_status))
        .with_state(state)
}
