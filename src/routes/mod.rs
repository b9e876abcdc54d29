pub mod review;

use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

async fn health() -> &'static str {
    "ok"
}

/// Build all routes for the API
pub fn build_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .merge(review::routes())
}

pub fn build_router(state: Arc<AppState>) -> Router {
    build_routes()
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
