//! Combines the routers of all modules into a single API surface.

use axum::{routing::get, Json, Router};
use std::sync::Arc;

use crate::shared::state::AppState;

pub fn configure_api_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health))
        .merge(crate::directory::configure_directory_routes())
        .merge(crate::learn::configure_learn_routes())
        .merge(crate::analytics::configure_analytics_routes())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}
