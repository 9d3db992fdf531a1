use std::sync::Arc;

use axum::extract::State;
use axum::Json;

use crate::app::AppState;

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let backend_ok = state.storage.verify().await.is_ok();
    Json(serde_json::json!({
        "status": if backend_ok { "ok" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "backend": backend_ok,
    }))
}
