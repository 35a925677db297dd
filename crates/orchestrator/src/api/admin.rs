//! Orchestrator liveness.

use axum::extract::State;
use axum::response::Json;

use crate::state::AppState;

/// GET /healthz — the orchestrator's own liveness signal.
pub async fn healthz(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "nodes": state.registry.len(),
        "backend": state.backends.current_kind().to_string(),
    }))
}
