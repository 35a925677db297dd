pub mod admin;
pub mod agents;
pub mod auth;
pub mod backends;
pub mod commands;
pub mod nodes;
pub mod sync;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;

use nacc_protocol::ErrorEnvelope;

use crate::state::AppState;
use crate::transport::TransportError;

/// Build the full API router. Only `/backends/switch` sits behind the
/// operator token; everything else is open to the orchestrator's callers
/// (the chat UI and CLI front-ends are trusted collaborators).
pub fn router(state: AppState) -> Router {
    let operator = Router::new()
        .route("/backends/switch", post(backends::switch_backend))
        .route_layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_operator_token,
        ));

    Router::new()
        .route("/healthz", get(admin::healthz))
        // Nodes
        .route("/nodes", get(nodes::list_nodes))
        .route("/nodes/:id", get(nodes::get_node))
        .route("/nodes/:id/files", post(nodes::list_node_files))
        // Commands
        .route("/commands/execute", post(commands::execute))
        // Sync
        .route("/sync", post(sync::sync))
        // Agents / backends
        .route("/agents/probe", post(agents::probe))
        .route("/backends", get(backends::list_backends))
        .merge(operator)
        .with_state(state)
}

/// A structured caller error (`{"error":{"kind":"...","message":"..."}}`).
pub(crate) fn caller_error(message: impl Into<String>) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(serde_json::json!({ "error": {
            "kind": "caller_input",
            "message": message.into(),
        }})),
    )
        .into_response()
}

/// Map a transport failure onto the node error-envelope convention.
pub(crate) fn transport_error_response(error: TransportError) -> Response {
    match error {
        TransportError::Tool(e) => {
            let status = StatusCode::from_u16(e.kind.http_status())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (status, Json(ErrorEnvelope::from(e))).into_response()
        }
        TransportError::Timeout(d) => (
            StatusCode::GATEWAY_TIMEOUT,
            Json(serde_json::json!({ "error": {
                "kind": "timeout",
                "message": format!("node call timed out after {d:?}"),
            }})),
        )
            .into_response(),
        TransportError::Cancelled => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(serde_json::json!({ "error": {
                "kind": "internal_error",
                "message": "call cancelled",
            }})),
        )
            .into_response(),
        TransportError::Unavailable(message) => (
            StatusCode::BAD_GATEWAY,
            Json(serde_json::json!({ "error": {
                "kind": "node_unavailable",
                "message": message,
            }})),
        )
            .into_response(),
    }
}
