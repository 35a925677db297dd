//! Node listing and per-node file access.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};

use nacc_protocol::ListFilesRequest;

use crate::audit::{AuditAction, AuditOutcome, AuditRecord};
use crate::cancel::CancelToken;
use crate::state::AppState;
use crate::transport::ToolCall;

use super::{caller_error, transport_error_response};

const FILES_DEADLINE: std::time::Duration = std::time::Duration::from_secs(60);

/// GET /nodes — every registered node with its health.
pub async fn list_nodes(State(state): State<AppState>) -> impl IntoResponse {
    let nodes = state.registry.snapshot();
    Json(serde_json::json!({
        "nodes": nodes,
        "count": nodes.len(),
    }))
}

/// GET /nodes/{id}
pub async fn get_node(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Some(node) => Json(node).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": {
                "kind": "caller_input",
                "message": format!("unknown node '{id}'"),
            }})),
        )
            .into_response(),
    }
}

/// POST /nodes/{id}/files — ListFiles on one node.
pub async fn list_node_files(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ListFilesRequest>,
) -> Response {
    let Some(transport) = state.registry.transport(&id) else {
        return caller_error(format!("unknown node '{id}'"));
    };

    let cancel = CancelToken::new();
    let result = transport
        .call(ToolCall::ListFiles(req.clone()), FILES_DEADLINE, &cancel)
        .await;

    let outcome = match &result {
        Ok(_) => AuditOutcome::ok(format!("listed '{}'", req.path)),
        Err(e) => AuditOutcome::error(e.to_string()),
    };
    state
        .audit
        .record(AuditRecord::new(AuditAction::ListFiles, &id, outcome).fingerprint_of(&req))
        .await;

    match result.map(|r| r.into_list_files()) {
        Ok(Some(listing)) => Json(listing).into_response(),
        Ok(None) => transport_error_response(crate::transport::TransportError::Unavailable(
            "node returned a mismatched reply".into(),
        )),
        Err(e) => transport_error_response(e),
    }
}
