//! POST /agents/probe — free-form passthrough to the active backend.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use nacc_backends::BackendContext;

use crate::audit::{AuditAction, AuditOutcome, AuditRecord};
use crate::state::AppState;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeRequest {
    pub message: String,
    #[serde(default)]
    pub actor: Option<String>,
}

pub async fn probe(State(state): State<AppState>, Json(req): Json<ProbeRequest>) -> Response {
    let backend = state.backends.snapshot();
    let kind = backend.kind();
    let actor = req.actor.clone().unwrap_or_else(|| "anonymous".into());

    let deadline = backend.timeout() + std::time::Duration::from_secs(1);
    let result = tokio::time::timeout(
        deadline,
        backend.complete(&req.message, &BackendContext::new()),
    )
    .await;

    let (outcome, response) = match result {
        Ok(Ok(completion)) => (
            AuditOutcome::ok("probe completed"),
            Json(serde_json::json!({
                "completion": completion,
                "backend": kind.to_string(),
            }))
            .into_response(),
        ),
        Ok(Err(e)) => (
            AuditOutcome::error(e.to_string()),
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({ "error": {
                    "kind": "backend_failure",
                    "message": e.to_string(),
                }})),
            )
                .into_response(),
        ),
        Err(_) => (
            AuditOutcome::error("backend exceeded its declared timeout"),
            (
                StatusCode::GATEWAY_TIMEOUT,
                Json(serde_json::json!({ "error": {
                    "kind": "backend_failure",
                    "message": "backend exceeded its declared timeout",
                }})),
            )
                .into_response(),
        ),
    };

    state
        .audit
        .record(
            AuditRecord::new(AuditAction::AgentProbe, kind.to_string(), outcome)
                .actor(&actor)
                .fingerprint_of(&req),
        )
        .await;

    response
}
