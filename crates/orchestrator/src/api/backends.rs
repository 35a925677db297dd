//! Backend listing and the atomic switch.

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use nacc_backends::build_backend;
use nacc_domain::config::BackendConfig;

use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct BackendStatus {
    pub kind: String,
    pub timeout_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    pub active: bool,
    /// Whether the variant constructs from its configuration (missing env
    /// secrets and malformed parameters show up here).
    pub available: bool,
}

/// GET /backends — configured variants with availability.
pub async fn list_backends(State(state): State<AppState>) -> impl IntoResponse {
    let active = state.backends.current_config();
    let active_value = serde_json::to_value(&active).ok();

    let mut variants = vec![active.clone()];
    for variant in &state.config.backend_variants {
        if serde_json::to_value(variant).ok() != active_value {
            variants.push(variant.clone());
        }
    }

    let statuses: Vec<BackendStatus> = variants
        .iter()
        .map(|cfg| BackendStatus {
            kind: cfg.kind.to_string(),
            timeout_seconds: cfg.timeout_seconds,
            model_name: cfg.model_name.clone(),
            active: serde_json::to_value(cfg).ok() == active_value,
            available: build_backend(cfg).is_ok(),
        })
        .collect();

    Json(serde_json::json!({
        "backends": statuses,
        "count": statuses.len(),
    }))
}

/// POST /backends/switch — construct, probe, then commit or roll back.
pub async fn switch_backend(
    State(state): State<AppState>,
    Json(config): Json<BackendConfig>,
) -> Response {
    match state.backends.switch(config).await {
        Ok(kind) => Json(serde_json::json!({
            "switched": true,
            "backend": kind.to_string(),
        }))
        .into_response(),
        Err(e) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": {
                "kind": "backend_failure",
                "message": e.to_string(),
            }})),
        )
            .into_response(),
    }
}
