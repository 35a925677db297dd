//! POST /sync — cross-node synchronization.

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde::Serialize;

use nacc_protocol::{SyncReport, SyncStrategy};

use crate::audit::{AuditAction, AuditOutcome, AuditRecord};
use crate::cancel::CancelToken;
use crate::state::AppState;
use crate::syncer::{self, SyncRequest};

use super::caller_error;

#[derive(Debug, Serialize)]
pub struct SyncResponse {
    pub strategy: SyncStrategy,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub sync_fallback: bool,
    pub reports: Vec<SyncReport>,
}

pub async fn sync(State(state): State<AppState>, Json(req): Json<SyncRequest>) -> Response {
    if req.target_node_ids.is_empty() {
        return caller_error("target_node_ids must not be empty");
    }
    if req.target_node_ids.contains(&req.source_node_id) {
        return caller_error("a node cannot be both source and target");
    }
    let actor = req.actor.clone().unwrap_or_else(|| "anonymous".into());

    let (strategy, sync_fallback) = state
        .planner
        .plan_sync_strategy(
            &format!(
                "sync '{}' from {} to {} target(s)",
                req.source_path,
                req.source_node_id,
                req.target_node_ids.len()
            ),
            req.strategy,
        )
        .await;

    let cancel = CancelToken::new();
    let result =
        syncer::sync_across_nodes(&state.registry, &state.audit, &req, strategy, &cancel).await;

    let outcome = match &result {
        Ok(reports) => {
            let failures = reports.iter().filter(|r| r.error.is_some()).count();
            if failures == 0 {
                AuditOutcome::ok(format!("synced to {} target(s)", reports.len()))
            } else {
                AuditOutcome::error(format!("{failures} of {} target(s) failed", reports.len()))
            }
        }
        Err(e) => AuditOutcome::error(e.to_string()),
    };
    state
        .audit
        .record(
            AuditRecord::new(AuditAction::SyncPath, "*", outcome)
                .actor(&actor)
                .fingerprint_of(&req)
                .detail(serde_json::json!({
                    "strategy": strategy,
                    "sync_fallback": sync_fallback,
                })),
        )
        .await;

    match result {
        Ok(reports) => Json(SyncResponse {
            strategy,
            sync_fallback,
            reports,
        })
        .into_response(),
        Err(e) => caller_error(e.to_string()),
    }
}
