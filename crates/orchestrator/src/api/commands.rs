//! POST /commands/execute — the full plan-then-dispatch pipeline.

use std::collections::HashMap;
use std::path::Path as StdPath;

use axum::extract::State;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};

use nacc_protocol::{CommandResult, ExecuteCommandRequest};

use crate::audit::{AuditAction, AuditOutcome, AuditRecord};
use crate::cancel::CancelToken;
use crate::dispatch::dispatch_command;
use crate::planner::{CommandPlanInput, ExecutionPlan};
use crate::state::AppState;

use super::caller_error;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandExecuteRequest {
    pub argv: Vec<String>,
    #[serde(default)]
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    /// Routing hints matched against node tags.
    #[serde(default)]
    pub tag_hints: Vec<String>,
    #[serde(default)]
    pub parallelism: Option<usize>,
    #[serde(default)]
    pub actor: Option<String>,
}

/// The caller always gets a plan plus one result per selected node, so
/// partial success renders without special-casing. Denies come back with an
/// empty selection and a populated verdict.
#[derive(Debug, Serialize)]
pub struct CommandExecuteResponse {
    pub plan: ExecutionPlan,
    pub results: Vec<CommandResult>,
}

pub async fn execute(State(state): State<AppState>, Json(req): Json<CommandExecuteRequest>) -> Response {
    if req.argv.is_empty() {
        return caller_error("argv must not be empty");
    }
    let argv0 = StdPath::new(&req.argv[0])
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let actor = req.actor.clone().unwrap_or_else(|| "anonymous".into());

    // The snapshot the router reasons over is the one dispatch filters by.
    let candidates = state.registry.healthy_snapshot();
    let input = CommandPlanInput {
        description: format!("execute `{}`", req.argv.join(" ")),
        argv0,
        tag_hints: req.tag_hints.clone(),
        parallelism: req.parallelism.unwrap_or(1),
        requested_timeout_seconds: req.timeout_seconds,
    };
    let plan = state.planner.plan_command(&input, &candidates).await;

    if !plan.security_verdict.is_allow() {
        // Exactly one audit record for a denied request.
        state
            .audit
            .record(
                AuditRecord::new(
                    AuditAction::ExecuteCommand,
                    "*",
                    AuditOutcome::error(format!("denied: {:?}", plan.security_verdict)),
                )
                .actor(&actor)
                .fingerprint_of(&req)
                .detail(plan.fallback_detail()),
            )
            .await;
        return Json(CommandExecuteResponse {
            plan,
            results: Vec::new(),
        })
        .into_response();
    }

    let node_request = ExecuteCommandRequest {
        argv: req.argv.clone(),
        cwd: req.cwd.clone(),
        env: req.env.clone(),
        timeout_seconds: req.timeout_seconds,
    };
    let cancel = CancelToken::new();
    let results = dispatch_command(&state.registry, &plan, &node_request, &cancel).await;

    let failures = results.iter().filter(|r| r.error.is_some()).count();
    state
        .audit
        .record(
            AuditRecord::new(
                AuditAction::ExecuteCommand,
                "*",
                if failures == 0 {
                    AuditOutcome::ok(format!("dispatched to {} node(s)", results.len()))
                } else {
                    AuditOutcome::error(format!(
                        "{failures} of {} node(s) failed",
                        results.len()
                    ))
                },
            )
            .actor(&actor)
            .fingerprint_of(&req)
            .detail(plan.fallback_detail()),
        )
        .await;

    Json(CommandExecuteResponse { plan, results }).into_response()
}
