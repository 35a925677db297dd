//! Plan fan-out: at most `parallelism` tool calls in flight, results in
//! plan order, per-node failures as synthetic entries, and a whole-plan
//! wall-clock ceiling that cancels stragglers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use nacc_protocol::{CommandResult, ExecuteCommandRequest};

use crate::cancel::CancelToken;
use crate::planner::ExecutionPlan;
use crate::registry::NodeRegistry;
use crate::transport::{ToolCall, TransportError};

/// Added to the exec timeout to form the whole-plan ceiling.
pub const PLAN_CEILING_SLACK: Duration = Duration::from_secs(10);

/// Grace allowed for cancelled calls to settle after the ceiling fires.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Fan an allowed plan out across its selected nodes.
///
/// The returned vector always has one entry per selected node, in
/// `selected_node_ids` order, independent of completion order.
pub async fn dispatch_command(
    registry: &NodeRegistry,
    plan: &ExecutionPlan,
    request: &ExecuteCommandRequest,
    cancel: &CancelToken,
) -> Vec<CommandResult> {
    let node_count = plan.selected_node_ids.len();
    if node_count == 0 {
        return Vec::new();
    }

    let timeout = Duration::from_secs(plan.exec_profile.timeout_seconds);
    // The node enforces the command timeout itself; the transport deadline
    // covers the kill grace and the round trip on top of it.
    let call_deadline = timeout + PLAN_CEILING_SLACK;
    let ceiling = timeout + PLAN_CEILING_SLACK;

    // Profile env overrides the caller's on key collisions.
    let mut env: HashMap<String, String> = request.env.clone();
    env.extend(plan.exec_profile.env.clone());

    let plan_cancel = cancel.child();
    let semaphore = Arc::new(Semaphore::new(plan.parallelism.max(1)));
    let mut set: JoinSet<(usize, CommandResult)> = JoinSet::new();

    for (index, node_id) in plan.selected_node_ids.iter().enumerate() {
        let node_id = node_id.clone();
        let transport = registry.transport(&node_id);
        let semaphore = semaphore.clone();
        let plan_cancel = plan_cancel.clone();
        let node_request = ExecuteCommandRequest {
            argv: request.argv.clone(),
            cwd: request.cwd.clone(),
            env: env.clone(),
            timeout_seconds: Some(plan.exec_profile.timeout_seconds),
        };

        set.spawn(async move {
            let _permit = match semaphore.acquire().await {
                Ok(p) => p,
                Err(_) => {
                    return (
                        index,
                        CommandResult::synthetic(&node_id, "dispatch aborted"),
                    )
                }
            };

            let Some(transport) = transport else {
                return (
                    index,
                    CommandResult::synthetic(&node_id, "node is not registered"),
                );
            };

            let result = transport
                .call(
                    ToolCall::ExecuteCommand(node_request),
                    call_deadline,
                    &plan_cancel,
                )
                .await;

            let entry = match result {
                Ok(reply) => reply.into_command().unwrap_or_else(|| {
                    CommandResult::synthetic(&node_id, "node returned a mismatched reply")
                }),
                Err(TransportError::Tool(e)) => {
                    CommandResult::synthetic(&node_id, e.to_string())
                }
                Err(TransportError::Timeout(d)) => {
                    CommandResult::synthetic(&node_id, format!("timeout: no reply within {d:?}"))
                }
                Err(TransportError::Cancelled) => {
                    CommandResult::synthetic(&node_id, "cancelled")
                }
                Err(TransportError::Unavailable(message)) => {
                    CommandResult::synthetic(&node_id, format!("node unavailable: {message}"))
                }
            };
            (index, entry)
        });
    }

    let deadline = Instant::now() + ceiling;
    let mut slots: Vec<Option<CommandResult>> = vec![None; node_count];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match tokio::time::timeout(remaining, set.join_next()).await {
            Ok(Some(Ok((index, result)))) => slots[index] = Some(result),
            Ok(Some(Err(join_error))) => {
                tracing::error!(error = %join_error, "dispatch task failed");
            }
            Ok(None) => break,
            Err(_) => {
                // Ceiling reached: cancel outstanding calls and drain briefly.
                tracing::warn!(
                    ceiling_seconds = ceiling.as_secs(),
                    "plan ceiling reached; cancelling stragglers"
                );
                plan_cancel.cancel();
                loop {
                    match tokio::time::timeout(DRAIN_GRACE, set.join_next()).await {
                        Ok(Some(Ok((index, result)))) => slots[index] = Some(result),
                        Ok(Some(Err(_))) => {}
                        Ok(None) | Err(_) => break,
                    }
                }
                set.abort_all();
                break;
            }
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(index, slot)| {
            slot.unwrap_or_else(|| {
                CommandResult::synthetic(
                    &plan.selected_node_ids[index],
                    format!("timeout: no result within the plan ceiling ({ceiling:?})"),
                )
            })
        })
        .collect()
}
