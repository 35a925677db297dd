//! The request planner: router → security → execution (→ sync) stages.
//!
//! Each stage is one call to the active completion backend with a
//! stage-specific prompt and a flat context map, parsed into a typed
//! decision. A backend failure or an unparseable completion sends the stage
//! to its deterministic fallback (the same scoring the heuristic backend
//! uses) and sets the stage's fallback flag; nothing is retried. A security
//! Deny short-circuits dispatch.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use nacc_backends::heuristic::{allow_by_intersection, clamp_timeout, rank_candidates, Candidate};
use nacc_backends::{ActiveBackend, BackendContext, CompletionBackend, ContextValue};
use nacc_protocol::SyncStrategy;

use crate::registry::NodeSnapshot;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum SecurityVerdict {
    Allow,
    Deny { stage: String, reason: String },
}

impl SecurityVerdict {
    pub fn is_allow(&self) -> bool {
        matches!(self, SecurityVerdict::Allow)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecProfile {
    pub timeout_seconds: u64,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub sandbox_hints: Vec<String>,
}

/// The planner's product: what runs where, and why.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// Ordered; empty on a deny. Always a subset of the healthy snapshot
    /// the router saw, with duplicates rejected.
    pub selected_node_ids: Vec<String>,
    pub parallelism: usize,
    pub router_reason: String,
    pub router_fallback: bool,
    pub security_verdict: SecurityVerdict,
    pub security_fallback: bool,
    pub exec_profile: ExecProfile,
    pub exec_fallback: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_strategy: Option<SyncStrategy>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub sync_fallback: bool,
}

impl ExecutionPlan {
    /// The fallback-flag summary recorded in the audit trail.
    pub fn fallback_detail(&self) -> serde_json::Value {
        serde_json::json!({
            "router_fallback": self.router_fallback,
            "security_fallback": self.security_fallback,
            "exec_fallback": self.exec_fallback,
            "sync_fallback": self.sync_fallback,
        })
    }
}

/// Inputs for planning a command request.
#[derive(Debug, Clone)]
pub struct CommandPlanInput {
    /// Human-readable request description for the stage prompts.
    pub description: String,
    pub argv0: String,
    pub tag_hints: Vec<String>,
    pub parallelism: usize,
    pub requested_timeout_seconds: Option<u64>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage decisions (parsed completion shapes)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Deserialize)]
struct RouterDecision {
    selected_node_ids: Vec<String>,
    router_reason: String,
}

#[derive(Debug, Deserialize)]
struct SecurityDecision {
    verdict: String,
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecDecision {
    timeout_seconds: u64,
    #[serde(default)]
    env: HashMap<String, String>,
    #[serde(default)]
    sandbox_hints: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SyncDecision {
    strategy: SyncStrategy,
}

/// Extract the first balanced JSON object from a completion. Models wrap
/// their answers in prose often enough that plain `from_str` is not enough.
pub fn extract_json_object(completion: &str) -> Option<&str> {
    let start = completion.find('{')?;
    let bytes = completion.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;
    for (offset, &b) in bytes[start..].iter().enumerate() {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&completion[start..start + offset + 1]);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_decision<T: serde::de::DeserializeOwned>(completion: &str) -> Option<T> {
    serde_json::from_str(extract_json_object(completion)?).ok()
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Planner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Planner {
    backends: Arc<ActiveBackend>,
}

impl Planner {
    pub fn new(backends: Arc<ActiveBackend>) -> Self {
        Self { backends }
    }

    /// One backend call, bounded by the backend's declared timeout. Any
    /// failure surfaces as `None`; the caller falls back.
    async fn stage_completion(
        backend: &Arc<dyn CompletionBackend>,
        stage: &str,
        prompt: String,
        context: BackendContext,
    ) -> Option<String> {
        let deadline = backend.timeout() + Duration::from_secs(1);
        match tokio::time::timeout(deadline, backend.complete(&prompt, &context)).await {
            Ok(Ok(completion)) => Some(completion),
            Ok(Err(e)) => {
                tracing::warn!(stage, error = %e, "backend failed; using fallback");
                None
            }
            Err(_) => {
                tracing::warn!(stage, "backend exceeded its declared timeout; using fallback");
                None
            }
        }
    }

    /// Plan a command request against the given healthy snapshot.
    pub async fn plan_command(
        &self,
        input: &CommandPlanInput,
        candidates: &[NodeSnapshot],
    ) -> ExecutionPlan {
        // In-flight calls keep the backend captured here even across a
        // concurrent switch.
        let backend = self.backends.snapshot();

        // ── Router ───────────────────────────────────────────────────
        let scored: Vec<Candidate> = candidates.iter().map(candidate_of).collect();
        let wanted = input.parallelism.max(1).min(candidates.len().max(1));

        let mut router_fallback = false;
        let (mut selected, mut router_reason) = match Self::stage_completion(
            &backend,
            "router",
            router_prompt(input),
            router_context(&scored, input),
        )
        .await
        .and_then(|c| parse_decision::<RouterDecision>(&c))
        .and_then(|d| validate_selection(d, candidates))
        {
            Some((ids, reason)) => (ids, reason),
            None => {
                router_fallback = true;
                rank_candidates(&scored, &input.tag_hints, wanted)
            }
        };

        if candidates.is_empty() {
            selected.clear();
            router_reason = "no healthy nodes available".into();
        }

        // ── Security ─────────────────────────────────────────────────
        let intersection = allow_list_intersection(candidates, &selected);
        let mut security_fallback = false;
        let security_verdict = match Self::stage_completion(
            &backend,
            "security",
            security_prompt(input),
            security_context(&input.argv0, &intersection),
        )
        .await
        .and_then(|c| parse_decision::<SecurityDecision>(&c))
        {
            Some(decision) => match decision.verdict.as_str() {
                "allow" => SecurityVerdict::Allow,
                "deny" => SecurityVerdict::Deny {
                    stage: "security".into(),
                    reason: decision
                        .reason
                        .unwrap_or_else(|| "denied by security agent".into()),
                },
                _ => {
                    security_fallback = true;
                    fallback_verdict(&input.argv0, &intersection)
                }
            },
            None => {
                security_fallback = true;
                fallback_verdict(&input.argv0, &intersection)
            }
        };

        // ── Execution ────────────────────────────────────────────────
        let mut exec_fallback = false;
        let exec_profile = if security_verdict.is_allow() {
            match Self::stage_completion(
                &backend,
                "execution",
                execution_prompt(input),
                execution_context(input),
            )
            .await
            .and_then(|c| parse_decision::<ExecDecision>(&c))
            {
                Some(decision) => ExecProfile {
                    timeout_seconds: clamp_timeout(Some(decision.timeout_seconds)),
                    env: decision.env,
                    sandbox_hints: decision.sandbox_hints,
                },
                None => {
                    exec_fallback = true;
                    default_profile(input.requested_timeout_seconds)
                }
            }
        } else {
            default_profile(input.requested_timeout_seconds)
        };

        // A denied plan exposes no targets.
        if !security_verdict.is_allow() {
            selected.clear();
        }

        let parallelism = input.parallelism.max(1).min(selected.len().max(1));
        ExecutionPlan {
            selected_node_ids: selected,
            parallelism,
            router_reason,
            router_fallback,
            security_verdict,
            security_fallback,
            exec_profile,
            exec_fallback,
            sync_strategy: None,
            sync_fallback: false,
        }
    }

    /// Strategy selection for sync requests whose caller left it open.
    pub async fn plan_sync_strategy(
        &self,
        description: &str,
        requested: Option<SyncStrategy>,
    ) -> (SyncStrategy, bool) {
        if let Some(strategy) = requested {
            return (strategy, false);
        }
        let backend = self.backends.snapshot();
        let mut context = BackendContext::new();
        context.insert("stage".into(), "sync".into());
        match Self::stage_completion(
            &backend,
            "sync",
            format!(
                "Pick a sync strategy (mirror, append, dry_run) for this request: {description}. \
                 Reply with JSON: {{\"strategy\": \"...\"}}"
            ),
            context,
        )
        .await
        .and_then(|c| parse_decision::<SyncDecision>(&c))
        {
            Some(decision) => (decision.strategy, false),
            None => (SyncStrategy::Mirror, true),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stage inputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn candidate_of(node: &NodeSnapshot) -> Candidate {
    Candidate {
        node_id: node.node_id.clone(),
        tags: node.tags.clone(),
        cpu_percent: node.info.as_ref().map(|i| i.cpu_percent).unwrap_or(0.0),
        memory_percent: node.info.as_ref().map(|i| i.memory_percent).unwrap_or(0.0),
    }
}

fn router_prompt(input: &CommandPlanInput) -> String {
    format!(
        "You route requests across a fleet of nodes. Request: {}. \
         Pick an ordered subset of node ids (the context lists candidates \
         with tags and load) and reply with JSON: \
         {{\"selected_node_ids\": [...], \"router_reason\": \"...\"}}",
        input.description
    )
}

fn router_context(candidates: &[Candidate], input: &CommandPlanInput) -> BackendContext {
    let mut context = BackendContext::new();
    context.insert("stage".into(), "router".into());
    context.insert(
        "candidates".into(),
        serde_json::to_string(candidates).unwrap_or_default().into(),
    );
    context.insert("tag_hints".into(), input.tag_hints.join(",").into());
    context.insert(
        "parallelism".into(),
        ContextValue::Int(input.parallelism.max(1) as i64),
    );
    context
}

fn security_prompt(input: &CommandPlanInput) -> String {
    format!(
        "You review commands before they run. Command: {}. The context lists \
         the command basename and the allow-list intersection of the selected \
         nodes. Reply with JSON: {{\"verdict\": \"allow\"}} or \
         {{\"verdict\": \"deny\", \"reason\": \"...\"}}",
        input.description
    )
}

fn security_context(argv0: &str, intersection: &[String]) -> BackendContext {
    let mut context = BackendContext::new();
    context.insert("stage".into(), "security".into());
    context.insert("argv0".into(), argv0.into());
    context.insert("allowed_commands".into(), intersection.join(",").into());
    context
}

fn execution_prompt(input: &CommandPlanInput) -> String {
    format!(
        "Produce an execution profile for: {}. Reply with JSON: \
         {{\"timeout_seconds\": N, \"env\": {{}}, \"sandbox_hints\": []}}",
        input.description
    )
}

fn execution_context(input: &CommandPlanInput) -> BackendContext {
    let mut context = BackendContext::new();
    context.insert("stage".into(), "execution".into());
    if let Some(timeout) = input.requested_timeout_seconds {
        context.insert(
            "requested_timeout_seconds".into(),
            ContextValue::Int(timeout.min(i64::MAX as u64) as i64),
        );
    }
    context
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation & fallbacks
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A router decision survives only if it names existing candidates, without
/// duplicates, and selects at least one node.
fn validate_selection(
    decision: RouterDecision,
    candidates: &[NodeSnapshot],
) -> Option<(Vec<String>, String)> {
    if decision.selected_node_ids.is_empty() {
        return None;
    }
    let known: HashSet<&str> = candidates.iter().map(|c| c.node_id.as_str()).collect();
    let mut seen = HashSet::new();
    for id in &decision.selected_node_ids {
        if !known.contains(id.as_str()) || !seen.insert(id.as_str()) {
            return None;
        }
    }
    Some((decision.selected_node_ids, decision.router_reason))
}

/// Intersection of the selected nodes' allow-lists (registration-time echo).
fn allow_list_intersection(candidates: &[NodeSnapshot], selected: &[String]) -> Vec<String> {
    let mut intersection: Option<HashSet<String>> = None;
    for id in selected {
        let allowed: HashSet<String> = candidates
            .iter()
            .find(|c| &c.node_id == id)
            .and_then(|c| c.info.as_ref())
            .map(|i| i.allowed_commands.iter().cloned().collect())
            .unwrap_or_default();
        intersection = Some(match intersection {
            Some(acc) => acc.intersection(&allowed).cloned().collect(),
            None => allowed,
        });
    }
    let mut list: Vec<String> = intersection.unwrap_or_default().into_iter().collect();
    list.sort();
    list
}

fn fallback_verdict(argv0: &str, intersection: &[String]) -> SecurityVerdict {
    let (allow, reason) = allow_by_intersection(argv0, intersection);
    if allow {
        SecurityVerdict::Allow
    } else {
        SecurityVerdict::Deny {
            stage: "security".into(),
            reason,
        }
    }
}

fn default_profile(requested: Option<u64>) -> ExecProfile {
    ExecProfile {
        timeout_seconds: clamp_timeout(requested),
        env: HashMap::new(),
        sandbox_hints: Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nacc_domain::config::BackendConfig;
    use nacc_protocol::NodeInfo;

    fn snapshot(id: &str, tags: &[&str], allowed: &[&str], cpu: f32) -> NodeSnapshot {
        NodeSnapshot {
            node_id: id.into(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            description: None,
            healthy: true,
            last_error: None,
            last_probe_age_seconds: Some(0),
            info: Some(NodeInfo {
                node_id: id.into(),
                tags: tags.iter().map(|s| s.to_string()).collect(),
                allowed_commands: allowed.iter().map(|s| s.to_string()).collect(),
                os: "linux".into(),
                arch: "x86_64".into(),
                hostname: id.into(),
                cpu_percent: cpu,
                memory_percent: cpu,
                disk_percent: 10.0,
                uptime_seconds: 1,
            }),
        }
    }

    fn planner() -> Planner {
        Planner::new(Arc::new(
            ActiveBackend::from_config(&BackendConfig::default()).unwrap(),
        ))
    }

    fn input(argv0: &str, hints: &[&str], parallelism: usize) -> CommandPlanInput {
        CommandPlanInput {
            description: format!("run {argv0}"),
            argv0: argv0.into(),
            tag_hints: hints.iter().map(|s| s.to_string()).collect(),
            parallelism,
            requested_timeout_seconds: None,
        }
    }

    #[tokio::test]
    async fn heuristic_plan_selects_by_tags_and_allows() {
        let candidates = vec![
            snapshot("build-1", &["build"], &["echo", "make"], 20.0),
            snapshot("web-1", &["web"], &["echo"], 5.0),
        ];
        let plan = planner()
            .plan_command(&input("echo", &["build"], 1), &candidates)
            .await;

        assert_eq!(plan.selected_node_ids, vec!["build-1"]);
        assert!(plan.security_verdict.is_allow());
        assert!(!plan.router_fallback);
        assert_eq!(plan.exec_profile.timeout_seconds, 30);
    }

    #[tokio::test]
    async fn deny_clears_selection() {
        let candidates = vec![snapshot("a", &[], &["echo"], 0.0)];
        let plan = planner()
            .plan_command(&input("rm", &[], 1), &candidates)
            .await;

        assert!(plan.selected_node_ids.is_empty());
        match &plan.security_verdict {
            SecurityVerdict::Deny { stage, reason } => {
                assert_eq!(stage, "security");
                assert!(reason.contains("rm"));
            }
            SecurityVerdict::Allow => panic!("expected a deny"),
        }
    }

    #[tokio::test]
    async fn intersection_denies_partially_allowed_command() {
        // "make" is allowed on one node but the plan spans both.
        let candidates = vec![
            snapshot("a", &["x"], &["echo", "make"], 0.0),
            snapshot("b", &["x"], &["echo"], 0.0),
        ];
        let plan = planner()
            .plan_command(&input("make", &["x"], 2), &candidates)
            .await;
        assert!(!plan.security_verdict.is_allow());

        let plan = planner()
            .plan_command(&input("echo", &["x"], 2), &candidates)
            .await;
        assert!(plan.security_verdict.is_allow());
        assert_eq!(plan.selected_node_ids.len(), 2);
    }

    #[tokio::test]
    async fn empty_candidate_set_yields_empty_plan() {
        let plan = planner().plan_command(&input("echo", &[], 2), &[]).await;
        assert!(plan.selected_node_ids.is_empty());
        assert_eq!(plan.router_reason, "no healthy nodes available");
    }

    #[tokio::test]
    async fn sync_stage_defaults_to_mirror_on_request() {
        let (strategy, fallback) = planner()
            .plan_sync_strategy("sync configs", None)
            .await;
        assert_eq!(strategy, SyncStrategy::Mirror);
        assert!(!fallback);

        let (strategy, fallback) = planner()
            .plan_sync_strategy("sync", Some(SyncStrategy::Append))
            .await;
        assert_eq!(strategy, SyncStrategy::Append);
        assert!(!fallback);
    }

    #[test]
    fn json_extraction_handles_prose_and_strings() {
        assert_eq!(
            extract_json_object("Sure! Here you go: {\"a\": 1} hope that helps"),
            Some("{\"a\": 1}")
        );
        assert_eq!(
            extract_json_object(r#"{"s": "braces } in { strings", "n": {"x": 2}}"#),
            Some(r#"{"s": "braces } in { strings", "n": {"x": 2}}"#)
        );
        assert_eq!(extract_json_object("no json here"), None);
        assert_eq!(extract_json_object("{\"unterminated\": tru"), None);
    }

    #[test]
    fn router_validation_rejects_unknown_and_duplicate_ids() {
        let candidates = vec![snapshot("a", &[], &[], 0.0)];
        assert!(validate_selection(
            RouterDecision {
                selected_node_ids: vec!["ghost".into()],
                router_reason: "r".into(),
            },
            &candidates
        )
        .is_none());
        assert!(validate_selection(
            RouterDecision {
                selected_node_ids: vec!["a".into(), "a".into()],
                router_reason: "r".into(),
            },
            &candidates
        )
        .is_none());
        assert!(validate_selection(
            RouterDecision {
                selected_node_ids: vec!["a".into()],
                router_reason: "r".into(),
            },
            &candidates
        )
        .is_some());
    }
}
