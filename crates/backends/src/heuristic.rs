//! The deterministic heuristic backend.
//!
//! A pure function of (prompt, context): the same input always yields the
//! same completion. It reads the planner's `stage` context key and emits the
//! JSON decision shape that stage expects. The planner's per-stage fallbacks
//! call the same scoring helpers, so a plan produced with the heuristic as
//! the active backend is identical to one produced by falling back to it.

use std::time::Duration;

use nacc_domain::config::BackendKind;
use serde::{Deserialize, Serialize};

use crate::traits::{BackendContext, BackendError, CompletionBackend};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Candidate scoring (shared with the planner fallbacks)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One routable node as the router stage sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub node_id: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub cpu_percent: f32,
    #[serde(default)]
    pub memory_percent: f32,
}

impl Candidate {
    fn tag_overlap(&self, hints: &[String]) -> usize {
        self.tags.iter().filter(|t| hints.contains(t)).count()
    }

    fn load(&self) -> f32 {
        (self.cpu_percent + self.memory_percent) / 2.0
    }
}

/// Rank candidates by tag overlap with the caller's hints (primary) and
/// inverse load (tie-break), then node id for total stability. Returns the
/// top `k` ids and a one-line reason.
pub fn rank_candidates(
    candidates: &[Candidate],
    tag_hints: &[String],
    k: usize,
) -> (Vec<String>, String) {
    let mut scored: Vec<&Candidate> = candidates.iter().collect();
    scored.sort_by(|a, b| {
        b.tag_overlap(tag_hints)
            .cmp(&a.tag_overlap(tag_hints))
            .then(
                a.load()
                    .partial_cmp(&b.load())
                    .unwrap_or(std::cmp::Ordering::Equal),
            )
            .then(a.node_id.cmp(&b.node_id))
    });

    let selected: Vec<String> = scored
        .iter()
        .take(k.max(1))
        .map(|c| c.node_id.clone())
        .collect();

    let reason = if tag_hints.is_empty() {
        format!(
            "picked {} least-loaded of {} candidates",
            selected.len(),
            candidates.len()
        )
    } else {
        format!(
            "picked {} of {} candidates by overlap with tags [{}]",
            selected.len(),
            candidates.len(),
            tag_hints.join(", ")
        )
    };
    (selected, reason)
}

/// The deterministic security decision: allow iff the command basename is in
/// the intersection of the selected nodes' allow-lists.
pub fn allow_by_intersection(argv0: &str, intersection: &[String]) -> (bool, String) {
    if intersection.iter().any(|c| c == argv0) {
        (true, format!("'{argv0}' is allow-listed on every selected node"))
    } else {
        (
            false,
            format!("'{argv0}' is not in the intersection of the selected nodes' allow-lists"),
        )
    }
}

/// The deterministic execution profile: caller timeout (or the default)
/// clamped to the ceiling, empty env, no hints.
pub fn clamp_timeout(requested: Option<u64>) -> u64 {
    requested.unwrap_or(30).clamp(1, 600)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend implementation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct HeuristicBackend {
    timeout: Duration,
}

impl HeuristicBackend {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn str_key<'a>(context: &'a BackendContext, key: &str) -> &'a str {
        context.get(key).and_then(|v| v.as_str()).unwrap_or("")
    }

    fn list_key(context: &BackendContext, key: &str) -> Vec<String> {
        Self::str_key(context, key)
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect()
    }

    fn router_decision(context: &BackendContext) -> String {
        let candidates: Vec<Candidate> =
            serde_json::from_str(Self::str_key(context, "candidates")).unwrap_or_default();
        let hints = Self::list_key(context, "tag_hints");
        let k = context
            .get("parallelism")
            .and_then(|v| v.as_int())
            .unwrap_or(1)
            .max(1) as usize;
        let (selected, reason) = rank_candidates(&candidates, &hints, k);
        serde_json::json!({
            "selected_node_ids": selected,
            "router_reason": reason,
        })
        .to_string()
    }

    fn security_decision(context: &BackendContext) -> String {
        let argv0 = Self::str_key(context, "argv0");
        let intersection = Self::list_key(context, "allowed_commands");
        let (allow, reason) = allow_by_intersection(argv0, &intersection);
        if allow {
            serde_json::json!({ "verdict": "allow" }).to_string()
        } else {
            serde_json::json!({ "verdict": "deny", "reason": reason }).to_string()
        }
    }

    fn execution_decision(context: &BackendContext) -> String {
        let requested = context
            .get("requested_timeout_seconds")
            .and_then(|v| v.as_int())
            .map(|v| v.max(0) as u64);
        serde_json::json!({
            "timeout_seconds": clamp_timeout(requested),
            "env": {},
            "sandbox_hints": [],
        })
        .to_string()
    }

    fn sync_decision() -> String {
        serde_json::json!({ "strategy": "mirror" }).to_string()
    }
}

#[async_trait::async_trait]
impl CompletionBackend for HeuristicBackend {
    async fn complete(
        &self,
        _prompt: &str,
        context: &BackendContext,
    ) -> Result<String, BackendError> {
        let completion = match Self::str_key(context, "stage") {
            "router" => Self::router_decision(context),
            "security" => Self::security_decision(context),
            "execution" => Self::execution_decision(context),
            "sync" => Self::sync_decision(),
            // Free-form probes get a fixed acknowledgement.
            _ => serde_json::json!({ "ok": true }).to_string(),
        };
        Ok(completion)
    }

    async fn probe(&self) -> Result<(), BackendError> {
        Ok(())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Heuristic
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ContextValue;

    fn candidate(id: &str, tags: &[&str], cpu: f32, mem: f32) -> Candidate {
        Candidate {
            node_id: id.into(),
            tags: tags.iter().map(|s| s.to_string()).collect(),
            cpu_percent: cpu,
            memory_percent: mem,
        }
    }

    #[test]
    fn tag_overlap_beats_load() {
        let candidates = vec![
            candidate("idle-generic", &[], 1.0, 1.0),
            candidate("busy-build", &["build"], 90.0, 90.0),
        ];
        let (selected, _) = rank_candidates(&candidates, &["build".into()], 1);
        assert_eq!(selected, vec!["busy-build"]);
    }

    #[test]
    fn load_breaks_ties_then_node_id() {
        let candidates = vec![
            candidate("zeta", &["x"], 10.0, 10.0),
            candidate("alpha", &["x"], 10.0, 10.0),
            candidate("mid", &["x"], 50.0, 50.0),
        ];
        let (selected, _) = rank_candidates(&candidates, &["x".into()], 3);
        assert_eq!(selected, vec!["alpha", "zeta", "mid"]);
    }

    #[tokio::test]
    async fn same_input_same_output() {
        let backend = HeuristicBackend::new(Duration::from_secs(5));
        let mut ctx = BackendContext::new();
        ctx.insert("stage".into(), "router".into());
        ctx.insert(
            "candidates".into(),
            serde_json::to_string(&vec![
                candidate("a", &["t"], 0.0, 0.0),
                candidate("b", &[], 0.0, 0.0),
            ])
            .unwrap()
            .into(),
        );
        ctx.insert("tag_hints".into(), "t".into());
        ctx.insert("parallelism".into(), ContextValue::Int(2));

        let first = backend.complete("route this", &ctx).await.unwrap();
        let second = backend.complete("route this", &ctx).await.unwrap();
        assert_eq!(first, second);

        let parsed: serde_json::Value = serde_json::from_str(&first).unwrap();
        assert_eq!(parsed["selected_node_ids"][0], "a");
        assert_eq!(parsed["selected_node_ids"][1], "b");
    }

    #[tokio::test]
    async fn security_denies_outside_intersection() {
        let backend = HeuristicBackend::new(Duration::from_secs(5));
        let mut ctx = BackendContext::new();
        ctx.insert("stage".into(), "security".into());
        ctx.insert("argv0".into(), "rm".into());
        ctx.insert("allowed_commands".into(), "echo, ls".into());

        let completion = backend.complete("", &ctx).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&completion).unwrap();
        assert_eq!(parsed["verdict"], "deny");
        assert!(parsed["reason"].as_str().unwrap().contains("rm"));
    }

    #[tokio::test]
    async fn execution_clamps_timeout() {
        let backend = HeuristicBackend::new(Duration::from_secs(5));
        let mut ctx = BackendContext::new();
        ctx.insert("stage".into(), "execution".into());
        ctx.insert(
            "requested_timeout_seconds".into(),
            ContextValue::Int(9_999),
        );

        let completion = backend.complete("", &ctx).await.unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&completion).unwrap();
        assert_eq!(parsed["timeout_seconds"], 600);
    }
}
