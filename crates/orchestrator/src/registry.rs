//! Node registry: definitions, runtime health state, and per-node health
//! loops.
//!
//! Registration is config-driven and happens once at startup; the health
//! loops then own liveness. Health transitions (and only transitions) are
//! audited. Planner and dispatch read one immutable snapshot per request so
//! routing reasons always reference nodes that were eligible at planning
//! time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Serialize;

use nacc_domain::config::{HealthConfig, NodeDefinition};
use nacc_domain::{Error, Result};
use nacc_protocol::NodeInfo;

use crate::audit::{AuditAction, AuditLog, AuditOutcome, AuditRecord};
use crate::transport::{build_transport, NodeTransport, ToolCall};

/// Refresh the cached NodeInfo every this many successful probes.
const INFO_REFRESH_EVERY: u64 = 12;

/// Registry-maintained runtime state for one node.
#[derive(Debug, Default)]
pub struct NodeRuntimeState {
    pub healthy: bool,
    pub last_probe_at: Option<Instant>,
    pub last_error: Option<String>,
    /// Cached snapshot from registration / periodic refresh.
    pub info: Option<NodeInfo>,
}

struct NodeEntry {
    def: NodeDefinition,
    runtime: NodeRuntimeState,
    transport: Arc<dyn NodeTransport>,
}

/// What the planner and the API see: one immutable view of a node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub node_id: String,
    pub tags: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe_age_seconds: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub info: Option<NodeInfo>,
}

pub struct NodeRegistry {
    entries: RwLock<HashMap<String, NodeEntry>>,
}

impl Default for NodeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Register a node from its definition, constructing the transport and
    /// running the initial probe. Duplicate ids are a configuration error.
    pub async fn register(
        &self,
        def: NodeDefinition,
        probe_timeout: Duration,
        audit: &AuditLog,
    ) -> Result<()> {
        let transport = build_transport(&def)?;
        self.register_with_transport(def, transport, probe_timeout, audit)
            .await
    }

    /// Registration with a caller-supplied transport (tests, embedding).
    pub async fn register_with_transport(
        &self,
        def: NodeDefinition,
        transport: Arc<dyn NodeTransport>,
        probe_timeout: Duration,
        audit: &AuditLog,
    ) -> Result<()> {
        if def.node_id.trim().is_empty() {
            return Err(Error::Config("node_id must not be empty".into()));
        }
        if self.entries.read().contains_key(&def.node_id) {
            return Err(Error::Config(format!(
                "duplicate node_id '{}'",
                def.node_id
            )));
        }

        let (healthy, last_error, info) =
            initial_probe(&def.node_id, transport.as_ref(), probe_timeout).await;

        audit
            .record(
                AuditRecord::new(
                    AuditAction::NodeRegister,
                    def.node_id.clone(),
                    if healthy {
                        AuditOutcome::ok("registered healthy")
                    } else {
                        AuditOutcome::error(format!(
                            "registered unhealthy: {}",
                            last_error.as_deref().unwrap_or("probe failed")
                        ))
                    },
                )
                .fingerprint_of(&def),
            )
            .await;

        tracing::info!(
            node_id = %def.node_id,
            healthy,
            tags = ?def.tags,
            "node registered"
        );

        self.entries.write().insert(
            def.node_id.clone(),
            NodeEntry {
                def,
                runtime: NodeRuntimeState {
                    healthy,
                    last_probe_at: Some(Instant::now()),
                    last_error,
                    info,
                },
                transport,
            },
        );
        Ok(())
    }

    pub fn transport(&self, node_id: &str) -> Option<Arc<dyn NodeTransport>> {
        self.entries.read().get(node_id).map(|e| e.transport.clone())
    }

    pub fn get(&self, node_id: &str) -> Option<NodeSnapshot> {
        self.entries.read().get(node_id).map(snapshot_of)
    }

    /// All nodes, sorted by id for stable listings.
    pub fn snapshot(&self) -> Vec<NodeSnapshot> {
        let mut nodes: Vec<NodeSnapshot> = self.entries.read().values().map(snapshot_of).collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// The dispatch-eligible subset: healthy at this instant.
    pub fn healthy_snapshot(&self) -> Vec<NodeSnapshot> {
        self.snapshot().into_iter().filter(|n| n.healthy).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Apply one probe result. Returns `Some(now_healthy)` on a transition.
    fn apply_probe(
        &self,
        node_id: &str,
        result: std::result::Result<(), String>,
        info: Option<NodeInfo>,
    ) -> Option<bool> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(node_id)?;
        let was_healthy = entry.runtime.healthy;
        entry.runtime.last_probe_at = Some(Instant::now());
        match result {
            Ok(()) => {
                entry.runtime.healthy = true;
                entry.runtime.last_error = None;
                if info.is_some() {
                    entry.runtime.info = info;
                }
            }
            Err(message) => {
                entry.runtime.healthy = false;
                entry.runtime.last_error = Some(message);
            }
        }
        (was_healthy != entry.runtime.healthy).then_some(entry.runtime.healthy)
    }

    /// Start one health-loop task per registered node.
    pub fn spawn_health_loops(
        self: &Arc<Self>,
        audit: Arc<AuditLog>,
        health: HealthConfig,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let interval = Duration::from_secs(health.interval_seconds.max(1));
        let probe_timeout = Duration::from_secs(health.probe_timeout_seconds.max(1));

        let nodes: Vec<(String, Arc<dyn NodeTransport>)> = self
            .entries
            .read()
            .iter()
            .map(|(id, e)| (id.clone(), e.transport.clone()))
            .collect();

        nodes
            .into_iter()
            .map(|(node_id, transport)| {
                let registry = self.clone();
                let audit = audit.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(interval);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    let mut successes: u64 = 0;
                    loop {
                        ticker.tick().await;

                        let result = match transport.healthz(probe_timeout).await {
                            Ok(health) if health.node_id == node_id => Ok(()),
                            Ok(health) => Err(format!(
                                "node_id mismatch: probe answered as '{}'",
                                health.node_id
                            )),
                            Err(e) => Err(e.to_string()),
                        };

                        let info = if result.is_ok() {
                            successes += 1;
                            if successes % INFO_REFRESH_EVERY == 0 {
                                transport
                                    .call(
                                        ToolCall::GetNodeInfo,
                                        probe_timeout * 5,
                                        &crate::cancel::CancelToken::new(),
                                    )
                                    .await
                                    .ok()
                                    .and_then(|r| r.into_node_info())
                            } else {
                                None
                            }
                        } else {
                            None
                        };

                        if let Some(now_healthy) =
                            registry.apply_probe(&node_id, result.clone(), info)
                        {
                            tracing::info!(
                                node_id = %node_id,
                                healthy = now_healthy,
                                "health transition"
                            );
                            audit
                                .record(AuditRecord::new(
                                    AuditAction::HealthTransition,
                                    node_id.clone(),
                                    if now_healthy {
                                        AuditOutcome::ok("node became healthy")
                                    } else {
                                        AuditOutcome::error(format!(
                                            "node became unhealthy: {}",
                                            result.err().unwrap_or_default()
                                        ))
                                    },
                                ))
                                .await;
                        }
                    }
                })
            })
            .collect()
    }
}

fn snapshot_of(entry: &NodeEntry) -> NodeSnapshot {
    NodeSnapshot {
        node_id: entry.def.node_id.clone(),
        tags: entry.def.tags.clone(),
        description: entry.def.description.clone(),
        healthy: entry.runtime.healthy,
        last_error: entry.runtime.last_error.clone(),
        last_probe_age_seconds: entry.runtime.last_probe_at.map(|t| t.elapsed().as_secs()),
        info: entry.runtime.info.clone(),
    }
}

async fn initial_probe(
    node_id: &str,
    transport: &dyn NodeTransport,
    probe_timeout: Duration,
) -> (bool, Option<String>, Option<NodeInfo>) {
    match transport.healthz(probe_timeout).await {
        Ok(health) if health.node_id == node_id => {
            let info = transport
                .call(
                    ToolCall::GetNodeInfo,
                    probe_timeout * 5,
                    &crate::cancel::CancelToken::new(),
                )
                .await
                .ok()
                .and_then(|r| r.into_node_info());
            (true, None, info)
        }
        Ok(health) => (
            false,
            Some(format!(
                "node_id mismatch: probe answered as '{}'",
                health.node_id
            )),
            None,
        ),
        Err(e) => (false, Some(e.to_string()), None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    use nacc_domain::config::TransportConfig;
    use nacc_protocol::HealthResponse;
    use tempfile::TempDir;

    use crate::cancel::CancelToken;
    use crate::transport::{ToolReply, TransportError};

    fn definition(id: &str, tags: &[&str]) -> NodeDefinition {
        NodeDefinition {
            node_id: id.into(),
            transport: TransportConfig::Http {
                base_url: "http://unused:0".into(),
                bearer_token: None,
            },
            tags: tags.iter().map(|s| s.to_string()).collect(),
            description: None,
        }
    }

    /// A transport whose health can be flipped from the test.
    struct FlakyTransport {
        node_id: String,
        up: Arc<AtomicBool>,
    }

    #[async_trait::async_trait]
    impl NodeTransport for FlakyTransport {
        async fn call(
            &self,
            _call: ToolCall,
            _deadline: Duration,
            _cancel: &CancelToken,
        ) -> std::result::Result<ToolReply, TransportError> {
            Err(TransportError::Unavailable("not a real node".into()))
        }

        async fn healthz(
            &self,
            _deadline: Duration,
        ) -> std::result::Result<HealthResponse, TransportError> {
            if self.up.load(Ordering::Acquire) {
                Ok(HealthResponse::ok(&self.node_id))
            } else {
                Err(TransportError::Unavailable("connection refused".into()))
            }
        }
    }

    async fn audit_log(dir: &TempDir) -> Arc<AuditLog> {
        AuditLog::open(dir.path().join("audit.jsonl"), 1024 * 1024).unwrap()
    }

    #[tokio::test]
    async fn duplicate_registration_rejected() {
        let dir = TempDir::new().unwrap();
        let audit = audit_log(&dir).await;
        let registry = Arc::new(NodeRegistry::new());
        let up = Arc::new(AtomicBool::new(true));

        registry
            .register_with_transport(
                definition("a", &[]),
                Arc::new(FlakyTransport {
                    node_id: "a".into(),
                    up: up.clone(),
                }),
                Duration::from_secs(1),
                &audit,
            )
            .await
            .unwrap();

        let err = registry
            .register_with_transport(
                definition("a", &[]),
                Arc::new(FlakyTransport {
                    node_id: "a".into(),
                    up,
                }),
                Duration::from_secs(1),
                &audit,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn node_id_mismatch_fails_probe() {
        let dir = TempDir::new().unwrap();
        let audit = audit_log(&dir).await;
        let registry = Arc::new(NodeRegistry::new());

        registry
            .register_with_transport(
                definition("expected", &[]),
                Arc::new(FlakyTransport {
                    node_id: "impostor".into(),
                    up: Arc::new(AtomicBool::new(true)),
                }),
                Duration::from_secs(1),
                &audit,
            )
            .await
            .unwrap();

        let snapshot = registry.get("expected").unwrap();
        assert!(!snapshot.healthy);
        assert!(snapshot.last_error.unwrap().contains("mismatch"));
    }

    #[tokio::test(start_paused = true)]
    async fn health_loop_audits_transitions_only() {
        let dir = TempDir::new().unwrap();
        let audit = audit_log(&dir).await;
        let registry = Arc::new(NodeRegistry::new());
        let up = Arc::new(AtomicBool::new(true));

        registry
            .register_with_transport(
                definition("flaky", &[]),
                Arc::new(FlakyTransport {
                    node_id: "flaky".into(),
                    up: up.clone(),
                }),
                Duration::from_secs(1),
                &audit,
            )
            .await
            .unwrap();
        assert!(registry.get("flaky").unwrap().healthy);

        let _handles = registry.spawn_health_loops(
            audit.clone(),
            HealthConfig {
                interval_seconds: 5,
                probe_timeout_seconds: 1,
            },
        );

        // Several healthy probes: steady state, no transition events.
        tokio::time::advance(Duration::from_secs(16)).await;
        tokio::task::yield_now().await;
        assert!(registry.get("flaky").unwrap().healthy);

        // Take the node down; the next probe flips it to unhealthy.
        up.store(false, Ordering::Release);
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(!registry.get("flaky").unwrap().healthy);

        // And back up.
        up.store(true, Ordering::Release);
        tokio::time::advance(Duration::from_secs(6)).await;
        tokio::task::yield_now().await;
        assert!(registry.get("flaky").unwrap().healthy);

        audit.flush().await;
        let content = std::fs::read_to_string(dir.path().join("audit.jsonl")).unwrap();
        let transitions: Vec<&str> = content
            .lines()
            .filter(|l| l.contains("health_transition"))
            .collect();
        assert_eq!(transitions.len(), 2);
        assert!(transitions[0].contains("unhealthy"));
        assert!(transitions[1].contains("became healthy"));
    }

    #[tokio::test]
    async fn healthy_snapshot_filters() {
        let dir = TempDir::new().unwrap();
        let audit = audit_log(&dir).await;
        let registry = Arc::new(NodeRegistry::new());

        registry
            .register_with_transport(
                definition("up-node", &["linux"]),
                Arc::new(FlakyTransport {
                    node_id: "up-node".into(),
                    up: Arc::new(AtomicBool::new(true)),
                }),
                Duration::from_secs(1),
                &audit,
            )
            .await
            .unwrap();
        registry
            .register_with_transport(
                definition("down-node", &[]),
                Arc::new(FlakyTransport {
                    node_id: "down-node".into(),
                    up: Arc::new(AtomicBool::new(false)),
                }),
                Duration::from_secs(1),
                &audit,
            )
            .await
            .unwrap();

        let healthy = registry.healthy_snapshot();
        assert_eq!(healthy.len(), 1);
        assert_eq!(healthy[0].node_id, "up-node");
        assert_eq!(registry.snapshot().len(), 2);
    }
}
