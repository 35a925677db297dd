use std::sync::Arc;

use nacc_backends::ActiveBackend;
use nacc_domain::config::OrchestratorConfig;

use crate::audit::AuditLog;
use crate::planner::Planner;
use crate::registry::NodeRegistry;

/// Shared application state passed to all API handlers.
///
/// The orchestrator exclusively owns the registry, the audit log handle,
/// and the active backend reference; handlers read through them.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<OrchestratorConfig>,
    pub registry: Arc<NodeRegistry>,
    pub audit: Arc<AuditLog>,
    pub backends: Arc<ActiveBackend>,
    pub planner: Arc<Planner>,
    /// SHA-256 of the operator token gating `POST /backends/switch`.
    /// `None` = ungated (single-operator deployments behind a tunnel).
    pub operator_token_hash: Option<Vec<u8>>,
}
