use std::sync::Arc;

use nacc_domain::config::NodeConfig;
use nacc_tools::RootContext;

/// Shared state passed to all node handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<NodeConfig>,
    /// The confined root every tool call goes through.
    pub root: Arc<RootContext>,
    /// SHA-256 of the bearer token protecting `/tools/*` and `/node`.
    /// `None` = open node (operator relies on tunnel-level protection).
    pub token_hash: Option<Vec<u8>>,
}
