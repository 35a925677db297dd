use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Configuration for a single node tool server process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Unique node identifier, echoed by `/healthz` and GetNodeInfo.
    pub node_id: String,
    /// Absolute root directory. Every tool path resolves under it.
    pub root_dir: PathBuf,
    /// Command basenames ExecuteCommand may spawn.
    #[serde(default)]
    pub allowed_commands: Vec<String>,
    /// PATH value handed to child processes (the only inherited variable).
    #[serde(default = "d_path_env")]
    pub path_env: String,
    /// Routing tags advertised through GetNodeInfo.
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
    /// Named sync-target subdirectories (relative to `root_dir`).
    #[serde(default)]
    pub sync_targets: HashMap<String, String>,
    #[serde(default)]
    pub server: NodeServerConfig,
    /// Env var holding the bearer token protecting `/tools/*`.
    /// Unset or empty token = open node (tunnel-protected deployments).
    #[serde(default = "d_node_token_env")]
    pub bearer_token_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeServerConfig {
    #[serde(default = "d_node_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
}

impl Default for NodeServerConfig {
    fn default() -> Self {
        Self {
            port: 7070,
            host: "127.0.0.1".into(),
        }
    }
}

impl NodeConfig {
    /// Validate the node configuration, returning all issues found.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.node_id.trim().is_empty() {
            issues.push(ConfigIssue::error("node_id must not be empty"));
        }
        if !self.root_dir.is_absolute() {
            issues.push(ConfigIssue::error(format!(
                "root_dir must be absolute (got '{}')",
                self.root_dir.display()
            )));
        }
        if self.allowed_commands.is_empty() {
            issues.push(ConfigIssue::warning(
                "allowed_commands is empty — ExecuteCommand will reject everything",
            ));
        }
        for cmd in &self.allowed_commands {
            if cmd.contains('/') {
                issues.push(ConfigIssue::error(format!(
                    "allowed_commands entries must be basenames, not paths (got '{cmd}')"
                )));
            }
        }
        for (name, rel) in &self.sync_targets {
            if PathBuf::from(rel).is_absolute() {
                issues.push(ConfigIssue::error(format!(
                    "sync_targets.{name} must be relative to root_dir (got '{rel}')"
                )));
            }
        }
        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Orchestrator config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub server: ServerConfig,
    /// Static node registrations.
    #[serde(default)]
    pub nodes: Vec<NodeDefinition>,
    /// The backend active at startup.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Additional variants selectable through `POST /backends/switch`.
    #[serde(default)]
    pub backend_variants: Vec<BackendConfig>,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl OrchestratorConfig {
    /// Validate the orchestrator configuration, returning all issues found.
    pub fn validate(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for def in &self.nodes {
            if def.node_id.trim().is_empty() {
                issues.push(ConfigIssue::error("nodes: node_id must not be empty"));
            }
            if !seen.insert(def.node_id.as_str()) {
                issues.push(ConfigIssue::error(format!(
                    "nodes: duplicate node_id '{}'",
                    def.node_id
                )));
            }
            if let TransportConfig::InProcess { root_dir, .. } = &def.transport {
                if !root_dir.is_absolute() {
                    issues.push(ConfigIssue::error(format!(
                        "nodes.{}: in_process root_dir must be absolute",
                        def.node_id
                    )));
                }
            }
            if let TransportConfig::Http { base_url, .. } = &def.transport {
                if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
                    issues.push(ConfigIssue::error(format!(
                        "nodes.{}: base_url must be http(s) (got '{base_url}')",
                        def.node_id
                    )));
                }
            }
        }
        if self.nodes.is_empty() {
            issues.push(ConfigIssue::warning(
                "no nodes configured — every plan will be empty",
            ));
        }
        issues.extend(self.backend.validate("backend"));
        for (i, variant) in self.backend_variants.iter().enumerate() {
            issues.extend(variant.validate(&format!("backend_variants[{i}]")));
        }
        if self.health.interval_seconds == 0 {
            issues.push(ConfigIssue::error("health.interval_seconds must be > 0"));
        }
        if self.audit.retention_bytes < 64 * 1024 {
            issues.push(ConfigIssue::warning(
                "audit.retention_bytes below 64 KiB — trimming will be aggressive",
            ));
        }
        issues
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "d_orch_port")]
    pub port: u16,
    #[serde(default = "d_host")]
    pub host: String,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 7700,
            host: "127.0.0.1".into(),
            cors: CorsConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Origins allowed for CORS. Defaults to localhost-only.
    #[serde(default = "d_cors_origins")]
    pub allowed_origins: Vec<String>,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            allowed_origins: d_cors_origins(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Node definitions & transports
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A static node registration: identity plus how to reach it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDefinition {
    pub node_id: String,
    pub transport: TransportConfig,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub description: Option<String>,
}

/// How the orchestrator reaches a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Direct calls against a local root directory (tests, single-host).
    InProcess {
        root_dir: PathBuf,
        #[serde(default)]
        allowed_commands: Vec<String>,
        #[serde(default = "d_path_env")]
        path_env: String,
    },
    /// Remote node tool server over HTTP.
    Http {
        base_url: String,
        /// Literal token or `env:VAR_NAME` indirection.
        #[serde(default)]
        bearer_token: Option<String>,
    },
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Backend config
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Discriminator for completion-backend variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Deterministic local heuristic (also the universal fallback).
    Heuristic,
    /// Remote HTTP inference service.
    Http,
    /// Local model driven over stdin/stdout of a worker subprocess.
    Subprocess,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Heuristic => write!(f, "heuristic"),
            BackendKind::Http => write!(f, "http"),
            BackendKind::Subprocess => write!(f, "subprocess"),
        }
    }
}

/// Parameters for one completion-backend variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub kind: BackendKind,
    #[serde(default = "d_backend_timeout")]
    pub timeout_seconds: u64,
    /// HTTP variants: completion endpoint URL.
    #[serde(default)]
    pub endpoint_url: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    /// Literal token or `env:VAR_NAME` indirection.
    #[serde(default)]
    pub bearer_token: Option<String>,
    /// Subprocess variants: worker argv.
    #[serde(default)]
    pub command: Vec<String>,
    /// Extra env for subprocess workers / extra headers for HTTP variants.
    #[serde(default)]
    pub environment: HashMap<String, String>,
    /// Subprocess variants: number of long-lived workers.
    #[serde(default = "d_pool_size")]
    pub pool_size: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Heuristic,
            timeout_seconds: d_backend_timeout(),
            endpoint_url: None,
            model_name: None,
            bearer_token: None,
            command: Vec::new(),
            environment: HashMap::new(),
            pool_size: d_pool_size(),
        }
    }
}

impl BackendConfig {
    fn validate(&self, section: &str) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.timeout_seconds == 0 {
            issues.push(ConfigIssue::error(format!(
                "{section}: timeout_seconds must be > 0"
            )));
        }
        match self.kind {
            BackendKind::Http => {
                if self.endpoint_url.is_none() {
                    issues.push(ConfigIssue::error(format!(
                        "{section}: http backend requires endpoint_url"
                    )));
                }
            }
            BackendKind::Subprocess => {
                if self.command.is_empty() {
                    issues.push(ConfigIssue::error(format!(
                        "{section}: subprocess backend requires a command"
                    )));
                }
                if self.pool_size == 0 {
                    issues.push(ConfigIssue::error(format!(
                        "{section}: pool_size must be > 0"
                    )));
                }
            }
            BackendKind::Heuristic => {}
        }
        issues
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Audit / health / security
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "d_audit_path")]
    pub path: PathBuf,
    /// Retention budget in bytes; oldest lines trimmed at startup/rotate.
    #[serde(default = "d_retention")]
    pub retention_bytes: u64,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            path: d_audit_path(),
            retention_bytes: d_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "d_health_interval")]
    pub interval_seconds: u64,
    #[serde(default = "d_probe_timeout")]
    pub probe_timeout_seconds: u64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_seconds: d_health_interval(),
            probe_timeout_seconds: d_probe_timeout(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Env var holding the operator token gating `POST /backends/switch`.
    #[serde(default = "d_operator_token_env")]
    pub operator_token_env: String,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            operator_token_env: d_operator_token_env(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Secrets
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Resolve a configured secret: a literal value, or `env:VAR_NAME` to read
/// the named environment variable at startup.
pub fn resolve_secret(raw: &str) -> crate::Result<String> {
    match raw.strip_prefix("env:") {
        Some(var) => std::env::var(var).map_err(|_| {
            crate::Error::Config(format!("environment variable '{var}' is not set"))
        }),
        None => Ok(raw.to_owned()),
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Validation issues
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSeverity {
    Warning,
    Error,
}

/// One problem found by config validation.
#[derive(Debug, Clone)]
pub struct ConfigIssue {
    pub severity: ConfigSeverity,
    pub message: String,
}

impl ConfigIssue {
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Error,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: ConfigSeverity::Warning,
            message: message.into(),
        }
    }
}

impl fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Defaults
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn d_host() -> String {
    "127.0.0.1".into()
}
fn d_node_port() -> u16 {
    7070
}
fn d_orch_port() -> u16 {
    7700
}
fn d_path_env() -> String {
    "/usr/local/bin:/usr/bin:/bin".into()
}
fn d_node_token_env() -> String {
    "NACC_NODE_TOKEN".into()
}
fn d_operator_token_env() -> String {
    "NACC_OPERATOR_TOKEN".into()
}
fn d_backend_timeout() -> u64 {
    120
}
fn d_pool_size() -> usize {
    2
}
fn d_audit_path() -> PathBuf {
    PathBuf::from("./data/audit.jsonl")
}
fn d_retention() -> u64 {
    16 * 1024 * 1024
}
fn d_health_interval() -> u64 {
    5
}
fn d_probe_timeout() -> u64 {
    2
}
fn d_cors_origins() -> Vec<String> {
    vec![
        "http://localhost:5173".into(),
        "http://127.0.0.1:5173".into(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orchestrator_config_defaults_parse() {
        let cfg: OrchestratorConfig = toml::from_str("").unwrap();
        assert_eq!(cfg.server.port, 7700);
        assert_eq!(cfg.backend.kind, BackendKind::Heuristic);
        assert_eq!(cfg.health.interval_seconds, 5);
        assert!(cfg.nodes.is_empty());
    }

    #[test]
    fn node_definition_transport_tags() {
        let cfg: OrchestratorConfig = toml::from_str(
            r#"
            [[nodes]]
            node_id = "alpha"
            tags = ["linux", "build"]
            [nodes.transport]
            kind = "http"
            base_url = "http://10.0.0.5:7070"
            bearer_token = "env:ALPHA_TOKEN"

            [[nodes]]
            node_id = "local"
            [nodes.transport]
            kind = "in_process"
            root_dir = "/srv/nacc"
            allowed_commands = ["echo", "ls"]
            "#,
        )
        .unwrap();
        assert_eq!(cfg.nodes.len(), 2);
        assert!(matches!(
            cfg.nodes[0].transport,
            TransportConfig::Http { .. }
        ));
        assert!(matches!(
            cfg.nodes[1].transport,
            TransportConfig::InProcess { .. }
        ));
        assert!(cfg.validate().iter().all(|i| i.severity != ConfigSeverity::Error));
    }

    #[test]
    fn duplicate_node_ids_rejected() {
        let cfg: OrchestratorConfig = toml::from_str(
            r#"
            [[nodes]]
            node_id = "dup"
            [nodes.transport]
            kind = "http"
            base_url = "http://a:7070"

            [[nodes]]
            node_id = "dup"
            [nodes.transport]
            kind = "http"
            base_url = "http://b:7070"
            "#,
        )
        .unwrap();
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("duplicate")));
    }

    #[test]
    fn http_backend_requires_endpoint() {
        let cfg: OrchestratorConfig = toml::from_str(
            r#"
            [backend]
            kind = "http"
            "#,
        )
        .unwrap();
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.message.contains("endpoint_url")));
    }

    #[test]
    fn node_config_rejects_relative_root() {
        let cfg: NodeConfig = toml::from_str(
            r#"
            node_id = "n1"
            root_dir = "relative/path"
            allowed_commands = ["echo"]
            "#,
        )
        .unwrap();
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.severity == ConfigSeverity::Error && i.message.contains("absolute")));
    }

    #[test]
    fn node_config_rejects_path_in_allowlist() {
        let cfg: NodeConfig = toml::from_str(
            r#"
            node_id = "n1"
            root_dir = "/srv/nacc"
            allowed_commands = ["/usr/bin/echo"]
            "#,
        )
        .unwrap();
        assert!(cfg
            .validate()
            .iter()
            .any(|i| i.message.contains("basenames")));
    }
}
