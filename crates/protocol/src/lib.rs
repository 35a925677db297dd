//! Node tool protocol: request/response bodies for the six tool endpoints,
//! the error envelope, and the shared limits.
//!
//! Nodes expose this surface over HTTP-JSON; the orchestrator's in-process
//! transport reuses the same types directly. Everything here is plain data —
//! no behavior beyond serde and a few constructors.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Limits
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Max file size accepted by ReadFile/WriteFile (refused, not streamed).
pub const MAX_FILE_BYTES: u64 = 16 * 1024 * 1024;

/// Cap on captured stdout/stderr, each. Tail past the cap is dropped and a
/// truncation marker appended.
pub const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Marker appended when an output stream is cut at [`MAX_OUTPUT_BYTES`].
pub const TRUNCATION_MARKER: &str = "\n[truncated]";

/// Command timeout applied when the caller does not supply one.
pub const DEFAULT_TIMEOUT_SECONDS: u64 = 30;

/// Hard ceiling on caller-supplied command timeouts.
pub const MAX_TIMEOUT_SECONDS: u64 = 600;

/// Grace period between terminate and kill when a command times out.
pub const KILL_GRACE_SECONDS: u64 = 5;

/// Exit-code sentinel for signal death and synthetic failure entries.
pub const EXIT_CODE_SENTINEL: i32 = -1;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Error kinds a node reports. Clients branch on the kind, not the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorKind {
    PathEscape,
    FileNotFound,
    IsDirectory,
    AlreadyExists,
    EncodingError,
    TooLarge,
    CommandNotAllowed,
    Timeout,
    InternalError,
}

impl ToolErrorKind {
    /// Whether this kind is the caller's fault (HTTP 4xx) or the node's (5xx).
    pub fn is_caller_error(self) -> bool {
        !matches!(self, ToolErrorKind::InternalError | ToolErrorKind::Timeout)
    }

    /// The HTTP status the error envelope travels with.
    pub fn http_status(self) -> u16 {
        match self {
            ToolErrorKind::FileNotFound => 404,
            ToolErrorKind::AlreadyExists => 409,
            ToolErrorKind::TooLarge => 413,
            ToolErrorKind::CommandNotAllowed => 403,
            ToolErrorKind::PathEscape
            | ToolErrorKind::IsDirectory
            | ToolErrorKind::EncodingError => 400,
            ToolErrorKind::Timeout => 504,
            ToolErrorKind::InternalError => 500,
        }
    }
}

/// The error body carried inside [`ErrorEnvelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolError {
    pub kind: ToolErrorKind,
    pub message: String,
}

impl ToolError {
    pub fn new(kind: ToolErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ToolErrorKind::InternalError, message)
    }
}

impl std::fmt::Display for ToolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ToolError {}

/// Wire shape of every node-side failure: `{"error":{"kind","message"}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ToolError,
}

impl From<ToolError> for ErrorEnvelope {
    fn from(error: ToolError) -> Self {
        Self { error }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ListFiles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ListFilesRequest {
    /// Relative to the node root; empty means the root itself.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
    /// Glob applied to entry basenames.
    #[serde(default)]
    pub filter: Option<String>,
    /// Compute SHA-256 per file (directories never hash).
    #[serde(default)]
    pub with_hash: bool,
}

/// One row of a ListFiles reply.
///
/// `relative_path` is POSIX-separated, never absolute, never contains `..`,
/// and always resolves inside the node root.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FileEntry {
    pub relative_path: String,
    pub is_dir: bool,
    /// 0 for directories.
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListFilesResponse {
    /// Lexicographic by `relative_path`; deterministic across calls.
    pub entries: Vec<FileEntry>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ReadFile / WriteFile
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContentEncoding {
    #[default]
    #[serde(rename = "utf-8")]
    Utf8,
    /// Content travels as base64.
    Binary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileRequest {
    pub path: String,
    #[serde(default)]
    pub encoding: ContentEncoding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFileResponse {
    /// UTF-8 text or base64, per the request encoding.
    pub content: String,
    pub encoding: ContentEncoding,
    /// Hex digest over the file's exact bytes.
    pub sha256: String,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileRequest {
    pub path: String,
    pub content: String,
    #[serde(default)]
    pub encoding: ContentEncoding,
    #[serde(default)]
    pub overwrite: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteFileResponse {
    pub sha256: String,
    pub bytes_written: u64,
    /// Relative path of the `.bak` holding the prior content, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup_path: Option<String>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ExecuteCommand
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteCommandRequest {
    /// Non-empty; `argv[0]` must be in the node's allow-list.
    pub argv: Vec<String>,
    /// Relative to the node root, confined.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Overlaid on an empty base env (plus the node's configured PATH).
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Positive; clamped to [`MAX_TIMEOUT_SECONDS`].
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResult {
    pub node_id: String,
    pub stdout: String,
    pub stderr: String,
    /// Process exit code; [`EXIT_CODE_SENTINEL`] for signal death or a
    /// synthetic failure entry.
    pub exit_code: i32,
    pub duration_seconds: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stdout_truncated: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub stderr_truncated: bool,
    /// Set on synthetic entries (health filter, transport failure, timeout).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandResult {
    /// A synthetic entry for a node that produced no real result.
    pub fn synthetic(node_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: EXIT_CODE_SENTINEL,
            duration_seconds: 0.0,
            stdout_truncated: false,
            stderr_truncated: false,
            error: Some(reason.into()),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// SyncFiles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Make each target match the source exactly (copy + delete).
    Mirror,
    /// Copy only files absent at the target.
    Append,
    /// Return the plan without touching the filesystem.
    DryRun,
}

/// Node-local sync request.
///
/// `source_path` and every target path are relative to the node root. With a
/// `manifest`, Mirror skips the local source walk and instead prunes files
/// under each target whose relative path is not listed — the reconciliation
/// half of an orchestrator-driven cross-node mirror, where copies arrive via
/// WriteFile.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFilesRequest {
    #[serde(default)]
    pub source_path: String,
    pub target_paths: Vec<String>,
    pub strategy: SyncStrategy,
    #[serde(default)]
    pub manifest: Option<Vec<String>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncActionKind {
    Copy,
    Delete,
    Skip,
}

/// One planned or applied action within a sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncAction {
    pub relative_path: String,
    pub action: SyncActionKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256_before: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256_after: Option<String>,
    pub bytes: u64,
}

/// Per-target outcome of a sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    /// Target path (node-local sync) or target node id (orchestrator sync).
    pub target: String,
    pub strategy: SyncStrategy,
    pub files_copied: u64,
    pub files_deleted: u64,
    pub bytes_transferred: u64,
    pub actions: Vec<SyncAction>,
    /// Set when this target failed partway; the other targets proceed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncFilesResponse {
    pub reports: Vec<SyncReport>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// GetNodeInfo / health
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Live snapshot returned by GetNodeInfo, sampled at call time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub tags: Vec<String>,
    /// The allow-list echo the orchestrator's security stage consults.
    pub allowed_commands: Vec<String>,
    pub os: String,
    pub arch: String,
    pub hostname: String,
    pub cpu_percent: f32,
    pub memory_percent: f32,
    pub disk_percent: f32,
    pub uptime_seconds: u64,
}

/// `GET /healthz` body. No I/O behind it; the orchestrator's liveness signal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub node_id: String,
}

impl HealthResponse {
    pub fn ok(node_id: impl Into<String>) -> Self {
        Self {
            status: "ok".into(),
            node_id: node_id.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_envelope_wire_shape() {
        let env = ErrorEnvelope::from(ToolError::new(ToolErrorKind::PathEscape, "escapes root"));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["error"]["kind"], "path_escape");
        assert_eq!(json["error"]["message"], "escapes root");
    }

    #[test]
    fn caller_error_classification() {
        assert!(ToolErrorKind::PathEscape.is_caller_error());
        assert!(ToolErrorKind::CommandNotAllowed.is_caller_error());
        assert!(!ToolErrorKind::InternalError.is_caller_error());
        assert!(!ToolErrorKind::Timeout.is_caller_error());
    }

    #[test]
    fn encoding_default_is_utf8() {
        let req: ReadFileRequest = serde_json::from_str(r#"{"path":"a.txt"}"#).unwrap();
        assert_eq!(req.encoding, ContentEncoding::Utf8);
        let req: ReadFileRequest =
            serde_json::from_str(r#"{"path":"a.bin","encoding":"binary"}"#).unwrap();
        assert_eq!(req.encoding, ContentEncoding::Binary);
    }

    #[test]
    fn sync_strategy_wire_names() {
        assert_eq!(
            serde_json::to_string(&SyncStrategy::DryRun).unwrap(),
            r#""dry_run""#
        );
        let s: SyncStrategy = serde_json::from_str(r#""mirror""#).unwrap();
        assert_eq!(s, SyncStrategy::Mirror);
    }

    #[test]
    fn synthetic_result_uses_sentinel() {
        let r = CommandResult::synthetic("nodeB", "health probe failing");
        assert_eq!(r.exit_code, EXIT_CODE_SENTINEL);
        assert_eq!(r.error.as_deref(), Some("health probe failing"));
        let json = serde_json::to_value(&r).unwrap();
        // Truncation flags elide when false.
        assert!(json.get("stdout_truncated").is_none());
    }

    #[test]
    fn health_response_shape() {
        let json = serde_json::to_value(HealthResponse::ok("alpha")).unwrap();
        assert_eq!(json["status"], "ok");
        assert_eq!(json["node_id"], "alpha");
    }
}
