//! Cross-node sync: one source node fanned out to ordered targets.
//!
//! The plan is a hash-delta between recursive listings, so repeat mirrors
//! move zero bytes. Copies travel as ReadFile(binary) + WriteFile(overwrite)
//! pairs; Mirror deletions are applied by the target node itself through a
//! manifest-mirror SyncFiles call; DryRun returns the plan untouched.
//! A failing target never aborts the others.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use nacc_domain::{Error, Result};
use nacc_protocol::{
    ContentEncoding, FileEntry, ListFilesRequest, ReadFileRequest, SyncAction, SyncActionKind,
    SyncFilesRequest, SyncReport, SyncStrategy, ToolErrorKind, WriteFileRequest,
};

use crate::audit::{AuditAction, AuditLog, AuditOutcome, AuditRecord};
use crate::cancel::CancelToken;
use crate::registry::NodeRegistry;
use crate::transport::{NodeTransport, ToolCall, TransportError};

const LIST_DEADLINE: Duration = Duration::from_secs(30);
const FILE_DEADLINE: Duration = Duration::from_secs(120);

/// A cross-node sync request as accepted by `POST /sync`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
    pub source_node_id: String,
    pub source_path: String,
    /// Ordered; reports come back in this order.
    pub target_node_ids: Vec<String>,
    /// When absent the planner's sync stage picks one.
    #[serde(default)]
    pub strategy: Option<SyncStrategy>,
    #[serde(default)]
    pub actor: Option<String>,
}

struct RemoteFile {
    sha256: String,
    size: u64,
}

/// Reduce a recursive listing to files keyed by path relative to the base.
fn index_listing(entries: Vec<FileEntry>, base: &str) -> BTreeMap<String, RemoteFile> {
    let prefix = if base.is_empty() {
        String::new()
    } else {
        format!("{base}/")
    };
    entries
        .into_iter()
        .filter(|e| !e.is_dir)
        .filter_map(|e| {
            let rel = e.relative_path.strip_prefix(&prefix)?.to_owned();
            Some((
                rel,
                RemoteFile {
                    sha256: e.sha256.unwrap_or_default(),
                    size: e.size_bytes,
                },
            ))
        })
        .collect()
}

/// Collapse a caller path to its normal components (`./data` → `data`).
fn normalize_rel(path: &str) -> String {
    std::path::Path::new(path)
        .components()
        .filter_map(|c| match c {
            std::path::Component::Normal(s) => Some(s.to_string_lossy()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}

fn join_rel(base: &str, rel: &str) -> String {
    if base.is_empty() {
        rel.to_owned()
    } else {
        format!("{base}/{rel}")
    }
}

async fn list_remote(
    transport: &dyn NodeTransport,
    path: &str,
    cancel: &CancelToken,
) -> std::result::Result<BTreeMap<String, RemoteFile>, TransportError> {
    let reply = transport
        .call(
            ToolCall::ListFiles(ListFilesRequest {
                path: path.to_owned(),
                recursive: true,
                filter: None,
                with_hash: true,
            }),
            LIST_DEADLINE,
            cancel,
        )
        .await;
    match reply {
        Ok(r) => Ok(index_listing(
            r.into_list_files().map(|l| l.entries).unwrap_or_default(),
            path,
        )),
        // An absent tree on the target is simply empty.
        Err(TransportError::Tool(e)) if e.kind == ToolErrorKind::FileNotFound => {
            Ok(BTreeMap::new())
        }
        Err(e) => Err(e),
    }
}

/// Run the sync against every target, in order. The returned reports match
/// `target_node_ids` one-to-one; per-target failures are recorded in the
/// report's `error` field.
pub async fn sync_across_nodes(
    registry: &NodeRegistry,
    audit: &AuditLog,
    req: &SyncRequest,
    strategy: SyncStrategy,
    cancel: &CancelToken,
) -> Result<Vec<SyncReport>> {
    let source_transport = registry
        .transport(&req.source_node_id)
        .ok_or_else(|| Error::Node {
            node_id: req.source_node_id.clone(),
            message: "unknown source node".into(),
        })?;
    let base = normalize_rel(&req.source_path);

    let source = list_remote(source_transport.as_ref(), &base, cancel)
        .await
        .map_err(|e| Error::Node {
            node_id: req.source_node_id.clone(),
            message: format!("source listing failed: {e}"),
        })?;
    let manifest: Vec<String> = source.keys().cloned().collect();

    let mut reports = Vec::with_capacity(req.target_node_ids.len());
    for target_id in &req.target_node_ids {
        if cancel.is_cancelled() {
            reports.push(failed_report(target_id, strategy, "cancelled"));
            continue;
        }
        let report = sync_one_target(
            registry,
            audit,
            source_transport.as_ref(),
            &req.source_node_id,
            &source,
            &manifest,
            &base,
            target_id,
            strategy,
            cancel,
        )
        .await;
        reports.push(report);
    }
    Ok(reports)
}

fn failed_report(target: &str, strategy: SyncStrategy, message: impl Into<String>) -> SyncReport {
    SyncReport {
        target: target.into(),
        strategy,
        files_copied: 0,
        files_deleted: 0,
        bytes_transferred: 0,
        actions: Vec::new(),
        error: Some(message.into()),
    }
}

#[allow(clippy::too_many_arguments)]
async fn sync_one_target(
    registry: &NodeRegistry,
    audit: &AuditLog,
    source_transport: &dyn NodeTransport,
    source_id: &str,
    source: &BTreeMap<String, RemoteFile>,
    manifest: &[String],
    base: &str,
    target_id: &str,
    strategy: SyncStrategy,
    cancel: &CancelToken,
) -> SyncReport {
    let Some(target_transport) = registry.transport(target_id) else {
        return failed_report(target_id, strategy, "unknown target node");
    };

    let target = match list_remote(target_transport.as_ref(), base, cancel).await {
        Ok(t) => t,
        Err(e) => return failed_report(target_id, strategy, format!("target listing failed: {e}")),
    };

    // ── Plan ─────────────────────────────────────────────────────────
    let mut actions = Vec::new();
    for (rel, src_file) in source {
        let existing = target.get(rel);
        let action = match (strategy, existing) {
            (SyncStrategy::Append, Some(_)) => SyncActionKind::Skip,
            (_, Some(tgt)) if tgt.sha256 == src_file.sha256 => SyncActionKind::Skip,
            _ => SyncActionKind::Copy,
        };
        actions.push(SyncAction {
            relative_path: rel.clone(),
            action,
            sha256_before: existing.map(|t| t.sha256.clone()),
            sha256_after: Some(src_file.sha256.clone()),
            bytes: if action == SyncActionKind::Copy {
                src_file.size
            } else {
                0
            },
        });
    }
    if !matches!(strategy, SyncStrategy::Append) {
        for (rel, tgt_file) in &target {
            if !source.contains_key(rel) {
                actions.push(SyncAction {
                    relative_path: rel.clone(),
                    action: SyncActionKind::Delete,
                    sha256_before: Some(tgt_file.sha256.clone()),
                    sha256_after: None,
                    bytes: 0,
                });
            }
        }
    }
    actions.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

    if matches!(strategy, SyncStrategy::DryRun) {
        return SyncReport {
            target: target_id.into(),
            strategy,
            files_copied: 0,
            files_deleted: 0,
            bytes_transferred: 0,
            actions,
            error: None,
        };
    }

    // ── Copies: ReadFile on the source, WriteFile on the target ──────
    let mut files_copied = 0;
    let mut bytes_transferred = 0;
    let mut error = None;
    for action in actions.iter().filter(|a| a.action == SyncActionKind::Copy) {
        if cancel.is_cancelled() {
            error = Some("cancelled".to_owned());
            break;
        }
        let read = source_transport
            .call(
                ToolCall::ReadFile(ReadFileRequest {
                    path: join_rel(base, &action.relative_path),
                    encoding: ContentEncoding::Binary,
                }),
                FILE_DEADLINE,
                cancel,
            )
            .await;
        let content = match read.map(|r| r.into_read_file()) {
            Ok(Some(r)) => r,
            Ok(None) => {
                error = Some(format!("mismatched read reply for '{}'", action.relative_path));
                break;
            }
            Err(e) => {
                audit
                    .record(AuditRecord::new(
                        AuditAction::ReadFile,
                        source_id,
                        AuditOutcome::error(format!(
                            "sync read '{}' failed: {e}",
                            action.relative_path
                        )),
                    ))
                    .await;
                error = Some(format!("read '{}' failed: {e}", action.relative_path));
                break;
            }
        };
        let write = target_transport
            .call(
                ToolCall::WriteFile(WriteFileRequest {
                    path: join_rel(base, &action.relative_path),
                    content: content.content,
                    encoding: ContentEncoding::Binary,
                    overwrite: true,
                }),
                FILE_DEADLINE,
                cancel,
            )
            .await;
        let path = join_rel(base, &action.relative_path);
        match write {
            Ok(_) => {
                audit
                    .record(
                        AuditRecord::new(
                            AuditAction::WriteFile,
                            target_id,
                            AuditOutcome::ok(format!("sync wrote '{path}'")),
                        )
                        .fingerprint_of(&path),
                    )
                    .await;
            }
            Err(e) => {
                audit
                    .record(
                        AuditRecord::new(
                            AuditAction::WriteFile,
                            target_id,
                            AuditOutcome::error(format!("sync write '{path}' failed: {e}")),
                        )
                        .fingerprint_of(&path),
                    )
                    .await;
                error = Some(format!("write '{}' failed: {e}", action.relative_path));
                break;
            }
        }
        files_copied += 1;
        bytes_transferred += content.size_bytes;
    }

    // ── Mirror reconciliation: the target prunes unlisted files ──────
    let mut files_deleted = 0;
    let needs_deletes = actions.iter().any(|a| a.action == SyncActionKind::Delete);
    if error.is_none() && matches!(strategy, SyncStrategy::Mirror) && needs_deletes {
        let reply = target_transport
            .call(
                ToolCall::SyncFiles(SyncFilesRequest {
                    source_path: String::new(),
                    target_paths: vec![base.to_owned()],
                    strategy: SyncStrategy::Mirror,
                    manifest: Some(manifest.to_vec()),
                }),
                FILE_DEADLINE,
                cancel,
            )
            .await;
        match reply.map(|r| r.into_sync_files()) {
            Ok(Some(response)) => {
                files_deleted = response
                    .reports
                    .first()
                    .map(|r| r.files_deleted)
                    .unwrap_or(0);
            }
            Ok(None) => error = Some("mismatched sync reply from target".into()),
            Err(e) => error = Some(format!("target reconciliation failed: {e}")),
        }
    }

    tracing::info!(
        target = %target_id,
        ?strategy,
        files_copied,
        files_deleted,
        bytes_transferred,
        error = error.as_deref().unwrap_or(""),
        "cross-node sync target done"
    );

    SyncReport {
        target: target_id.into(),
        strategy,
        files_copied,
        files_deleted,
        bytes_transferred,
        actions,
        error,
    }
}
