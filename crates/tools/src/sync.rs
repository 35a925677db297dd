//! SyncFiles tool — node-local directory synchronization.
//!
//! Plans are hash-deltas: a file is copied only when missing or different,
//! so re-running a Mirror over an unchanged tree moves zero bytes. Mirror
//! also deletes target files absent from the source; Append never deletes;
//! DryRun returns the Mirror plan without touching the filesystem.
//!
//! A request carrying a `manifest` runs in reconciliation mode: the manifest
//! is the authoritative file set and unlisted files under each target are
//! pruned. The orchestrator uses this for the delete half of a cross-node
//! mirror, where copies arrive separately via WriteFile.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tokio::fs;

use nacc_protocol::{
    SyncAction, SyncActionKind, SyncFilesRequest, SyncFilesResponse, SyncReport, SyncStrategy,
    ToolError, ToolErrorKind,
};

use crate::fs::{hash_file, io_error};
use crate::root::RootContext;

struct TreeFile {
    abs: PathBuf,
    size: u64,
    sha256: String,
}

/// Collect all regular files under `base`, keyed by path relative to `base`.
/// Symlinks that resolve outside the node root are skipped.
async fn collect_tree(
    ctx: &RootContext,
    base: &Path,
) -> Result<BTreeMap<String, TreeFile>, ToolError> {
    let mut files = BTreeMap::new();
    if !base.exists() {
        return Ok(files);
    }
    let mut pending = vec![base.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let mut read_dir = fs::read_dir(&dir).await.map_err(|e| io_error(&dir, e))?;
        while let Some(entry) = read_dir.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let abs = entry.path();
            let link_meta = fs::symlink_metadata(&abs)
                .await
                .map_err(|e| io_error(&abs, e))?;
            if link_meta.file_type().is_symlink() {
                match fs::canonicalize(&abs).await {
                    Ok(resolved) if resolved.starts_with(ctx.root()) => {}
                    _ => continue,
                }
            }
            let meta = fs::metadata(&abs).await.map_err(|e| io_error(&abs, e))?;
            if meta.is_dir() {
                pending.push(abs);
            } else {
                let rel = abs
                    .strip_prefix(base)
                    .map_err(|_| ToolError::internal("entry outside its own base"))?
                    .components()
                    .filter_map(|c| match c {
                        std::path::Component::Normal(s) => Some(s.to_string_lossy()),
                        _ => None,
                    })
                    .collect::<Vec<_>>()
                    .join("/");
                let sha256 = hash_file(&abs).await?;
                files.insert(
                    rel,
                    TreeFile {
                        abs,
                        size: meta.len(),
                        sha256,
                    },
                );
            }
        }
    }
    Ok(files)
}

/// Copy `src` over `dst` atomically (temp sibling + rename).
async fn atomic_copy(src: &Path, dst: &Path) -> Result<(), ToolError> {
    let parent = dst
        .parent()
        .ok_or_else(|| ToolError::internal("copy target has no parent directory"))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| io_error(parent, e))?;
    let tmp = dst.with_file_name(format!(
        ".{}.{}.tmp",
        dst.file_name().unwrap_or_default().to_string_lossy(),
        uuid::Uuid::new_v4().as_simple()
    ));
    if let Err(e) = fs::copy(src, &tmp).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(io_error(src, e));
    }
    fs::rename(&tmp, dst).await.map_err(|e| io_error(dst, e))
}

/// Best-effort removal of directories emptied by deletions.
async fn prune_empty_dirs(base: &Path, deleted: &[PathBuf]) {
    let mut dirs: Vec<PathBuf> = deleted
        .iter()
        .filter_map(|p| p.parent().map(Path::to_path_buf))
        .filter(|d| d.starts_with(base) && d != base)
        .collect();
    dirs.sort();
    dirs.dedup();
    // Deepest first.
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        let mut current = dir;
        while current.starts_with(base) && current != base {
            if fs::remove_dir(&current).await.is_err() {
                break;
            }
            match current.parent() {
                Some(parent) => current = parent.to_path_buf(),
                None => break,
            }
        }
    }
}

/// A target entry may name a configured sync target instead of a path.
fn resolve_target(ctx: &RootContext, target: &str) -> String {
    ctx.sync_targets()
        .get(target)
        .cloned()
        .unwrap_or_else(|| target.to_owned())
}

/// Synchronize the source tree into each target path.
pub async fn sync_files(
    ctx: &RootContext,
    req: SyncFilesRequest,
) -> Result<SyncFilesResponse, ToolError> {
    if req.target_paths.is_empty() {
        return Err(ToolError::new(
            ToolErrorKind::FileNotFound,
            "target_paths must not be empty",
        ));
    }

    if let Some(manifest) = &req.manifest {
        return reconcile_manifest(ctx, &req, manifest).await;
    }

    let source_base = ctx.resolve(&req.source_path)?;
    let source_meta = fs::metadata(&source_base)
        .await
        .map_err(|e| io_error(&source_base, e))?;
    if !source_meta.is_dir() {
        return Err(ToolError::new(
            ToolErrorKind::IsDirectory,
            format!("source '{}' must be a directory", req.source_path),
        ));
    }
    let source = collect_tree(ctx, &source_base).await?;

    let mut reports = Vec::new();
    for target_name in &req.target_paths {
        let target_rel = resolve_target(ctx, target_name);
        let target_base = ctx.resolve(&target_rel)?;
        let target = collect_tree(ctx, &target_base).await?;

        let mut actions = Vec::new();
        for (rel, src_file) in &source {
            let existing = target.get(rel);
            let action = match (&req.strategy, existing) {
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
        if !matches!(req.strategy, SyncStrategy::Append) {
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

        let mut files_copied = 0;
        let mut files_deleted = 0;
        let mut bytes_transferred = 0;

        if !matches!(req.strategy, SyncStrategy::DryRun) {
            let mut removed = Vec::new();
            for action in &actions {
                match action.action {
                    SyncActionKind::Copy => {
                        let src_abs = &source[&action.relative_path].abs;
                        let dst_abs = target_base.join(&action.relative_path);
                        atomic_copy(src_abs, &dst_abs).await?;
                        files_copied += 1;
                        bytes_transferred += action.bytes;
                    }
                    SyncActionKind::Delete => {
                        let dst_abs = target_base.join(&action.relative_path);
                        fs::remove_file(&dst_abs)
                            .await
                            .map_err(|e| io_error(&dst_abs, e))?;
                        removed.push(dst_abs);
                        files_deleted += 1;
                    }
                    SyncActionKind::Skip => {}
                }
            }
            prune_empty_dirs(&target_base, &removed).await;
        }

        tracing::debug!(
            node_id = %ctx.node_id(),
            target = %target_name,
            strategy = ?req.strategy,
            files_copied,
            files_deleted,
            "sync applied"
        );

        reports.push(SyncReport {
            target: target_name.clone(),
            strategy: req.strategy,
            files_copied,
            files_deleted,
            bytes_transferred,
            actions,
            error: None,
        });
    }

    Ok(SyncFilesResponse { reports })
}

/// Manifest reconciliation: prune files under each target whose relative
/// path is not listed. Applies for Mirror; plans only for DryRun.
async fn reconcile_manifest(
    ctx: &RootContext,
    req: &SyncFilesRequest,
    manifest: &[String],
) -> Result<SyncFilesResponse, ToolError> {
    let keep: std::collections::BTreeSet<&str> = manifest.iter().map(String::as_str).collect();
    let apply = matches!(req.strategy, SyncStrategy::Mirror);

    let mut reports = Vec::new();
    for target_name in &req.target_paths {
        let target_base = ctx.resolve(&resolve_target(ctx, target_name))?;
        let target = collect_tree(ctx, &target_base).await?;

        let mut actions = Vec::new();
        let mut removed = Vec::new();
        let mut files_deleted = 0;
        for (rel, tgt_file) in &target {
            if keep.contains(rel.as_str()) {
                continue;
            }
            if apply {
                let dst_abs = target_base.join(rel);
                fs::remove_file(&dst_abs)
                    .await
                    .map_err(|e| io_error(&dst_abs, e))?;
                removed.push(dst_abs);
                files_deleted += 1;
            }
            actions.push(SyncAction {
                relative_path: rel.clone(),
                action: SyncActionKind::Delete,
                sha256_before: Some(tgt_file.sha256.clone()),
                sha256_after: None,
                bytes: 0,
            });
        }
        if apply {
            prune_empty_dirs(&target_base, &removed).await;
        }

        reports.push(SyncReport {
            target: target_name.clone(),
            strategy: req.strategy,
            files_copied: 0,
            files_deleted,
            bytes_transferred: 0,
            actions,
            error: None,
        });
    }

    Ok(SyncFilesResponse { reports })
}
