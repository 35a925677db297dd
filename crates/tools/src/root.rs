//! Path confinement for a node's root directory.
//!
//! Every caller-supplied path is interpreted relative to the root. Absolute
//! paths, `..` components, and symlinks whose resolution leaves the root are
//! all `PathEscape` — rejected before any filesystem effect.

use std::collections::{BTreeSet, HashMap};
use std::path::{Component, Path, PathBuf};

use nacc_protocol::{ToolError, ToolErrorKind};

/// Immutable per-node context handed to every tool function.
///
/// Built once at startup from the node configuration (or from an in-process
/// transport definition on the orchestrator side). There is no module-level
/// state; the context travels explicitly.
#[derive(Debug, Clone)]
pub struct RootContext {
    node_id: String,
    root: PathBuf,
    tags: Vec<String>,
    allowed_commands: BTreeSet<String>,
    path_env: String,
    sync_targets: HashMap<String, String>,
}

impl RootContext {
    /// Canonicalizes `root_dir` (which must exist) and freezes the allow-list.
    pub fn new(
        node_id: impl Into<String>,
        root_dir: impl AsRef<Path>,
        allowed_commands: impl IntoIterator<Item = String>,
        path_env: impl Into<String>,
        tags: Vec<String>,
        sync_targets: HashMap<String, String>,
    ) -> Result<Self, ToolError> {
        let root = root_dir.as_ref().canonicalize().map_err(|e| {
            ToolError::internal(format!(
                "cannot resolve root_dir '{}': {e}",
                root_dir.as_ref().display()
            ))
        })?;
        Ok(Self {
            node_id: node_id.into(),
            root,
            tags,
            allowed_commands: allowed_commands.into_iter().collect(),
            path_env: path_env.into(),
            sync_targets,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn path_env(&self) -> &str {
        &self.path_env
    }

    pub fn sync_targets(&self) -> &HashMap<String, String> {
        &self.sync_targets
    }

    /// Allow-list as an ordered list (for the GetNodeInfo echo).
    pub fn allowed_commands(&self) -> Vec<String> {
        self.allowed_commands.iter().cloned().collect()
    }

    /// Whether ExecuteCommand may spawn this basename.
    pub fn is_command_allowed(&self, basename: &str) -> bool {
        self.allowed_commands.contains(basename)
    }

    /// Resolve a caller-supplied relative path to an absolute path inside the
    /// root. Empty input means the root itself.
    ///
    /// Resolution canonicalizes the longest existing prefix (following
    /// symlinks) and re-checks containment, so a symlink pointing out of the
    /// root is an escape even when the literal path looks confined.
    pub fn resolve(&self, requested: &str) -> Result<PathBuf, ToolError> {
        if requested.is_empty() || requested == "." {
            return Ok(self.root.clone());
        }

        let requested_path = Path::new(requested);
        if requested_path.is_absolute() {
            return Err(ToolError::new(
                ToolErrorKind::PathEscape,
                format!("absolute paths are not allowed (got '{requested}')"),
            ));
        }
        for component in requested_path.components() {
            if matches!(component, Component::ParentDir) {
                return Err(ToolError::new(
                    ToolErrorKind::PathEscape,
                    "path must not contain '..' components",
                ));
            }
        }

        let candidate = self.root.join(requested_path);

        // Canonicalize what exists; re-append the non-existent tail.
        let resolved = if candidate.exists() {
            candidate.canonicalize().map_err(|e| {
                ToolError::internal(format!("cannot resolve '{}': {e}", candidate.display()))
            })?
        } else {
            let mut existing = candidate.as_path();
            let mut tail: Vec<&std::ffi::OsStr> = Vec::new();
            loop {
                if existing.exists() {
                    break;
                }
                match existing.parent() {
                    Some(parent) => {
                        if let Some(name) = existing.file_name() {
                            tail.push(name);
                        }
                        existing = parent;
                    }
                    None => break,
                }
            }
            let mut resolved = existing.canonicalize().map_err(|e| {
                ToolError::internal(format!(
                    "cannot resolve ancestor of '{}': {e}",
                    candidate.display()
                ))
            })?;
            for part in tail.into_iter().rev() {
                resolved.push(part);
            }
            resolved
        };

        if !resolved.starts_with(&self.root) {
            return Err(ToolError::new(
                ToolErrorKind::PathEscape,
                format!("path '{requested}' resolves outside the node root"),
            ));
        }

        Ok(resolved)
    }

    /// Render an absolute path inside the root as the POSIX-separated
    /// relative form used on the wire.
    pub fn relative_display(&self, absolute: &Path) -> String {
        let rel = absolute.strip_prefix(&self.root).unwrap_or(absolute);
        let parts: Vec<String> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
                _ => None,
            })
            .collect();
        parts.join("/")
    }
}
