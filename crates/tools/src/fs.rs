//! Filesystem tools: ListFiles, ReadFile, WriteFile.
//!
//! Writes are crash-safe: content goes to a temp sibling, is fsynced, renamed
//! over the target, and the parent directory is fsynced. An interrupted write
//! leaves either the old file or the new file, never a truncated one.

use std::path::{Path, PathBuf};

use base64::Engine;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::AsyncWriteExt;

use nacc_protocol::{
    ContentEncoding, FileEntry, ListFilesRequest, ListFilesResponse, ReadFileRequest,
    ReadFileResponse, ToolError, ToolErrorKind, WriteFileRequest, WriteFileResponse,
    MAX_FILE_BYTES,
};

use crate::root::RootContext;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Hash a file's exact bytes without loading it whole into memory.
pub(crate) async fn hash_file(path: &Path) -> Result<String, ToolError> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        use std::io::Read;
        let mut file = std::fs::File::open(&path)
            .map_err(|e| io_error(&path, e))?;
        let mut hasher = Sha256::new();
        let mut buf = [0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).map_err(|e| io_error(&path, e))?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| ToolError::internal(format!("hash task failed: {e}")))?
}

pub(crate) fn io_error(path: &Path, e: std::io::Error) -> ToolError {
    let kind = match e.kind() {
        std::io::ErrorKind::NotFound => ToolErrorKind::FileNotFound,
        _ => ToolErrorKind::InternalError,
    };
    ToolError::new(kind, format!("{}: {e}", path.display()))
}

fn modified_at(meta: &std::fs::Metadata) -> Option<DateTime<Utc>> {
    meta.modified().ok().map(DateTime::<Utc>::from)
}

/// Write `bytes` at `target` atomically: temp sibling → flush → fsync →
/// rename → parent-dir fsync.
pub(crate) async fn atomic_write(target: &Path, bytes: &[u8]) -> Result<(), ToolError> {
    let parent = target
        .parent()
        .ok_or_else(|| ToolError::internal("write target has no parent directory"))?;
    fs::create_dir_all(parent)
        .await
        .map_err(|e| io_error(parent, e))?;

    let tmp_name = format!(
        ".{}.{}.tmp",
        target.file_name().unwrap_or_default().to_string_lossy(),
        uuid::Uuid::new_v4().as_simple()
    );
    let tmp_path = target.with_file_name(tmp_name);

    let mut file = fs::File::create(&tmp_path)
        .await
        .map_err(|e| io_error(&tmp_path, e))?;
    let result: Result<(), ToolError> = async {
        file.write_all(bytes)
            .await
            .map_err(|e| io_error(&tmp_path, e))?;
        file.flush().await.map_err(|e| io_error(&tmp_path, e))?;
        file.sync_all().await.map_err(|e| io_error(&tmp_path, e))?;
        drop(file);
        fs::rename(&tmp_path, target)
            .await
            .map_err(|e| io_error(target, e))?;
        Ok(())
    }
    .await;

    if result.is_err() {
        let _ = fs::remove_file(&tmp_path).await;
        return result;
    }

    // Persist the rename itself.
    if let Ok(dir) = fs::File::open(parent).await {
        let _ = dir.sync_all().await;
    }
    Ok(())
}

/// Whether a directory entry may be visited: symlinks are followed only when
/// their resolution stays inside the root.
async fn entry_visitable(ctx: &RootContext, abs: &Path) -> bool {
    match fs::symlink_metadata(abs).await {
        Ok(meta) if meta.file_type().is_symlink() => match fs::canonicalize(abs).await {
            Ok(resolved) => resolved.starts_with(ctx.root()),
            Err(_) => false,
        },
        Ok(_) => true,
        Err(_) => false,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ListFiles
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// List entries under a confined path, lexicographically ordered.
pub async fn list_files(
    ctx: &RootContext,
    req: ListFilesRequest,
) -> Result<ListFilesResponse, ToolError> {
    let base = ctx.resolve(&req.path)?;
    let meta = fs::metadata(&base).await.map_err(|e| io_error(&base, e))?;

    let filter = match &req.filter {
        Some(pat) => Some(glob::Pattern::new(pat).map_err(|e| {
            ToolError::new(ToolErrorKind::EncodingError, format!("bad glob filter: {e}"))
        })?),
        None => None,
    };

    let mut entries = Vec::new();

    if meta.is_file() {
        // Listing a file yields the single entry.
        push_entry(ctx, &mut entries, &base, &meta, &filter, req.with_hash).await?;
    } else {
        let mut pending: Vec<PathBuf> = vec![base];
        while let Some(dir) = pending.pop() {
            let mut read_dir = fs::read_dir(&dir).await.map_err(|e| io_error(&dir, e))?;
            while let Some(entry) = read_dir
                .next_entry()
                .await
                .map_err(|e| io_error(&dir, e))?
            {
                let abs = entry.path();
                if !entry_visitable(ctx, &abs).await {
                    tracing::debug!(path = %abs.display(), "skipping entry escaping the root");
                    continue;
                }
                let meta = fs::metadata(&abs).await.map_err(|e| io_error(&abs, e))?;
                push_entry(ctx, &mut entries, &abs, &meta, &filter, req.with_hash).await?;
                if req.recursive && meta.is_dir() {
                    pending.push(abs);
                }
            }
        }
    }

    entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(ListFilesResponse { entries })
}

async fn push_entry(
    ctx: &RootContext,
    entries: &mut Vec<FileEntry>,
    abs: &Path,
    meta: &std::fs::Metadata,
    filter: &Option<glob::Pattern>,
    with_hash: bool,
) -> Result<(), ToolError> {
    if let Some(pat) = filter {
        let basename = abs
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !pat.matches(&basename) {
            return Ok(());
        }
    }
    let is_dir = meta.is_dir();
    let sha256 = if with_hash && !is_dir {
        Some(hash_file(abs).await?)
    } else {
        None
    };
    entries.push(FileEntry {
        relative_path: ctx.relative_display(abs),
        is_dir,
        size_bytes: if is_dir { 0 } else { meta.len() },
        sha256,
        modified_at: modified_at(meta),
    });
    Ok(())
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ReadFile
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Read a confined file; refuses anything over [`MAX_FILE_BYTES`].
pub async fn read_file(
    ctx: &RootContext,
    req: ReadFileRequest,
) -> Result<ReadFileResponse, ToolError> {
    let path = ctx.resolve(&req.path)?;
    let meta = fs::metadata(&path).await.map_err(|e| io_error(&path, e))?;
    if meta.is_dir() {
        return Err(ToolError::new(
            ToolErrorKind::IsDirectory,
            format!("'{}' is a directory", req.path),
        ));
    }
    if meta.len() > MAX_FILE_BYTES {
        return Err(ToolError::new(
            ToolErrorKind::TooLarge,
            format!(
                "'{}' is {} bytes; the ceiling is {MAX_FILE_BYTES}",
                req.path,
                meta.len()
            ),
        ));
    }

    let bytes = fs::read(&path).await.map_err(|e| io_error(&path, e))?;
    let sha256 = sha256_hex(&bytes);
    let size_bytes = bytes.len() as u64;

    let content = match req.encoding {
        ContentEncoding::Utf8 => String::from_utf8(bytes).map_err(|_| {
            ToolError::new(
                ToolErrorKind::EncodingError,
                format!("'{}' is not valid UTF-8; request binary encoding", req.path),
            )
        })?,
        ContentEncoding::Binary => base64::engine::general_purpose::STANDARD.encode(&bytes),
    };

    Ok(ReadFileResponse {
        content,
        encoding: req.encoding,
        sha256,
        size_bytes,
    })
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// WriteFile
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Write a confined file atomically.
///
/// Overwrites keep the prior content reachable at `<path>.bak` (one backup
/// retained) until the next write to the same path.
pub async fn write_file(
    ctx: &RootContext,
    req: WriteFileRequest,
) -> Result<WriteFileResponse, ToolError> {
    let bytes = match req.encoding {
        ContentEncoding::Utf8 => req.content.clone().into_bytes(),
        ContentEncoding::Binary => base64::engine::general_purpose::STANDARD
            .decode(req.content.as_bytes())
            .map_err(|e| {
                ToolError::new(ToolErrorKind::EncodingError, format!("bad base64: {e}"))
            })?,
    };
    if bytes.len() as u64 > MAX_FILE_BYTES {
        return Err(ToolError::new(
            ToolErrorKind::TooLarge,
            format!(
                "content is {} bytes; the ceiling is {MAX_FILE_BYTES}",
                bytes.len()
            ),
        ));
    }

    let path = ctx.resolve(&req.path)?;
    let mut backup_path = None;

    match fs::metadata(&path).await {
        Ok(meta) if meta.is_dir() => {
            return Err(ToolError::new(
                ToolErrorKind::IsDirectory,
                format!("'{}' is a directory", req.path),
            ));
        }
        Ok(_) if !req.overwrite => {
            return Err(ToolError::new(
                ToolErrorKind::AlreadyExists,
                format!("'{}' exists and overwrite=false", req.path),
            ));
        }
        Ok(_) => {
            // Keep the prior content as a hard link before replacing the
            // target, so an interruption never loses the old bytes.
            let bak = bak_path(&path);
            let _ = fs::remove_file(&bak).await;
            std::fs::hard_link(&path, &bak).map_err(|e| io_error(&bak, e))?;
            backup_path = Some(ctx.relative_display(&bak));
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(io_error(&path, e)),
    }

    atomic_write(&path, &bytes).await?;

    Ok(WriteFileResponse {
        sha256: sha256_hex(&bytes),
        bytes_written: bytes.len() as u64,
        backup_path,
    })
}

fn bak_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".bak");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn ctx(dir: &TempDir) -> RootContext {
        RootContext::new(
            "fs-test",
            dir.path(),
            Vec::new(),
            "/usr/bin:/bin",
            Vec::new(),
            HashMap::new(),
        )
        .unwrap()
    }

    fn write_req(path: &str, content: &str, overwrite: bool) -> WriteFileRequest {
        WriteFileRequest {
            path: path.into(),
            content: content.into(),
            encoding: ContentEncoding::Utf8,
            overwrite,
        }
    }

    #[tokio::test]
    async fn write_then_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);

        let written = write_file(&ctx, write_req("notes/hello.txt", "hello, node\n", false))
            .await
            .unwrap();
        let read = read_file(
            &ctx,
            ReadFileRequest {
                path: "notes/hello.txt".into(),
                encoding: ContentEncoding::Utf8,
            },
        )
        .await
        .unwrap();

        assert_eq!(read.content, "hello, node\n");
        assert_eq!(read.sha256, written.sha256);
    }

    #[tokio::test]
    async fn write_refuses_existing_without_overwrite() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);

        write_file(&ctx, write_req("a.txt", "one", false)).await.unwrap();
        let err = write_file(&ctx, write_req("a.txt", "two", false))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::AlreadyExists);
        // Untouched.
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one");
    }

    #[tokio::test]
    async fn overwrite_keeps_one_backup() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);

        write_file(&ctx, write_req("a.txt", "old", false)).await.unwrap();
        let res = write_file(&ctx, write_req("a.txt", "new", true)).await.unwrap();
        assert_eq!(res.backup_path.as_deref(), Some("a.txt.bak"));
        assert_eq!(std::fs::read_to_string(dir.path().join("a.txt")).unwrap(), "new");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt.bak")).unwrap(),
            "old"
        );

        // A further overwrite replaces the backup with the latest prior content.
        write_file(&ctx, write_req("a.txt", "newer", true)).await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("a.txt.bak")).unwrap(),
            "new"
        );
    }

    #[tokio::test]
    async fn binary_roundtrip_via_base64() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let raw: Vec<u8> = (0u8..=255).collect();
        let encoded = base64::engine::general_purpose::STANDARD.encode(&raw);

        write_file(
            &ctx,
            WriteFileRequest {
                path: "blob.bin".into(),
                content: encoded.clone(),
                encoding: ContentEncoding::Binary,
                overwrite: false,
            },
        )
        .await
        .unwrap();

        let read = read_file(
            &ctx,
            ReadFileRequest {
                path: "blob.bin".into(),
                encoding: ContentEncoding::Binary,
            },
        )
        .await
        .unwrap();
        assert_eq!(read.content, encoded);
        assert_eq!(read.size_bytes, 256);
    }

    #[tokio::test]
    async fn read_rejects_directory_and_missing() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        std::fs::create_dir(dir.path().join("d")).unwrap();

        let err = read_file(
            &ctx,
            ReadFileRequest {
                path: "d".into(),
                encoding: ContentEncoding::Utf8,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::IsDirectory);

        let err = read_file(
            &ctx,
            ReadFileRequest {
                path: "ghost.txt".into(),
                encoding: ContentEncoding::Utf8,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::FileNotFound);
    }

    #[tokio::test]
    async fn read_rejects_non_utf8_as_text() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        std::fs::write(dir.path().join("bad.bin"), [0xff, 0xfe, 0x00]).unwrap();

        let err = read_file(
            &ctx,
            ReadFileRequest {
                path: "bad.bin".into(),
                encoding: ContentEncoding::Utf8,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::EncodingError);
    }

    #[tokio::test]
    async fn write_escape_leaves_filesystem_untouched() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let err = write_file(&ctx, write_req("../escape.txt", "x", false))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::PathEscape);
        assert!(!dir.path().parent().unwrap().join("escape.txt").exists());
    }

    #[tokio::test]
    async fn list_is_sorted_and_deterministic() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("b.txt"), "b").unwrap();
        std::fs::write(dir.path().join("a.txt"), "a").unwrap();
        std::fs::write(dir.path().join("sub/c.txt"), "c").unwrap();

        let req = ListFilesRequest {
            path: String::new(),
            recursive: true,
            filter: None,
            with_hash: false,
        };
        let first = list_files(&ctx, req.clone()).await.unwrap();
        let second = list_files(&ctx, req).await.unwrap();

        let names: Vec<&str> = first
            .entries
            .iter()
            .map(|e| e.relative_path.as_str())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub", "sub/c.txt"]);
        assert_eq!(first.entries, second.entries);
    }

    #[tokio::test]
    async fn list_filter_and_hash() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        std::fs::write(dir.path().join("keep.log"), "log").unwrap();
        std::fs::write(dir.path().join("skip.txt"), "txt").unwrap();

        let res = list_files(
            &ctx,
            ListFilesRequest {
                path: String::new(),
                recursive: false,
                filter: Some("*.log".into()),
                with_hash: true,
            },
        )
        .await
        .unwrap();

        assert_eq!(res.entries.len(), 1);
        assert_eq!(res.entries[0].relative_path, "keep.log");
        assert_eq!(
            res.entries[0].sha256.as_deref(),
            Some(sha256_hex(b"log").as_str())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn list_skips_escaping_symlinks() {
        let outside = TempDir::new().unwrap();
        std::fs::write(outside.path().join("secret"), "s").unwrap();
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("ok.txt"), "ok").unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("leak")).unwrap();

        let ctx = ctx(&dir);
        let res = list_files(
            &ctx,
            ListFilesRequest {
                path: String::new(),
                recursive: true,
                filter: None,
                with_hash: false,
            },
        )
        .await
        .unwrap();

        let names: Vec<&str> = res
            .entries
            .iter()
            .map(|e| e.relative_path.as_str())
            .collect();
        assert_eq!(names, vec!["ok.txt"]);
    }

    #[tokio::test]
    async fn oversized_write_is_refused_untouched() {
        let dir = TempDir::new().unwrap();
        let ctx = ctx(&dir);
        let big = "x".repeat((MAX_FILE_BYTES + 1) as usize);
        let err = write_file(&ctx, write_req("big.txt", &big, false))
            .await
            .unwrap_err();
        assert_eq!(err.kind, ToolErrorKind::TooLarge);
        assert!(!dir.path().join("big.txt").exists());
    }
}
