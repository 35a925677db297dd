//! Append-only audit log.
//!
//! One JSON object per line, strictly increasing gap-free sequence numbers
//! assigned at enqueue time, a single writer task behind a bounded queue
//! (full queue blocks producers — events are never dropped). Retention
//! trimming happens only at startup or through an explicit rotate, never
//! mid-write; recovery on open truncates a trailing partial line.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot, Mutex};

use nacc_domain::{Error, Result};

/// Producer-side queue bound; backpressure blocks beyond it.
pub const QUEUE_BOUND: usize = 1024;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Event model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ListFiles,
    ReadFile,
    WriteFile,
    ExecuteCommand,
    SyncPath,
    AgentProbe,
    NodeRegister,
    HealthTransition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditOutcome {
    pub success: bool,
    pub message: String,
}

impl AuditOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
        }
    }
}

/// One immutable line of the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: AuditAction,
    /// A node id, or `"*"` for fan-out and system-wide events.
    pub target: String,
    /// SHA-256 over the canonical JSON of the triggering input.
    pub fingerprint: String,
    pub outcome: AuditOutcome,
    /// Stage fallback flags, deny reasons, and similar per-action extras.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<serde_json::Value>,
}

/// What producers submit; `seq` and `timestamp` are assigned at enqueue.
#[derive(Debug, Clone)]
pub struct AuditRecord {
    pub actor: String,
    pub action: AuditAction,
    pub target: String,
    pub fingerprint: String,
    pub outcome: AuditOutcome,
    pub detail: Option<serde_json::Value>,
}

impl AuditRecord {
    pub fn new(action: AuditAction, target: impl Into<String>, outcome: AuditOutcome) -> Self {
        Self {
            actor: "system".into(),
            action,
            target: target.into(),
            fingerprint: String::new(),
            outcome,
            detail: None,
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn fingerprint_of<T: Serialize>(mut self, input: &T) -> Self {
        self.fingerprint = fingerprint(input);
        self
    }

    pub fn detail(mut self, detail: serde_json::Value) -> Self {
        self.detail = Some(detail);
        self
    }
}

/// SHA-256 hex over the canonical JSON rendering of a request.
/// (`serde_json` maps are ordered, so key order is stable.)
pub fn fingerprint<T: Serialize>(value: &T) -> String {
    let canonical = serde_json::to_value(value)
        .and_then(|v| serde_json::to_string(&v))
        .unwrap_or_default();
    hex::encode(Sha256::digest(canonical.as_bytes()))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// The log
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

enum WriterMessage {
    Event(AuditEvent),
    /// Barrier: ack once everything before it reached the file.
    Flush(oneshot::Sender<()>),
    /// Trim to the retention budget, reopen, ack.
    Rotate(oneshot::Sender<Result<()>>),
}

pub struct AuditLog {
    tx: mpsc::Sender<WriterMessage>,
    /// Sequence counter; held across the enqueue so channel order always
    /// matches sequence order and a full queue blocks producers here.
    seq: Mutex<u64>,
}

impl AuditLog {
    /// Recover the file (truncate a partial trailing line), trim it to the
    /// retention budget, and start the single writer task.
    pub fn open(path: impl Into<PathBuf>, retention_bytes: u64) -> Result<Arc<Self>> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        recover_partial_line(&path)?;
        trim_to_budget(&path, retention_bytes)?;

        let (tx, mut rx) = mpsc::channel::<WriterMessage>(QUEUE_BOUND);
        let writer_path = path.clone();
        tokio::spawn(async move {
            let mut file = match tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&writer_path)
                .await
            {
                Ok(f) => f,
                Err(e) => {
                    tracing::error!(path = %writer_path.display(), error = %e, "audit writer failed to open log");
                    return;
                }
            };

            while let Some(message) = rx.recv().await {
                match message {
                    WriterMessage::Event(event) => {
                        let mut line = match serde_json::to_string(&event) {
                            Ok(l) => l,
                            Err(e) => {
                                tracing::error!(seq = event.seq, error = %e, "unserializable audit event");
                                continue;
                            }
                        };
                        line.push('\n');
                        if let Err(e) = file.write_all(line.as_bytes()).await {
                            tracing::error!(seq = event.seq, error = %e, "audit write failed");
                        }
                    }
                    WriterMessage::Flush(ack) => {
                        let _ = file.flush().await;
                        let _ = ack.send(());
                    }
                    WriterMessage::Rotate(ack) => {
                        let _ = file.flush().await;
                        drop(file);
                        let result = trim_to_budget(&writer_path, retention_bytes);
                        file = match tokio::fs::OpenOptions::new()
                            .create(true)
                            .append(true)
                            .open(&writer_path)
                            .await
                        {
                            Ok(f) => f,
                            Err(e) => {
                                let _ = ack.send(Err(Error::Audit(e.to_string())));
                                return;
                            }
                        };
                        let _ = ack.send(result);
                    }
                }
            }
        });

        Ok(Arc::new(Self {
            tx,
            seq: Mutex::new(0),
        }))
    }

    /// Append one record. Sequence assignment and enqueue happen inside the
    /// same critical section; a full queue blocks the producer right here.
    pub async fn record(&self, record: AuditRecord) {
        let mut seq = self.seq.lock().await;
        *seq += 1;
        let event = AuditEvent {
            seq: *seq,
            timestamp: Utc::now(),
            actor: record.actor,
            action: record.action,
            target: record.target,
            fingerprint: record.fingerprint,
            outcome: record.outcome,
            detail: record.detail,
        };
        if self.tx.send(WriterMessage::Event(event)).await.is_err() {
            tracing::error!("audit writer task is gone; event lost");
        }
    }

    /// Wait until every previously recorded event reached the file.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(WriterMessage::Flush(ack)).await.is_ok() {
            let _ = done.await;
        }
    }

    /// Explicit rotate: trim to the retention budget. The only trimming
    /// permitted after startup.
    pub async fn rotate(&self) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(WriterMessage::Rotate(ack))
            .await
            .map_err(|_| Error::Audit("audit writer task is gone".into()))?;
        done.await
            .map_err(|_| Error::Audit("rotate ack dropped".into()))?
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// File maintenance (startup / rotate only)
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Drop a trailing partial line left by an interrupted write.
fn recover_partial_line(path: &Path) -> Result<()> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(());
    }
    let keep = bytes.iter().rposition(|&b| b == b'\n').map_or(0, |i| i + 1);
    tracing::warn!(
        path = %path.display(),
        dropped = bytes.len() - keep,
        "audit log had a partial trailing line; truncating"
    );
    let file = std::fs::OpenOptions::new().write(true).open(path)?;
    file.set_len(keep as u64)?;
    Ok(())
}

/// Oldest-first trim to the byte budget, via temp-file rewrite + rename.
fn trim_to_budget(path: &Path, retention_bytes: u64) -> Result<()> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    };
    if bytes.len() as u64 <= retention_bytes {
        return Ok(());
    }

    let mut start = 0usize;
    while (bytes.len() - start) as u64 > retention_bytes {
        match bytes[start..].iter().position(|&b| b == b'\n') {
            Some(i) => start += i + 1,
            None => {
                start = bytes.len();
                break;
            }
        }
    }

    let tmp = path.with_extension("jsonl.tmp");
    std::fs::write(&tmp, &bytes[start..])?;
    std::fs::rename(&tmp, path)?;
    tracing::info!(
        path = %path.display(),
        dropped_bytes = start,
        "audit log trimmed to retention budget"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn read_events(path: &Path) -> Vec<AuditEvent> {
        std::fs::read_to_string(path)
            .unwrap_or_default()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn concurrent_records_are_gap_free_and_ordered() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        let log = AuditLog::open(&path, 1024 * 1024).unwrap();

        let mut handles = Vec::new();
        for i in 0..100 {
            let log = log.clone();
            handles.push(tokio::spawn(async move {
                log.record(AuditRecord::new(
                    AuditAction::ListFiles,
                    format!("node-{}", i % 3),
                    AuditOutcome::ok("listed"),
                ))
                .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        log.flush().await;

        let events = read_events(&path);
        assert_eq!(events.len(), 100);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.seq, (i + 1) as u64);
        }
        for pair in events.windows(2) {
            assert!(pair[0].timestamp <= pair[1].timestamp);
        }
    }

    #[tokio::test]
    async fn partial_trailing_line_is_dropped_on_open() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        std::fs::write(
            &path,
            "{\"seq\":1,\"timestamp\":\"2026-01-01T00:00:00Z\",\"actor\":\"system\",\"action\":\"list_files\",\"target\":\"a\",\"fingerprint\":\"\",\"outcome\":{\"success\":true,\"message\":\"\"}}\n{\"seq\":2,\"trunca",
        )
        .unwrap();

        let log = AuditLog::open(&path, 1024 * 1024).unwrap();
        log.record(AuditRecord::new(
            AuditAction::ReadFile,
            "a",
            AuditOutcome::ok("read"),
        ))
        .await;
        log.flush().await;

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(!content.contains("trunca"));
    }

    #[tokio::test]
    async fn rotate_trims_oldest_first() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("audit.jsonl");
        // A tiny budget so rotation must drop the oldest lines.
        let log = AuditLog::open(&path, 600).unwrap();

        for _ in 0..20 {
            log.record(AuditRecord::new(
                AuditAction::ExecuteCommand,
                "*",
                AuditOutcome::ok("ran"),
            ))
            .await;
        }
        log.flush().await;
        assert!(std::fs::metadata(&path).unwrap().len() > 600);

        log.rotate().await.unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() <= 600);

        // The survivors are the newest events, still in order.
        let events = read_events(&path);
        assert!(!events.is_empty());
        assert_eq!(events.last().unwrap().seq, 20);
        for pair in events.windows(2) {
            assert_eq!(pair[1].seq, pair[0].seq + 1);
        }

        // Appends continue after rotation.
        log.record(AuditRecord::new(
            AuditAction::SyncPath,
            "*",
            AuditOutcome::ok("synced"),
        ))
        .await;
        log.flush().await;
        assert_eq!(read_events(&path).last().unwrap().seq, 21);
    }

    #[test]
    fn fingerprint_is_stable_across_key_order() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"argv":["echo","hi"],"parallelism":2}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"parallelism":2,"argv":["echo","hi"]}"#).unwrap();
        assert_eq!(fingerprint(&a), fingerprint(&b));
    }
}
