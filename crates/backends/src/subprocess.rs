//! Subprocess completion backend — a local model without a network hop.
//!
//! A bounded pool of long-lived worker processes speaks line-delimited JSON:
//! one `{"id","prompt","context"}` request per line on stdin, one
//! `{"id","completion"}` reply per line on stdout. Each call carries a
//! correlation id. A worker that misses the deadline is killed and its slot
//! refilled on the next acquisition; the pool never hands out a worker that
//! has already failed.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use nacc_domain::config::{BackendConfig, BackendKind};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{Mutex, Semaphore};

use crate::traits::{BackendContext, BackendError, CompletionBackend};

// Field order matters for simple line-oriented workers: `id` serializes
// first, so a worker can extract it without a full JSON parser.
#[derive(Serialize)]
struct WorkerRequest<'a> {
    id: &'a str,
    prompt: &'a str,
    context: &'a BackendContext,
}

#[derive(Deserialize)]
struct WorkerReply {
    id: String,
    #[serde(default)]
    completion: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

struct Worker {
    child: Child,
    stdin: ChildStdin,
    stdout: Lines<BufReader<ChildStdout>>,
}

impl Worker {
    fn kill(mut self) {
        let _ = self.child.start_kill();
    }
}

pub struct SubprocessBackend {
    command: Vec<String>,
    environment: HashMap<String, String>,
    timeout: Duration,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Worker>>,
}

impl SubprocessBackend {
    pub fn from_config(config: &BackendConfig) -> nacc_domain::Result<Self> {
        if config.command.is_empty() {
            return Err(nacc_domain::Error::Config(
                "subprocess backend requires a command".into(),
            ));
        }
        Ok(Self {
            command: config.command.clone(),
            environment: config.environment.clone(),
            timeout: Duration::from_secs(config.timeout_seconds),
            permits: Arc::new(Semaphore::new(config.pool_size.max(1))),
            idle: Mutex::new(Vec::new()),
        })
    }

    fn spawn_worker(&self) -> Result<Worker, BackendError> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .envs(&self.environment)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| BackendError::Unavailable(format!("failed to spawn worker: {e}")))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| BackendError::Unavailable("worker stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Unavailable("worker stdout unavailable".into()))?;

        tracing::debug!(command = %self.command[0], "spawned backend worker");
        Ok(Worker {
            child,
            stdin,
            stdout: BufReader::new(stdout).lines(),
        })
    }

    async fn acquire_worker(&self) -> Result<Worker, BackendError> {
        match self.idle.lock().await.pop() {
            Some(worker) => Ok(worker),
            None => self.spawn_worker(),
        }
    }

    /// One request/reply exchange on a single worker.
    async fn exchange(
        worker: &mut Worker,
        id: &str,
        line: &str,
    ) -> Result<String, BackendError> {
        worker
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| BackendError::Unavailable(format!("worker stdin write failed: {e}")))?;
        worker
            .stdin
            .flush()
            .await
            .map_err(|e| BackendError::Unavailable(format!("worker stdin flush failed: {e}")))?;

        loop {
            let reply_line = worker
                .stdout
                .next_line()
                .await
                .map_err(|e| BackendError::Unavailable(format!("worker read failed: {e}")))?
                .ok_or_else(|| BackendError::Unavailable("worker closed stdout".into()))?;

            let reply: WorkerReply = serde_json::from_str(&reply_line).map_err(|e| {
                BackendError::Malformed(format!("unparseable worker reply: {e}"))
            })?;
            if reply.id != id {
                // A stale line from a previous exchange on this worker.
                continue;
            }
            if let Some(error) = reply.error {
                return Err(BackendError::Malformed(format!("worker error: {error}")));
            }
            return reply
                .completion
                .ok_or_else(|| BackendError::Malformed("reply carries no completion".into()));
        }
    }
}

#[async_trait::async_trait]
impl CompletionBackend for SubprocessBackend {
    async fn complete(
        &self,
        prompt: &str,
        context: &BackendContext,
    ) -> Result<String, BackendError> {
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| BackendError::Unavailable("worker pool closed".into()))?;

        let mut worker = self.acquire_worker().await?;
        let id = uuid::Uuid::new_v4().to_string();
        let mut line = serde_json::to_string(&WorkerRequest {
            id: &id,
            prompt,
            context,
        })
        .map_err(|e| BackendError::Malformed(format!("request serialization failed: {e}")))?;
        line.push('\n');

        match tokio::time::timeout(self.timeout, Self::exchange(&mut worker, &id, &line)).await {
            Ok(Ok(completion)) => {
                self.idle.lock().await.push(worker);
                Ok(completion)
            }
            Ok(Err(e)) => {
                // The worker is in an unknown state; replace it.
                worker.kill();
                Err(e)
            }
            Err(_) => {
                worker.kill();
                Err(BackendError::Timeout(format!(
                    "worker gave no reply within {:?}",
                    self.timeout
                )))
            }
        }
    }

    async fn probe(&self) -> Result<(), BackendError> {
        self.complete("ping", &BackendContext::new()).await.map(|_| ())
    }

    fn kind(&self) -> BackendKind {
        BackendKind::Subprocess
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(command: &[&str], timeout_seconds: u64) -> BackendConfig {
        BackendConfig {
            kind: BackendKind::Subprocess,
            timeout_seconds,
            command: command.iter().map(|s| s.to_string()).collect(),
            ..BackendConfig::default()
        }
    }

    /// A worker that answers every request with `{"id":...,"completion":"pong"}`,
    /// extracting the id with sed (no JSON tooling required).
    fn echo_worker() -> BackendConfig {
        config(
            &[
                "sh",
                "-c",
                r#"while IFS= read -r line; do printf '%s\n' "$line" | sed -n 's/.*"id":"\([^"]*\)".*/{"id":"\1","completion":"pong"}/p'; done"#,
            ],
            5,
        )
    }

    #[tokio::test]
    async fn worker_roundtrip_with_correlation_id() {
        let backend = SubprocessBackend::from_config(&echo_worker()).unwrap();
        let completion = backend
            .complete("hello", &BackendContext::new())
            .await
            .unwrap();
        assert_eq!(completion, "pong");

        // The worker is reused across calls.
        let completion = backend
            .complete("again", &BackendContext::new())
            .await
            .unwrap();
        assert_eq!(completion, "pong");
        assert_eq!(backend.idle.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn silent_worker_times_out_and_is_replaced() {
        // `sleep` ignores stdin and never replies.
        let backend = SubprocessBackend::from_config(&config(&["sleep", "100"], 1)).unwrap();
        let err = backend
            .complete("anyone there?", &BackendContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Timeout(_)));
        // The dead worker was not returned to the pool.
        assert!(backend.idle.lock().await.is_empty());
    }

    #[tokio::test]
    async fn garbage_reply_is_malformed() {
        // `cat` echoes the request back: right id, no completion field.
        let backend = SubprocessBackend::from_config(&config(&["cat"], 5)).unwrap();
        let err = backend
            .complete("mirror", &BackendContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Malformed(_)));
    }

    #[tokio::test]
    async fn missing_binary_is_unavailable() {
        let backend =
            SubprocessBackend::from_config(&config(&["definitely-not-a-real-binary"], 5)).unwrap();
        let err = backend
            .complete("hi", &BackendContext::new())
            .await
            .unwrap_err();
        assert!(matches!(err, BackendError::Unavailable(_)));
    }
}
