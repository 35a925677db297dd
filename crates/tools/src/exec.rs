//! ExecuteCommand tool — allow-listed, env-scrubbed, time-bounded.
//!
//! A command runs with an empty environment except the node's configured
//! PATH plus the caller's overlay. Exit codes are data: the tool only fails
//! before a process exists (allow-list, path confinement). On timeout the
//! child gets a terminate signal, then a kill after the grace period, and is
//! always reaped.

use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};

use nacc_protocol::{
    CommandResult, ExecuteCommandRequest, ToolError, ToolErrorKind, DEFAULT_TIMEOUT_SECONDS,
    EXIT_CODE_SENTINEL, KILL_GRACE_SECONDS, MAX_OUTPUT_BYTES, MAX_TIMEOUT_SECONDS,
    TRUNCATION_MARKER,
};

use crate::root::RootContext;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Bounded capture
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

/// Drain a stream to completion, keeping at most [`MAX_OUTPUT_BYTES`].
/// Draining continues past the cap so the child never blocks on a full pipe.
async fn capture_stream<R: tokio::io::AsyncRead + Unpin>(mut stream: R) -> Captured {
    let mut bytes = Vec::new();
    let mut truncated = false;
    let mut buf = [0u8; 8192];
    loop {
        match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if bytes.len() < MAX_OUTPUT_BYTES {
                    let keep = n.min(MAX_OUTPUT_BYTES - bytes.len());
                    bytes.extend_from_slice(&buf[..keep]);
                    if keep < n {
                        truncated = true;
                    }
                } else {
                    truncated = true;
                }
            }
        }
    }
    Captured { bytes, truncated }
}

fn render(captured: Captured) -> (String, bool) {
    let mut text = String::from_utf8_lossy(&captured.bytes).into_owned();
    if captured.truncated {
        text.push_str(TRUNCATION_MARKER);
    }
    (text, captured.truncated)
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Termination
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[cfg(unix)]
fn terminate(child: &Child) {
    if let Some(pid) = child.id() {
        let _ = nix::sys::signal::kill(
            nix::unistd::Pid::from_raw(pid as i32),
            nix::sys::signal::Signal::SIGTERM,
        );
    }
}

#[cfg(not(unix))]
fn terminate(_child: &Child) {
    // No graceful signal off unix; the kill below handles it.
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// ExecuteCommand
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run an allow-listed command confined to the node root.
pub async fn execute_command(
    ctx: &RootContext,
    req: ExecuteCommandRequest,
) -> Result<CommandResult, ToolError> {
    let program = req.argv.first().ok_or_else(|| {
        ToolError::new(ToolErrorKind::CommandNotAllowed, "argv must not be empty")
    })?;

    // Allow-list on the basename; a qualified path passes only when its
    // basename is listed.
    let basename = Path::new(program)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    if !ctx.is_command_allowed(&basename) {
        return Err(ToolError::new(
            ToolErrorKind::CommandNotAllowed,
            format!("'{basename}' is not in this node's allow-list"),
        ));
    }

    let cwd = match &req.cwd {
        Some(rel) => {
            let dir = ctx.resolve(rel)?;
            let meta = tokio::fs::metadata(&dir)
                .await
                .map_err(|e| crate::fs::io_error(&dir, e))?;
            if !meta.is_dir() {
                return Err(ToolError::new(
                    ToolErrorKind::FileNotFound,
                    format!("cwd '{rel}' is not a directory"),
                ));
            }
            dir
        }
        None => ctx.root().to_path_buf(),
    };

    let timeout = Duration::from_secs(
        req.timeout_seconds
            .unwrap_or(DEFAULT_TIMEOUT_SECONDS)
            .clamp(1, MAX_TIMEOUT_SECONDS),
    );

    let mut cmd = Command::new(program);
    cmd.args(&req.argv[1..])
        .current_dir(&cwd)
        .env_clear()
        .env("PATH", ctx.path_env())
        .envs(&req.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let started = Instant::now();
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            // The command was allowed but could not start; that is data for
            // the caller, not a node fault.
            return Ok(CommandResult::synthetic(
                ctx.node_id(),
                format!("failed to spawn '{program}': {e}"),
            ));
        }
    };

    let stdout_task = tokio::spawn(capture_stream(
        child.stdout.take().expect("stdout was piped"),
    ));
    let stderr_task = tokio::spawn(capture_stream(
        child.stderr.take().expect("stderr was piped"),
    ));

    let mut timed_out = false;
    let status = tokio::select! {
        status = child.wait() => status,
        _ = tokio::time::sleep(timeout) => {
            timed_out = true;
            terminate(&child);
            tokio::select! {
                status = child.wait() => status,
                _ = tokio::time::sleep(Duration::from_secs(KILL_GRACE_SECONDS)) => {
                    let _ = child.kill().await;
                    child.wait().await
                }
            }
        }
    };

    let (stdout, stdout_truncated) = render(stdout_task.await.unwrap_or(Captured {
        bytes: Vec::new(),
        truncated: false,
    }));
    let (stderr, stderr_truncated) = render(stderr_task.await.unwrap_or(Captured {
        bytes: Vec::new(),
        truncated: false,
    }));
    let duration_seconds = started.elapsed().as_secs_f64();

    let (exit_code, error) = match status {
        Ok(status) if timed_out => (
            EXIT_CODE_SENTINEL,
            Some(format!(
                "timeout: terminated after {}s (exit status {status})",
                timeout.as_secs()
            )),
        ),
        Ok(status) => (status.code().unwrap_or(EXIT_CODE_SENTINEL), None),
        Err(e) => (EXIT_CODE_SENTINEL, Some(format!("wait failed: {e}"))),
    };

    tracing::debug!(
        node_id = %ctx.node_id(),
        command = %basename,
        exit_code,
        timed_out,
        duration_seconds,
        "command finished"
    );

    Ok(CommandResult {
        node_id: ctx.node_id().to_string(),
        stdout,
        stderr,
        exit_code,
        duration_seconds,
        stdout_truncated,
        stderr_truncated,
        error,
    })
}
