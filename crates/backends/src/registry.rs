//! Backend construction and the process-wide active-backend slot.

use std::sync::Arc;
use std::time::Duration;

use nacc_domain::config::{BackendConfig, BackendKind};
use nacc_domain::{Error, Result};
use parking_lot::Mutex;

use crate::heuristic::HeuristicBackend;
use crate::http::HttpBackend;
use crate::subprocess::SubprocessBackend;
use crate::traits::CompletionBackend;

/// Deadline for the validation probe during a backend switch.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Construct a backend from its configuration.
pub fn build_backend(config: &BackendConfig) -> Result<Arc<dyn CompletionBackend>> {
    let timeout = Duration::from_secs(config.timeout_seconds);
    let backend: Arc<dyn CompletionBackend> = match config.kind {
        BackendKind::Heuristic => Arc::new(HeuristicBackend::new(timeout)),
        BackendKind::Http => Arc::new(HttpBackend::from_config(config)?),
        BackendKind::Subprocess => Arc::new(SubprocessBackend::from_config(config)?),
    };
    Ok(backend)
}

struct ActiveSlot {
    config: BackendConfig,
    backend: Arc<dyn CompletionBackend>,
}

/// The single process-wide active backend.
///
/// Readers take a snapshot (an `Arc` clone) and release the lock before
/// calling, so in-flight completions keep the backend they started with
/// across a concurrent switch.
pub struct ActiveBackend {
    slot: Mutex<ActiveSlot>,
}

impl ActiveBackend {
    pub fn from_config(config: &BackendConfig) -> Result<Self> {
        let backend = build_backend(config)?;
        Ok(Self {
            slot: Mutex::new(ActiveSlot {
                config: config.clone(),
                backend,
            }),
        })
    }

    /// The backend to use for one call. Clone-and-release; never hold this
    /// across an await while the lock is taken.
    pub fn snapshot(&self) -> Arc<dyn CompletionBackend> {
        self.slot.lock().backend.clone()
    }

    pub fn current_kind(&self) -> BackendKind {
        self.slot.lock().config.kind
    }

    pub fn current_config(&self) -> BackendConfig {
        self.slot.lock().config.clone()
    }

    /// Atomically replace the active backend.
    ///
    /// The replacement is constructed and probed (with [`PROBE_TIMEOUT`])
    /// before the slot changes; any failure leaves the current backend
    /// untouched.
    pub async fn switch(&self, config: BackendConfig) -> Result<BackendKind> {
        let candidate = build_backend(&config)?;

        match tokio::time::timeout(PROBE_TIMEOUT, candidate.probe()).await {
            Err(_) => {
                return Err(Error::Timeout(format!(
                    "backend probe exceeded {PROBE_TIMEOUT:?}"
                )))
            }
            Ok(Err(e)) => return Err(Error::Backend(format!("probe failed: {e}"))),
            Ok(Ok(())) => {}
        }

        let kind = config.kind;
        *self.slot.lock() = ActiveSlot {
            config,
            backend: candidate,
        };
        tracing::info!(kind = %kind, "active backend switched");
        Ok(kind)
    }
}
