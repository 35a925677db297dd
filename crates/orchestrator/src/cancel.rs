//! Per-request cancellation tokens.
//!
//! Every top-level handler creates a token and threads it through the
//! planner and transports; there is no global cancel and no implicit
//! context lookup. HTTP transports abort the in-flight request on cancel,
//! in-process transports check cooperatively at I/O boundaries.

use tokio_util::sync::CancellationToken;

/// A cancellation handle that can be both polled and awaited.
#[derive(Clone, Default)]
pub struct CancelToken {
    inner: CancellationToken,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            inner: CancellationToken::new(),
        }
    }

    /// Signal cancellation. Children created with [`Self::child`] are
    /// cancelled too.
    pub fn cancel(&self) {
        self.inner.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.is_cancelled()
    }

    /// Completes when the token is cancelled.
    pub async fn cancelled(&self) {
        self.inner.cancelled().await;
    }

    /// A child token: cancelled with the parent, cancellable on its own
    /// without affecting the parent (used for the whole-plan ceiling).
    pub fn child(&self) -> Self {
        Self {
            inner: self.inner.child_token(),
        }
    }
}
