//! Completion-backend abstraction.
//!
//! A backend turns a prompt plus a flat context map into an opaque completion
//! string. Three variants exist: the deterministic heuristic (pure function,
//! also the universal fallback), an HTTP-remote inference service, and a
//! local subprocess worker pool. The orchestrator holds exactly one active
//! backend behind [`registry::ActiveBackend`] and swaps it atomically.

pub mod heuristic;
pub mod http;
pub mod registry;
pub mod subprocess;
pub mod traits;

pub use registry::{build_backend, ActiveBackend};
pub use traits::{BackendContext, BackendError, CompletionBackend, ContextValue};
