//! Node-side tool implementations.
//!
//! Every tool takes an explicit [`RootContext`] — the node's canonicalized
//! root directory, command allow-list, and sync-target map, built once at
//! startup. All filesystem and process effects are confined to that root;
//! paths resolving outside it fail with `PathEscape` before any I/O happens.

pub mod exec;
pub mod fs;
pub mod info;
pub mod root;
pub mod sync;

pub use root::RootContext;
