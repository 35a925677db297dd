use std::collections::BTreeMap;
use std::time::Duration;

use nacc_domain::config::BackendKind;
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context map
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A scalar value in the backend context map. The context is deliberately
/// flat — structured data travels as a JSON string under one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ContextValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl ContextValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            ContextValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            ContextValue::Int(i) => Some(*i),
            _ => None,
        }
    }
}

impl From<&str> for ContextValue {
    fn from(s: &str) -> Self {
        ContextValue::Str(s.to_owned())
    }
}

impl From<String> for ContextValue {
    fn from(s: String) -> Self {
        ContextValue::Str(s)
    }
}

impl From<i64> for ContextValue {
    fn from(i: i64) -> Self {
        ContextValue::Int(i)
    }
}

impl From<bool> for ContextValue {
    fn from(b: bool) -> Self {
        ContextValue::Bool(b)
    }
}

/// Ordered so the same logical context always serializes identically.
pub type BackendContext = BTreeMap<String, ContextValue>;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Errors
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Failure modes the orchestrator distinguishes. Any of them sends the
/// current planner stage to the heuristic fallback; none is retried.
#[derive(thiserror::Error, Debug)]
pub enum BackendError {
    #[error("backend timeout: {0}")]
    Timeout(String),

    #[error("backend unavailable: {0}")]
    Unavailable(String),

    #[error("backend rate-limited: {0}")]
    RateLimited(String),

    #[error("backend response malformed: {0}")]
    Malformed(String),
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Core backend trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Trait every completion backend implements.
///
/// The returned string is opaque text; parsing it against the expected shape
/// is the caller's job. Implementations must honor [`Self::timeout`] by
/// returning within it or failing with [`BackendError::Timeout`].
#[async_trait::async_trait]
pub trait CompletionBackend: Send + Sync {
    /// Produce a completion for the prompt and context.
    async fn complete(
        &self,
        prompt: &str,
        context: &BackendContext,
    ) -> Result<String, BackendError>;

    /// Cheap validity check used by the backend-switch handshake.
    async fn probe(&self) -> Result<(), BackendError>;

    /// The configured variant discriminator.
    fn kind(&self) -> BackendKind;

    /// Declared per-call deadline.
    fn timeout(&self) -> Duration;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_value_untagged_serde() {
        let mut ctx = BackendContext::new();
        ctx.insert("stage".into(), "router".into());
        ctx.insert("parallelism".into(), ContextValue::Int(2));
        ctx.insert("fallback".into(), ContextValue::Bool(false));

        let json = serde_json::to_string(&ctx).unwrap();
        assert_eq!(
            json,
            r#"{"fallback":false,"parallelism":2,"stage":"router"}"#
        );

        let back: BackendContext = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ctx);
    }
}
