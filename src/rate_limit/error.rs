//! Gate Error Types
//!
//! Errors surfaced by the gate itself. Running out of quota is not one of
//! them: exhausted quota only ever shows up as added latency.

/// Outcome of a gated call that did not succeed
///
/// `E` is the protected operation's own error type. The gate wraps it
/// without inspecting or transforming it.
#[derive(Debug, thiserror::Error)]
pub enum GateError<E> {
    /// The protected operation ran and failed
    #[error("upstream operation failed: {0}")]
    Upstream(E),

    /// The request was not admitted before its deadline
    #[error("request '{label}' was not admitted within {waited_ms}ms")]
    DeadlineExceeded { label: String, waited_ms: u64 },

    /// The request never produced a result (gate shut down or the operation panicked)
    #[error("request '{label}' was dropped before completing")]
    Dropped { label: String },
}

impl<E> GateError<E> {
    /// Returns the operation's own error, if that is what this is
    pub fn into_upstream(self) -> Option<E> {
        match self {
            GateError::Upstream(err) => Some(err),
            _ => None,
        }
    }

    /// Whether the protected operation actually ran
    pub fn is_upstream(&self) -> bool {
        matches!(self, GateError::Upstream(_))
    }
}

/// Invalid gate configuration, reported at construction time
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("at least one quota must be configured")]
    NoQuotas,

    #[error("quota '{0}' must have a capacity greater than 0")]
    ZeroCapacity(String),

    #[error("quota '{0}' must have a window longer than 0ms")]
    ZeroWindow(String),

    #[error("quota name must not be empty")]
    EmptyName,

    #[error("quota '{0}' is configured more than once")]
    DuplicateQuota(String),

    #[error("invalid backoff: {0}")]
    InvalidBackoff(&'static str),
}
