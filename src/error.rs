//! Error kinds shared across the orchestration core.
//!
//! The system classifies failures by *kind*, not by type: retry predicates,
//! circuit-breaker filters, rollback triggers, and the HTTP layer all branch
//! on [`ErrorKind`] rather than downcasting.

use std::collections::HashSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Failure classification used by resilience policies and the API layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Request failed admission validation.
    Validation,
    /// Referenced entity does not exist.
    NotFound,
    /// No node in the inventory can satisfy an allocation request.
    NoSuitableNode,
    /// Bulkhead at capacity (in flight and queued).
    BulkheadFull,
    /// Circuit breaker is open.
    CircuitOpen,
    /// Operation exceeded its deadline.
    Timeout,
    /// Cooperative cancellation was observed.
    Cancelled,
    /// Upstream failure that is worth retrying (network, service unavailable).
    TransientExternal,
    /// Upstream failure that retrying will not fix.
    FatalExternal,
    /// Bug or invariant violation inside this process.
    Internal,
}

impl ErrorKind {
    /// Stable wire name, matching the serde representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not_found",
            ErrorKind::NoSuitableNode => "no_suitable_node",
            ErrorKind::BulkheadFull => "bulkhead_full",
            ErrorKind::CircuitOpen => "circuit_open",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::TransientExternal => "transient_external",
            ErrorKind::FatalExternal => "fatal_external",
            ErrorKind::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Unified error for the orchestration core.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    #[error("validation failed: {}", violations.join("; "))]
    Validation { violations: Vec<String> },

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("no suitable node: {reason}")]
    NoSuitableNode { reason: String },

    #[error("bulkhead '{name}' rejected call ({in_flight} in flight, {queued} queued)")]
    BulkheadFull { name: String, in_flight: usize, queued: usize },

    #[error("circuit breaker '{name}' is open ({failure_count} failures, retry in {retry_after:?})")]
    CircuitOpen { name: String, failure_count: usize, retry_after: Duration },

    #[error("{operation} timed out after {elapsed:?} (limit {limit:?})")]
    Timeout { operation: String, elapsed: Duration, limit: Duration },

    #[error("operation cancelled")]
    Cancelled,

    #[error("transient upstream failure: {0}")]
    TransientExternal(String),

    #[error("fatal upstream failure: {0}")]
    FatalExternal(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(violation: impl Into<String>) -> Self {
        Error::Validation { violations: vec![violation.into()] }
    }

    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound { entity, id: id.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Error::Internal(message.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Validation { .. } => ErrorKind::Validation,
            Error::NotFound { .. } => ErrorKind::NotFound,
            Error::NoSuitableNode { .. } => ErrorKind::NoSuitableNode,
            Error::BulkheadFull { .. } => ErrorKind::BulkheadFull,
            Error::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Error::Timeout { .. } => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::TransientExternal(_) => ErrorKind::TransientExternal,
            Error::FatalExternal(_) => ErrorKind::FatalExternal,
            Error::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether a caller could plausibly succeed by submitting the same
    /// request again later.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::NoSuitableNode
                | ErrorKind::Timeout
                | ErrorKind::TransientExternal
                | ErrorKind::BulkheadFull
                | ErrorKind::CircuitOpen
        )
    }

    /// Hint surfaced alongside 5xx responses.
    pub fn suggested_action(&self) -> &'static str {
        match self.kind() {
            ErrorKind::Validation => "fix the request and resubmit",
            ErrorKind::NotFound => "check the identifier",
            ErrorKind::NoSuitableNode => "retry once capacity frees up",
            ErrorKind::BulkheadFull => "retry with backoff",
            ErrorKind::CircuitOpen => "retry after the recovery window",
            ErrorKind::Timeout => "retry, or reduce job complexity",
            ErrorKind::Cancelled => "resubmit the job if cancellation was unintended",
            ErrorKind::TransientExternal => "retry with backoff",
            ErrorKind::FatalExternal => "contact support",
            ErrorKind::Internal => "contact support",
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }

    pub fn is_bulkhead(&self) -> bool {
        matches!(self, Error::BulkheadFull { .. })
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}

/// Set of kinds a retry policy considers worth another attempt.
#[derive(Debug, Clone)]
pub struct RetryableKinds(Option<HashSet<ErrorKind>>);

impl RetryableKinds {
    /// Retry any error.
    pub fn any() -> Self {
        RetryableKinds(None)
    }

    pub fn of(kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        RetryableKinds(Some(kinds.into_iter().collect()))
    }

    pub fn matches(&self, error: &Error) -> bool {
        // Cancellation is never retried: the caller asked us to stop.
        if error.is_cancelled() {
            return false;
        }
        match &self.0 {
            None => true,
            Some(kinds) => kinds.contains(&error.kind()),
        }
    }
}

impl Default for RetryableKinds {
    fn default() -> Self {
        RetryableKinds::any()
    }
}
