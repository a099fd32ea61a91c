//! Error types for vigil-monitor crate.
//!
//! Failures are always local to one user, stream or condition; none of
//! these variants halt the scheduler.

use thiserror::Error;
use vigil_types::{ConditionId, ConditionState, StreamKey, TopicKey, TypesError, Unit};

/// Errors that can occur in the monitoring core.
#[derive(Debug, Error)]
pub enum MonitorError {
    /// Collaborator call exceeded its bounded timeout.
    #[error("collaborator {collaborator} timed out after {timeout_ms}ms")]
    CollaboratorTimeout {
        collaborator: &'static str,
        timeout_ms: u64,
    },

    /// Collaborator returned an error (rate limit, transport, bad response).
    #[error("collaborator {collaborator} failed: {reason}")]
    CollaboratorFailed {
        collaborator: &'static str,
        reason: String,
    },

    /// Circuit breaker for the collaborator is open.
    #[error("circuit breaker open for collaborator {0}")]
    CircuitOpen(&'static str),

    /// Condition payload has the wrong shape for its tier.
    #[error("invalid condition payload: {0}")]
    InvalidPayload(String),

    /// A threshold or sample is not in the topic's native unit.
    #[error("unit mismatch on {topic}: expected {expected:?}, found {found:?}")]
    UnitMismatch {
        topic: TopicKey,
        expected: Unit,
        found: Unit,
    },

    /// Signal condition references more streams than allowed.
    #[error("signal condition references {count} streams, limit is {max}")]
    TooManySignalStreams { count: usize, max: usize },

    /// Data source could not produce a sample for a stream.
    #[error("source unavailable for {topic}: {reason}")]
    SourceUnavailable { topic: TopicKey, reason: String },

    /// Stream has never been referenced.
    #[error("stream not found: {0}")]
    StreamNotFound(StreamKey),

    /// Condition not found.
    #[error("condition not found: {0}")]
    ConditionNotFound(ConditionId),

    /// Operation is not valid in the condition's current state.
    #[error("cannot {operation} condition {condition_id} in state {state}")]
    InvalidTransition {
        condition_id: ConditionId,
        state: ConditionState,
        operation: &'static str,
    },

    /// Internal invariant violated (e.g. a double fire was detected).
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Type-level parse error.
    #[error(transparent)]
    Types(#[from] TypesError),
}

impl MonitorError {
    /// Transient failures that the next evaluation or polling cycle retries.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MonitorError::CollaboratorTimeout { .. }
                | MonitorError::CollaboratorFailed { .. }
                | MonitorError::CircuitOpen(_)
                | MonitorError::SourceUnavailable { .. }
        )
    }

    /// Failures caused by the caller's input, rejected synchronously.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            MonitorError::InvalidPayload(_)
                | MonitorError::UnitMismatch { .. }
                | MonitorError::TooManySignalStreams { .. }
                | MonitorError::Types(_)
        )
    }
}

/// Result type for monitoring operations.
pub type MonitorResult<T> = Result<T, MonitorError>;
