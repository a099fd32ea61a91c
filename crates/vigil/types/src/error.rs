//! Error types for vigil-types.

use thiserror::Error;

/// Errors raised while parsing or validating core types.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TypesError {
    /// Condition ID is not a UUID.
    #[error("invalid condition id: {0}")]
    InvalidConditionId(String),

    /// Topic string is not of the form `kind/subject`.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Topic kind is not recognised.
    #[error("unknown topic kind: {0}")]
    UnknownTopicKind(String),
}
