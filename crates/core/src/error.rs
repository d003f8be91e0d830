//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// A command was refused by an aggregate.
///
/// Only deterministic decisions end up here; retrying the same command
/// against the same state gives the same error. Storage and HTTP failures
/// live in the outbox crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Malformed command input (blank lot number, zero quantity, ...).
    #[error("validation failed: {0}")]
    Validation(String),

    /// The command does not fit the aggregate's lifecycle, e.g. closing a
    /// closed batch.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The command targets an aggregate that was never created.
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::InvariantViolation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found(aggregate: &'static str) -> Self {
        Self::NotFound(aggregate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_names_the_aggregate() {
        let err = DomainError::not_found("batch");
        assert_eq!(err.to_string(), "batch not found");
    }
}
