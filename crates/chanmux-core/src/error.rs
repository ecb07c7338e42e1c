//! Domain-specific error types following panic-free policy.

use thiserror::Error;

/// Errors that can occur in domain operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Peer identity frame was empty or whitespace
    #[error("Peer id must not be empty")]
    EmptyPeerId,

    /// Topic name was empty or whitespace
    #[error("Topic must not be empty")]
    EmptyTopic,
}

/// Result type for domain operations.
pub type DomainResult<T> = Result<T, DomainError>;
