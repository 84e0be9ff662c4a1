//! # Errors
//!
//! Centralized error handling for threadboard.
//! Maps domain-specific failures to actionable error types.

use thiserror::Error;

/// Failures reported by a [`crate::ports::KvStore`] implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem failure underneath a persistent backend
    #[error("store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored value could not be encoded or decoded
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The backend did not answer within the configured bound
    #[error("store unavailable: {op} on {key:?} exceeded {timeout_ms}ms")]
    Unavailable {
        op: &'static str,
        key: Option<String>,
        timeout_ms: u64,
    },

    /// Any other backend failure (e.g. a database driver error)
    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable { .. })
    }
}

/// The primary error type for content operations.
#[derive(Error, Debug)]
pub enum DomainError {
    /// Bad user input; the request is rejected with the reason.
    #[error("invalid content ({0}). Discarding.")]
    Validation(String),

    #[error("no such board: {0}")]
    UnknownBoard(String),

    /// Resource not found (e.g. thread, post)
    #[error("no such {0}: {1}")]
    NotFound(&'static str, u64),

    /// Signature did not match a moderator or the target thread
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// Persistence failure
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A post was persisted but its parent thread could not be updated.
    #[error("post {post_id} was stored but not linked to thread {thread_id}: {source}")]
    OrphanedLink {
        post_id: u64,
        thread_id: u64,
        #[source]
        source: StoreError,
    },
}

impl DomainError {
    pub fn thread_not_found(id: u64) -> Self {
        DomainError::NotFound("thread", id)
    }

    pub fn post_not_found(id: u64) -> Self {
        DomainError::NotFound("post", id)
    }

    /// Errors caused by the submitter rather than the system.
    pub fn is_user_error(&self) -> bool {
        matches!(
            self,
            DomainError::Validation(_)
                | DomainError::UnknownBoard(_)
                | DomainError::NotFound(..)
                | DomainError::Unauthorized(_)
        )
    }
}

/// A specialized Result type for content operations.
pub type Result<T> = std::result::Result<T, DomainError>;
