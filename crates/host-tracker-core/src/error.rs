//! Error types for the host tracker core

use thiserror::Error;

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;

/// Core error types
#[derive(Debug, Error)]
pub enum Error {
    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] postcard::Error),

    /// Hash mismatch (computed != stored)
    #[error("hash mismatch: computed {computed} != stored {stored}")]
    HashMismatch { computed: String, stored: String },

    /// Invalid signature
    #[error("invalid signature")]
    InvalidSignature,

    /// Invalid public key
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Repeated field ordering violation
    #[error("repeated field not sorted/deduped: {field}")]
    UnsortedRepeatedField { field: String },
}
