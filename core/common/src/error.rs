//! Common error types for Capsule.

use thiserror::Error;

/// Top-level error type for Capsule operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A required key is absent from a serialized record.
    #[error("Missing key '{key}' in {shape}")]
    MissingKey { key: String, shape: String },

    /// A key is present but holds a value of the wrong type.
    #[error("Invalid data for key '{key}' in {shape}: expected {expected}, found {actual}")]
    InvalidData {
        key: String,
        shape: String,
        expected: String,
        actual: String,
    },

    /// A section marker could not be located in the container.
    #[error("Marker not found: {0}")]
    MarkerNotFound(String),

    /// The same identifier appears more than once in a namespace.
    #[error("Identifier collision, duplicate ids: {0:?}")]
    IdCollision(Vec<u64>),

    /// Stored checksum does not match the recomputed one.
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Structural inconsistency inside the container.
    #[error("Integrity error: {0}")]
    Integrity(String),

    /// Encryption failed unexpectedly.
    #[error("Encryption failed: {0}")]
    EncryptionFailure(String),

    /// Decryption failed (wrong password or malformed blob).
    #[error("Decryption failed: {0}")]
    DecryptionFailure(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Container length differs from what a write should have produced.
    #[error("Size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// A multi-step write failed and the container was trimmed back.
    #[error("{cause}; rollback: {rollback}")]
    RolledBack {
        #[source]
        cause: Box<Error>,
        rollback: String,
    },

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation observed a cancellation request.
    #[error("Operation cancelled")]
    Cancelled,
}

impl Error {
    /// Wrap `cause` together with the outcome of undoing its partial effects.
    pub fn rolled_back(cause: Error, rollback: impl Into<String>) -> Self {
        Error::RolledBack {
            cause: Box::new(cause),
            rollback: rollback.into(),
        }
    }

    /// Whether the caller can reasonably retry with different input.
    ///
    /// Only a failed decryption qualifies: it usually means a wrong password.
    /// A rolled-back error is classified by its cause.
    pub fn is_recoverable(&self) -> bool {
        match self {
            Error::RolledBack { cause, .. } => cause.is_recoverable(),
            other => matches!(other, Error::DecryptionFailure(_)),
        }
    }

    /// Whether this error means the container itself is unusable.
    pub fn is_container_fatal(&self) -> bool {
        if let Error::RolledBack { cause, .. } = self {
            return cause.is_container_fatal();
        }
        matches!(
            self,
            Error::MissingKey { .. }
                | Error::InvalidData { .. }
                | Error::MarkerNotFound(_)
                | Error::IdCollision(_)
                | Error::Integrity(_)
        )
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;
