//! Error types for dxstor
//!
//! A single error enum shared across the workspace. Variants are grouped by
//! kind: validation errors surface to the caller unchanged, transient errors
//! are retried or downgraded locally, persistent errors mark state (host
//! removed, segment stuck), and `Shutdown` is the cooperative cancellation
//! sentinel observed at every suspension point.

use thiserror::Error;

/// Result type alias for dxstor operations
pub type Result<T> = std::result::Result<T, DxError>;

/// Unified error type for dxstor
#[derive(Error, Debug)]
pub enum DxError {
    // ===== Config / validation =====
    #[error("validation error: {0}")]
    Validation(String),

    #[error("unknown path: {0}")]
    UnknownPath(String),

    #[error("path already exists: {0}")]
    PathOverload(String),

    #[error("cannot upload a directory")]
    UploadDirectory,

    // ===== Erasure coding =====
    #[error("erasure coding error: {0}")]
    ErasureCoding(String),

    #[error("insufficient sectors: have {available}, need {required}")]
    InsufficientSectors { available: usize, required: usize },

    #[error("unknown erasure code type: {0}")]
    UnknownErasureCode(u8),

    // ===== Cryptography =====
    #[error("encryption error: {0}")]
    Encryption(String),

    #[error("decryption error: {0}")]
    Decryption(String),

    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("merkle proof verification failed")]
    ProofVerificationFailed,

    // ===== Transient =====
    #[error("network error: {0}")]
    Network(String),

    #[error("memory manager stopped while waiting for {0} bytes")]
    MemoryUnavailable(u64),

    // ===== Persistent =====
    #[error("host unavailable: {0}")]
    HostUnavailable(String),

    #[error("segment marked stuck: repair threshold not reached")]
    SegmentStuck,

    // ===== Fatal core =====
    #[error("invariant violation: {0}")]
    Invariant(String),

    // ===== I/O and serialization =====
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt persisted data: {0}")]
    Corrupt(String),

    // ===== Shutdown =====
    #[error("operation cancelled by shutdown")]
    Shutdown,
}

impl DxError {
    /// Whether the error is the cooperative cancellation sentinel.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, DxError::Shutdown)
    }

    /// Whether retrying the same operation can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DxError::Network(_) | DxError::MemoryUnavailable(_)
        )
    }
}

impl From<reed_solomon_erasure::Error> for DxError {
    fn from(err: reed_solomon_erasure::Error) -> Self {
        DxError::ErasureCoding(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DxError::InsufficientSectors {
            available: 8,
            required: 10,
        };
        assert_eq!(err.to_string(), "insufficient sectors: have 8, need 10");
    }

    #[test]
    fn test_error_kinds() {
        assert!(DxError::Shutdown.is_shutdown());
        assert!(DxError::Network("reset".into()).is_transient());
        assert!(!DxError::SegmentStuck.is_transient());
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: DxError = io_err.into();
        assert!(matches!(err, DxError::Io(_)));
    }
}
