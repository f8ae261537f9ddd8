//! Error types for LodeStore operations
//!
//! All engine layers report failures through the `StoreError` enum. Variants
//! carry enough context to diagnose a failure without re-running it. A
//! compare-and-swap miss is deliberately NOT an error: it returns `Ok(false)`
//! and is consumed by retry loops above the engine.

use std::error::Error;
use std::fmt;
use std::path::PathBuf;

use crate::engine::Recid;

/// LodeStore error types with detailed context
#[derive(Debug, Clone)]
pub enum StoreError {
    /// I/O operation failed
    Io {
        /// The file path where the error occurred, if file-backed
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// Operation referenced a recid that was never allocated or was deleted
    NotFound {
        /// The missing recid
        recid: Recid,
    },

    /// A decoded structure failed its format invariants
    Corrupted {
        /// What was being decoded ("record slot", "log entry", ...)
        context: &'static str,
        /// Description of the violated invariant
        detail: String,
    },

    /// Checksum verification failed
    ChecksumMismatch {
        /// What was being verified
        context: &'static str,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted payload
        offset: u64,
    },

    /// Partial entry at the end of a volume (write interrupted mid-entry)
    TornWrite {
        /// What was being read
        context: &'static str,
        /// Offset where the torn entry begins
        offset: u64,
        /// Bytes the entry header promised
        expected: u64,
        /// Bytes actually available
        available: u64,
    },

    /// Payload size exceeds the configured maximum
    Oversized {
        /// Size of the rejected payload
        size: u64,
        /// Configured limit
        limit: u64,
    },

    /// Write queue or transaction buffer is at capacity (backpressure)
    QueueFull {
        /// Entries currently pending
        pending: usize,
        /// Configured capacity
        capacity: usize,
    },

    /// A background flush failed; surfaced to the next caller operation
    FlushFailed {
        /// Description of the original failure
        message: String,
    },

    /// Mutation attempted through a read-only snapshot view
    ReadOnly,

    /// Operation on an engine that has been closed
    Closed,

    /// Operation not supported by this layer
    Unsupported {
        /// The unsupported operation name
        operation: &'static str,
    },

    /// A bounded compare-and-swap retry loop gave up under contention
    RetriesExhausted {
        /// Attempts made before giving up
        attempts: u32,
    },

    /// Configuration failed validation at engine construction
    InvalidConfig {
        /// Description of the rejected parameter
        reason: String,
    },
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Io { path, kind, message } => {
                if let Some(path) = path {
                    write!(f, "I/O error in {}: {} ({})", path.display(), message, kind)
                } else {
                    write!(f, "I/O error: {} ({})", message, kind)
                }
            }

            StoreError::NotFound { recid } => {
                write!(f, "recid {} does not exist", recid)
            }

            StoreError::Corrupted { context, detail } => {
                write!(f, "corrupted {}: {}", context, detail)
            }

            StoreError::ChecksumMismatch { context, expected, actual, offset } => {
                write!(f, "checksum mismatch in {} at offset {}: expected 0x{:08x}, got 0x{:08x}",
                       context, offset, expected, actual)
            }

            StoreError::TornWrite { context, offset, expected, available } => {
                write!(f, "torn write in {} at offset {}: expected {} bytes, only {} available",
                       context, offset, expected, available)
            }

            StoreError::Oversized { size, limit } => {
                write!(f, "payload too large: {} bytes exceeds limit of {} bytes", size, limit)
            }

            StoreError::QueueFull { pending, capacity } => {
                write!(f, "write queue full: {} entries pending, capacity {}", pending, capacity)
            }

            StoreError::FlushFailed { message } => {
                write!(f, "background flush failed: {}", message)
            }

            StoreError::ReadOnly => {
                write!(f, "engine is read-only (snapshot view)")
            }

            StoreError::Closed => {
                write!(f, "engine is closed")
            }

            StoreError::Unsupported { operation } => {
                write!(f, "operation not supported by this layer: {}", operation)
            }

            StoreError::RetriesExhausted { attempts } => {
                write!(f, "compare-and-swap retries exhausted after {} attempts", attempts)
            }

            StoreError::InvalidConfig { reason } => {
                write!(f, "invalid configuration: {}", reason)
            }
        }
    }
}

impl Error for StoreError {}

/// Convert std::io::Error to StoreError::Io
impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        StoreError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for LodeStore operations
pub type StoreResult<T> = Result<T, StoreError>;
