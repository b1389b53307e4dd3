//! Error types for the key-value store.
//!
//! A single flat enum covers every subsystem so callers match on one type
//! instead of threading per-module errors through the coordinator.

use std::fmt;
use std::path::PathBuf;

/// Standard `Result` type for all store operations.
pub type KvResult<T> = Result<T, KvError>;

/// Error types produced by the store, its background workers, and the wire
/// protocol layer.
#[derive(Debug)]
pub enum KvError {
    /// Another live process already holds the data directory.
    DirectoryInUse { path: PathBuf, pid: u32 },

    /// Generic I/O failure, tagged with the operation that failed.
    Io { operation: String, reason: String },

    /// A record read at a given offset did not fit inside the data file.
    RecordOutOfBounds { offset: u64, file_size: u64 },

    /// The key stored at an index entry's offset does not match the index
    /// key (violates I1; should be unreachable).
    IntegrityMismatch { expected: Vec<u8>, offset: u64 },

    /// `batch_put` was called with mismatched key/value counts.
    BatchLengthMismatch { keys: usize, values: usize },

    /// The WAL or index snapshot file is corrupted beyond the point where
    /// a partial-tail truncation can recover it.
    CorruptedLog { reason: String },

    /// A lock (in-process or cross-process) could not be acquired.
    LockTimeout { resource: String },

    /// The wire protocol received a malformed command.
    ProtocolError { message: String },

    /// A `REPLICATE *` command arrived at a node not configured as a
    /// follower.
    NotAFollower,

    /// Configuration file could not be parsed.
    InvalidConfig { reason: String },
}

impl fmt::Display for KvError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DirectoryInUse { path, pid } => {
                write!(f, "directory '{}' is in use by process {}", path.display(), pid)
            }
            Self::Io { operation, reason } => {
                write!(f, "I/O error during '{}': {}", operation, reason)
            }
            Self::RecordOutOfBounds { offset, file_size } => write!(
                f,
                "record at offset {} extends past end of data file ({} bytes)",
                offset, file_size
            ),
            Self::IntegrityMismatch { expected, offset } => write!(
                f,
                "record at offset {} did not match expected key ({} bytes)",
                offset,
                expected.len()
            ),
            Self::BatchLengthMismatch { keys, values } => write!(
                f,
                "batch_put key count ({}) does not match value count ({})",
                keys, values
            ),
            Self::CorruptedLog { reason } => write!(f, "log corrupted: {}", reason),
            Self::LockTimeout { resource } => write!(f, "timed out acquiring lock on {}", resource),
            Self::ProtocolError { message } => write!(f, "protocol error: {}", message),
            Self::NotAFollower => {
                write!(f, "REPLICATE commands only accepted on replica nodes")
            }
            Self::InvalidConfig { reason } => write!(f, "invalid configuration: {}", reason),
        }
    }
}

impl std::error::Error for KvError {}

impl From<std::io::Error> for KvError {
    fn from(err: std::io::Error) -> Self {
        KvError::Io {
            operation: "unknown".to_string(),
            reason: err.to_string(),
        }
    }
}

/// Attaches an operation name to an I/O error, for call sites that want a
/// more specific message than the blanket `From` conversion provides.
pub(crate) fn io_err(operation: &str, err: std::io::Error) -> KvError {
    KvError::Io {
        operation: operation.to_string(),
        reason: err.to_string(),
    }
}
