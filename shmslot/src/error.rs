//! Error types for shared slot store operations

use shmslot_common::config::ConfigError;
use thiserror::Error;

/// Errors that can escape the shared slot store.
///
/// Recoverable conditions of the attach protocol (object missing, lost
/// creation race, stale segment, huge pages refused) are handled inside the
/// segment manager and never surface here.
#[derive(Error, Debug)]
pub enum ShmError {
    /// The process lacks the privilege needed for huge-page shared memory
    #[error("Insufficient privilege: effective uid {euid} is not root")]
    InsufficientPrivilege {
        /// Effective user ID of the caller
        euid: u32,
    },

    /// Segment name is not a valid POSIX shared memory name
    #[error("Invalid segment name {name:?}: {reason}")]
    InvalidName {
        /// Name as given by the caller
        name: String,
        /// Why it was rejected
        reason: &'static str,
    },

    /// Requested capacity cannot be laid out
    #[error("Invalid capacity: {capacity} slots of {cell_size} bytes")]
    InvalidCapacity {
        /// Requested element count
        capacity: usize,
        /// Size of one padded cell
        cell_size: usize,
    },

    /// Element type alignment exceeds what the segment layout provides
    #[error("Unsupported element alignment: {align} bytes (maximum is one cache line)")]
    UnsupportedAlignment {
        /// Alignment of the padded cell for the element type
        align: usize,
    },

    /// Element size recorded in the header differs from the local type
    #[error("Type mismatch for segment {name}: segment holds {found}-byte elements, local type is {expected} bytes")]
    TypeMismatch {
        /// Segment name
        name: String,
        /// `size_of::<T>()` in this process
        expected: u64,
        /// Element size recorded by the creator
        found: u64,
    },

    /// Header is published but inconsistent with its own layout or the object size
    #[error("Corrupt segment {name}: {reason}")]
    CorruptSegment {
        /// Segment name
        name: String,
        /// What failed to line up
        reason: String,
    },

    /// Slot index outside the segment
    #[error("Index {index} out of range for segment with {capacity} slots")]
    IndexOutOfRange {
        /// Requested index
        index: usize,
        /// Number of slots in the segment
        capacity: usize,
    },

    /// Join/create rounds exhausted without resolving the race
    #[error("Severe concurrent contention on segment {name}: unresolved after {attempts} attempts")]
    Contention {
        /// Segment name
        name: String,
        /// Rounds performed
        attempts: u32,
    },

    /// Operating system call failed
    #[error("{op} failed for segment {name}: {source}")]
    Os {
        /// System call or step that failed
        op: &'static str,
        /// Segment name
        name: String,
        /// Source nix error
        #[source]
        source: nix::Error,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Invalid store options
    #[error("Configuration error: {source}")]
    Config {
        /// Source configuration error
        #[from]
        source: ConfigError,
    },
}

impl ShmError {
    pub(crate) fn os(op: &'static str, name: &str, source: nix::Error) -> Self {
        Self::Os {
            op,
            name: name.to_string(),
            source,
        }
    }

    /// Whether the error is a build/layout incompatibility between processes.
    pub fn is_type_mismatch(&self) -> bool {
        matches!(self, Self::TypeMismatch { .. })
    }
}

/// Result type for shared slot store operations
pub type ShmResult<T> = Result<T, ShmError>;
