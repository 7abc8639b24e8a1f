//! Error types for ShmStructs

use std::io;
use thiserror::Error;

/// Result type for ShmStructs operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in ShmStructs operations
#[derive(Debug, Error)]
pub enum Error {
    /// Failed to create or attach to a pool's backing segment
    #[error("Failed to open pool '{name}': {source}")]
    CannotOpen {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to resize a pool's backing segment
    #[error("Failed to resize pool '{name}': {source}")]
    CannotResize {
        name: String,
        #[source]
        source: io::Error,
    },

    /// Failed to map or remap a pool into this process
    #[error("Failed to map pool memory: {0}")]
    Mmap(#[source] io::Error),

    /// An expansion would exceed the pool's configured maximum size
    #[error("Pool expansion to {requested} bytes exceeds maximum of {max} bytes")]
    ExceedsMax { max: u64, requested: u64 },

    /// The allocator cannot satisfy a request, even after pool expansion
    #[error("Out of memory: cannot allocate {requested} bytes")]
    OutOfMemory { requested: usize },

    /// Lookup of a key that is not present
    #[error("Key not found")]
    NotFound,

    /// Numeric operation against a slot of the wrong type
    #[error("Type mismatch: stored value is not of the requested numeric type")]
    TypeMismatch,

    /// An integrity check on pool-resident metadata failed
    #[error("Corruption detected: {0}")]
    Corruption(&'static str),

    /// Segment name too long for the OS naming rules
    #[error("Pool name too long: max {max} chars, got {got}")]
    NameTooLong { max: usize, got: usize },
}
