//! Error taxonomy for external-memory streams, merge, scan and sort.

use thiserror::Error;

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can go wrong in a stream, scan, merge or sort.
///
/// `EndOfStream` is deliberately not a variant here: reaching the end of a
/// stream during `read_item` is an expected outcome, modeled as `Ok(None)`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("bad stream header: {0}")]
    BadHeader(String),

    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    #[error("stream is read-only")]
    ReadOnly,

    #[error("out of space")]
    OutOfSpace,

    #[error("memory limit exceeded: requested {requested} bytes, {available} available")]
    MemoryExceeded { requested: u64, available: u64 },

    #[error("illegal alias: input and output refer to the same file ({0})")]
    IllegalAlias(String),

    #[error("invalid operation on a closed or invalid stream: {0}")]
    InvalidState(String),

    #[error("permission denied: {0}")]
    Permission(String),
}
