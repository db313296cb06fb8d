//! Crate-wide error taxonomy.
//!
//! Mirrors the error kinds surfaced by the original block-I/O layer (see
//! spec §7): allocation failure, malformed on-disk structures, unformatted
//! or mismatched blob headers, checksum mismatches, media errors, backoff
//! signals, and lifecycle refusals. Each variant maps to exactly one of
//! those kinds so callers can match on it the way the spec's propagation
//! policy expects.

use thiserror::Error;

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the block I/O layer.
#[derive(Debug, Error)]
pub enum Error {
    /// Any allocation failure (DMA chunk growth, bulk handle growth, ...).
    #[error("out of memory: {0}")]
    NoMem(String),

    /// A malformed on-disk structure that was expected to be valid
    /// (committed-range checksum mismatch, impossible block layout, ...).
    #[error("invalid on-disk structure: {0}")]
    Inval(String),

    /// The blob has never been formatted.
    #[error("blob is unformatted")]
    Uninit,

    /// The blob was formatted by an incompatible version.
    #[error("incompatible on-disk format version: found {found}, expected {expected}")]
    Incompatible {
        /// Version found on disk.
        found: u32,
        /// Version this build expects.
        expected: u32,
    },

    /// Header CRC mismatch.
    #[error("checksum mismatch: expected {expected:#010x}, computed {computed:#010x}")]
    Csum {
        /// Checksum recorded on disk.
        expected: u32,
        /// Checksum recomputed over the same bytes.
        computed: u32,
    },

    /// Media error encountered while servicing a fetch (or with auto-faulty
    /// enabled, any media error).
    #[error("NVMe media error during read: {0}")]
    NvmeIo(String),

    /// Media error encountered while servicing an update, with auto-faulty
    /// disabled.
    #[error("I/O error: {0}")]
    Io(String),

    /// A non-blocking reserve would have to block; caller must back off.
    #[error("resource temporarily unavailable, retry")]
    Again,

    /// The WAL (or blobstore) is shutting down; the caller's wait was
    /// interrupted by a broadcast wakeup with no result.
    #[error("shut down while waiting")]
    Shutdown,

    /// An operation was refused because of in-flight I/O (e.g. closing a
    /// blob context while DMA is outstanding).
    #[error("busy: {0}")]
    Busy(String),

    /// The blob (or blobstore) handle is invalid — closed, or the device
    /// left NORMAL state.
    #[error("no handle: {0}")]
    NoHandle(String),

    /// Malformed or unparsable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Passthrough for the standard library's I/O errors (file-backed mock
    /// device, config file reads, ...).
    #[error(transparent)]
    StdIo(#[from] std::io::Error),
}

impl From<Error> for std::io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::StdIo(e) => e,
            other => std::io::Error::other(other.to_string()),
        }
    }
}
