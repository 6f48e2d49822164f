//! Common error definitions

use std::io;

/// Errors produced by the codec, the buffers and the writer pipeline.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A null pointer, a stale weak reference or a malformed request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The destination (or source) is too small for the encoded entry.
    #[error("out of range: need {needed} bytes, have {available}")]
    OutOfRange { needed: usize, available: usize },
    #[error("unknown entry type {0}")]
    UnknownEntryType(u8),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    /// A persisted buffer file that cannot be interpreted.
    #[error("bad buffer dump: {0}")]
    BadDump(String),
}

impl Error {
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
}

/// Convenience alias for [`std::result::Result`] using our own `Error` type.
pub type Result<A> = std::result::Result<A, Error>;
