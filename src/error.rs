//! Closed error taxonomy for the storage engine.
//!
//! Every fallible public operation returns [`Result<T>`]. The core never
//! retries I/O, never masks corruption, and never continues past a failed
//! metadata barrier — callers see exactly one of these variants and nothing
//! else.

use std::fmt;

/// Errors returned by the QCOW2 storage engine.
#[derive(Debug, thiserror::Error)]
pub enum DiskError {
    /// Bad magic, unsupported version, bad header length, feature bits,
    /// or misaligned on-disk offsets.
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    /// An unknown incompatible feature bit, or an unsupported crypto or
    /// compression type was requested.
    #[error("unsupported feature: {0}")]
    UnsupportedFeature(String),

    /// The image is marked corrupt, metadata points outside the file,
    /// references are cyclic, or a refcount mismatch was detected mid
    /// operation.
    #[error("corrupt image: {0}")]
    Corrupt(String),

    /// A write was attempted on an image opened read-only.
    #[error("image is read-only")]
    ReadOnly,

    /// The requested offset is negative (impossible for `u64`, kept for
    /// symmetry with the taxonomy) or past the end of the addressable
    /// range for the operation being performed.
    #[error("offset out of range")]
    OffsetOutOfRange,

    /// A refcount increment would exceed `(1 << width) - 1`.
    #[error("refcount overflow")]
    RefcountOverflow,

    /// The backing-file chain exceeds the maximum depth of 64.
    #[error("backing chain too deep")]
    BackingChainTooDeep,

    /// Opening a backing file would re-enter an image already open in the
    /// current chain.
    #[error("backing chain cycle detected")]
    BackingChainCycle,

    /// A read or write touched an encrypted image with no codec installed.
    #[error("image is encrypted; no codec installed")]
    Encrypted,

    /// The codec factory rejected the supplied password.
    #[error("wrong password")]
    WrongPassword,

    /// The external data file referenced by the image could not be opened.
    #[error("external data file missing: {0}")]
    ExternalDataFileMissing(String),

    /// Underlying storage-backend I/O failure. Carries the rendered cause
    /// rather than a boxed `std::io::Error` so `DiskError` stays small and
    /// trivially constructible from test fixtures.
    #[error("I/O error: {0}")]
    Io(String),
}

impl DiskError {
    /// Shorthand for building an [`DiskError::InvalidFormat`] from anything
    /// `Display`-able.
    pub fn invalid_format(msg: impl fmt::Display) -> Self {
        DiskError::InvalidFormat(msg.to_string())
    }

    /// Shorthand for building a [`DiskError::Corrupt`].
    pub fn corrupt(msg: impl fmt::Display) -> Self {
        DiskError::Corrupt(msg.to_string())
    }

    /// Shorthand for building an [`DiskError::UnsupportedFeature`].
    pub fn unsupported(msg: impl fmt::Display) -> Self {
        DiskError::UnsupportedFeature(msg.to_string())
    }
}

impl From<std::io::Error> for DiskError {
    fn from(e: std::io::Error) -> Self {
        DiskError::Io(e.to_string())
    }
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, DiskError>;
