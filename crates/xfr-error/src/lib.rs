#![forbid(unsafe_code)]
//! Error types for xfr.
//!
//! # Error Taxonomy
//!
//! xfr uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Parsing | `ParseError` | `xfr-types` | On-disk format violations detected during byte parsing |
//! | Runtime | `XfrError` | `xfr-error` (this crate) | Errors returned by traversal operations |
//!
//! ## Mapping Policy: ParseError → XfrError
//!
//! `xfr-error` is independent of `xfr-types` and `xfr-ondisk`. The
//! conversion lives in `xfr-core`, which knows the device offset of the
//! block being decoded and attaches it:
//!
//! | ParseError Variant | XfrError Variant |
//! |--------------------|------------------|
//! | `InsufficientData` | `Corruption { offset, detail }` |
//! | `SignatureMismatch` | `SignatureMismatch { offset, detail }` |
//! | `InvalidField` | `Corruption { offset, detail }` |
//! | `Unsupported` | `UnsupportedLayout` |
//! | `IntegerConversion` | `Corruption { offset, detail }` |
//! | `ChecksumMismatch` | `ChecksumMismatch { offset, detail }` |
//!
//! A short read from the device itself is `TruncatedRead`, reported by the
//! block layer before any decoding happens.
//!
//! ## Propagation
//!
//! Every variant aborts the enclosing traversal. Directory and attribute
//! listings are all-or-nothing; there is no partial result.

use thiserror::Error;

/// Unified error type for all xfr operations.
#[derive(Debug, Error)]
pub enum XfrError {
    /// Operating system I/O error (wraps `std::io::Error`), passed through unchanged.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device returned fewer bytes than the decoder required.
    #[error("truncated read at offset {offset}: needed {needed} bytes, got {actual}")]
    TruncatedRead {
        offset: u64,
        needed: usize,
        actual: usize,
    },

    /// A decoded magic did not match the accepted set for its structure.
    ///
    /// `detail` names the structure, the expected set, and the actual value.
    #[error("signature mismatch at offset {offset}: {detail}")]
    SignatureMismatch { offset: u64, detail: String },

    /// Structurally valid metadata in a variant this build does not handle.
    #[error("unsupported layout: {0}")]
    UnsupportedLayout(String),

    /// On-disk metadata is inconsistent (bad field, overrun, pointer cycle).
    #[error("corrupt metadata at offset {offset}: {detail}")]
    Corruption { offset: u64, detail: String },

    /// A v5 block's stored CRC32C does not match its contents.
    #[error("checksum mismatch at offset {offset}: {detail}")]
    ChecksumMismatch { offset: u64, detail: String },

    /// Caller-supplied geometry or arguments are invalid.
    #[error("invalid format: {0}")]
    Format(String),

    /// Named object not found.
    #[error("not found: {0}")]
    NotFound(String),
}

impl XfrError {
    /// `true` when the error indicates damaged or foreign on-disk data.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::SignatureMismatch { .. }
                | Self::ChecksumMismatch { .. }
                | Self::Corruption { .. }
                | Self::TruncatedRead { .. }
        )
    }

    /// `true` when the data is valid but uses a variant this build does not read.
    #[must_use]
    pub fn is_unsupported(&self) -> bool {
        matches!(self, Self::UnsupportedLayout(_))
    }
}

/// Result alias using `XfrError`.
pub type Result<T> = std::result::Result<T, XfrError>;
