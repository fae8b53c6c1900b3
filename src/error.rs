//! Failure taxonomy shared by every tier.
//!
//! Each module keeps its own `thiserror` enum; all of them map onto one
//! [`ErrorKind`] so callers can decide whether to retry, evict harder, or
//! abort a model switch without matching on module-specific variants.

use serde::Serialize;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// Empty buffers, zero-length requests, mismatched sizes on a cache hit.
    InvalidInput,
    /// Not enough space even after evicting every evictable entry.
    OutOfBudget,
    /// Requested codec is absent and no fallback could serve the request.
    CodecUnavailable,
    /// Container header missing/invalid or decoded size mismatch.
    CorruptContainer,
    /// Tokenization, decode, or a state call failed inside the runtime.
    ExternalContextFailure,
    /// Bytes requested and bytes transferred differ.
    SizeMismatch,
    /// Filesystem failure in a persistent tier.
    Io,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::InvalidInput => "invalid input",
            ErrorKind::OutOfBudget => "out of budget",
            ErrorKind::CodecUnavailable => "codec unavailable",
            ErrorKind::CorruptContainer => "corrupt container",
            ErrorKind::ExternalContextFailure => "external context failure",
            ErrorKind::SizeMismatch => "size mismatch",
            ErrorKind::Io => "i/o",
        };
        f.write_str(name)
    }
}

/// Implemented by every module error in the crate.
pub trait Classify {
    fn kind(&self) -> ErrorKind;
}
