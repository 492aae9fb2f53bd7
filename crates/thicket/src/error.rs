//! Error types for index construction, search, and persistence.

use core::fmt;

/// Errors surfaced by index operations.
///
/// All failures propagate to the outermost API call; nothing is swallowed. A
/// failed `build` leaves the index empty.
#[derive(Debug)]
pub enum Error {
    /// The caller passed data with the wrong shape, an out-of-range row, or
    /// an unusable parameter value.
    InvalidInput(String),
    /// The requested index type cannot operate with the configured metric.
    UnsupportedMetric(String),
    /// A snapshot could not be written, or a stream could not be read back as
    /// an index (bad magic, version or shape mismatch, truncation, failed
    /// decompression).
    Serialization(String),
    /// A structure could not be grown or a worker pool could not be created.
    ResourceExhausted(String),
    /// An internal invariant was violated; indicates a bug in this crate.
    InternalInvariant(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput(s) => write!(f, "invalid input: {s}"),
            Self::UnsupportedMetric(s) => write!(f, "unsupported metric: {s}"),
            Self::Serialization(s) => write!(f, "serialization: {s}"),
            Self::ResourceExhausted(s) => write!(f, "resource exhausted: {s}"),
            Self::InternalInvariant(s) => write!(f, "internal invariant violated: {s}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// The result type used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
