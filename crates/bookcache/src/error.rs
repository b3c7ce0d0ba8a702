//! Error types for bookcache

use std::fmt;

/// Result type alias for bookcache operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for cache construction and diagnostics
///
/// Lookups that miss and oversized inserts are not errors; they are reported
/// through [`SetOutcome`](crate::SetOutcome) and
/// [`DeleteOutcome`](crate::DeleteOutcome).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Memory budget of zero bytes
    ZeroMemory,

    /// Initial table capacity is not a power of two or is below the minimum
    InvalidTableCapacity(usize),

    /// Internal bookkeeping is inconsistent (reported by `check_invariants`)
    Invariant(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ZeroMemory => write!(f, "Memory budget must be greater than 0"),
            Error::InvalidTableCapacity(capacity) => write!(
                f,
                "Invalid table capacity: {} (must be a power of two >= {})",
                capacity,
                crate::index::MIN_TABLE_CAPACITY
            ),
            Error::Invariant(msg) => write!(f, "Invariant violated: {}", msg),
        }
    }
}

impl std::error::Error for Error {}
