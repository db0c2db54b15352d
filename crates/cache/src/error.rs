//! Cache Error Types
//!
//! Structured errors using `exn` for automatic location tracking and error
//! tree construction. These never cross the public store API: every public
//! operation settles them into a cache miss (see [`settle`]).

use derive_more::{Display, Error};
use std::path::PathBuf;

/// A cache error with automatic location tracking.
pub type Error = exn::Exn<ErrorKind>;
/// Result type alias for cache operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Actionable error categories.
///
/// These describe what the caller should *do*, not what went wrong internally.
#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No database handle has been configured.
    #[display("cache database unavailable")]
    Unavailable,
    /// A root or file could not be turned into a key (empty input).
    #[display("unresolvable cache identity: {_0:?}")]
    UnresolvableIdentity(#[error(not(source))] String),
    /// A stored or legacy JSON payload could not be parsed.
    #[display("malformed payload: {_0}")]
    MalformedPayload(#[error(not(source))] &'static str),
    #[display("database error")]
    Database,
    #[display("database migration error")]
    Migration,
    /// A legacy sidecar file exists but could not be read.
    #[display("could not read {}", _0.display())]
    Io(#[error(not(source))] PathBuf),
    /// A value does not fit the column it is stored in (or vice versa).
    #[display("invalid cache data: {_0}")]
    InvalidData(#[error(not(source))] &'static str),
}

impl ErrorKind {
    /// Returns `true` if retrying might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database | Self::Io(_))
    }

    /// Expected conditions that only mean "nothing cached", not a fault.
    pub(crate) fn is_quiet(&self) -> bool {
        matches!(self, Self::Unavailable | Self::UnresolvableIdentity(_))
    }
}

/// Collapse an internal result into the caller's sentinel, logging faults.
pub(crate) fn settle<T>(operation: &'static str, result: Result<T>, fallback: impl FnOnce() -> T) -> T {
    match result {
        Ok(value) => value,
        Err(err) if err.is_quiet() => {
            let reason: &ErrorKind = &err;
            tracing::trace!(operation, reason = %reason, "Cache operation skipped");
            fallback()
        },
        Err(err) => {
            tracing::warn!(operation, error = ?err, "Cache operation failed; treating as a miss");
            fallback()
        },
    }
}
