//! Config Error Types

use derive_more::{Display, Error};
use std::path::PathBuf;

pub type Error = exn::Exn<ErrorKind>;
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Display, Error)]
pub enum ErrorKind {
    /// No per-user config directory exists on this platform.
    #[display("could not determine the configuration directory")]
    NoConfigDir,
    /// An explicitly requested config file does not exist.
    #[display("config file not found: {}", _0.display())]
    NotFound(#[error(not(source))] PathBuf),
    /// The file extension does not name a supported format.
    #[display("unsupported config format: {}", _0.display())]
    UnsupportedFormat(#[error(not(source))] PathBuf),
    /// A layer could not be parsed, or a value has the wrong type.
    #[display("invalid configuration")]
    Invalid,
}

impl ErrorKind {
    pub fn is_retryable(&self) -> bool {
        false
    }
}
