//! Common error types for Kestrel

use thiserror::Error;

/// Common result type for Kestrel operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across the Kestrel crates
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV read/write error on an input or output store
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Store-level failures abort a run; everything else is reported per item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Csv(_))
    }
}
