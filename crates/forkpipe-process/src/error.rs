//! Error types for process management

use std::ffi::NulError;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error reported by a running engine through [`crate::Process::error`].
///
/// These never travel through `Result`: an engine that hits one records it,
/// emits [`crate::ProcessEvent::ErrorOccurred`] and falls back to
/// [`crate::ProcessState::NotRunning`] where appropriate.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessError {
    /// Initial value, also restored by a fresh `start()`
    #[error("Unknown error")]
    UnknownError,

    /// Spawn-time failure (missing program, pipe/fork/exec failure, bad redirection)
    #[error("Process failed to start")]
    FailedToStart,

    /// The child terminated abnormally
    #[error("Process crashed")]
    Crashed,

    /// A blocking wait ran out of time
    #[error("Process operation timed out")]
    Timedout,

    /// Reading from one of the child's output channels failed
    #[error("Error reading from process")]
    ReadError,

    /// Writing to the child's input channel failed
    #[error("Error writing to process")]
    WriteError,
}

impl ProcessError {
    /// Whether the error survives until the next `start()`.
    ///
    /// `Timedout` is transient and `UnknownError` is the empty value.
    pub fn is_sticky(self) -> bool {
        !matches!(self, Self::UnknownError | Self::Timedout)
    }
}

impl Default for ProcessError {
    fn default() -> Self {
        Self::UnknownError
    }
}

/// Errors returned by fallible API calls
#[derive(Debug, Error)]
pub enum Error {
    /// Underlying OS call failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Invalid configuration
    #[error("Invalid process configuration: {0}")]
    InvalidConfig(String),

    /// A string handed to the OS contained an interior NUL byte
    #[error("Argument contains a NUL byte: {0}")]
    Nul(#[from] NulError),

    /// The facade is not open in the required mode
    #[error("Process device is not open for {0}")]
    NotOpen(&'static str),

    /// `start_detached` could not launch the program
    #[error("Failed to start detached process: {0}")]
    DetachedStartFailed(String),
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, Error>;

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(e) => e,
            Error::NotOpen(_) => io::Error::new(io::ErrorKind::PermissionDenied, err.to_string()),
            other => io::Error::new(io::ErrorKind::Other, other.to_string()),
        }
    }
}
