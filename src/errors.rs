//! Error handling for the I/O bridge.
//!
//! Recoverable failures (resource exhaustion, bad parameters, refused
//! operations, device errors) travel as [`IoError`] and end up as one of the
//! channel result codes. Invariant violations inside the core are not
//! represented here: they panic.

#![allow(clippy::uninlined_format_args)]

use core::fmt;
use alloc::string::String;

/// Result type for bridge operations.
pub type IoResult<T> = Result<T, IoError>;

/// Operation completed.
pub const RESULT_OK: i64 = 0;
/// The channel or context handle is not known.
pub const RESULT_BAD_CONTEXT: i64 = -1;
/// The operation failed; the message is available through `GetErrorChar`.
pub const RESULT_EXCEPTION: i64 = -2;
/// A parameter was out of range or malformed.
pub const RESULT_BAD_PARAMETER: i64 = -3;
/// A request, task or interrupt record could not be allocated.
pub const RESULT_MALLOC_FAILURE: i64 = -4;

/// Error type for all recoverable bridge operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// Allocating an event request, native task or IRQ request failed
    OutOfMemory,
    /// Invalid parameter provided
    BadParameter(String),
    /// The task executor has not finished draining yet
    ExecutorBusy,
    /// No executor, task or channel with this handle
    UnknownHandle(i64),
    /// An OS call failed with the given errno
    Os(i32),
    /// A device driver reported a failure
    Device(String),
}

impl IoError {
    /// The channel result code reported to the interpreter for this error.
    pub fn result_code(&self) -> i64 {
        match self {
            IoError::OutOfMemory => RESULT_MALLOC_FAILURE,
            IoError::BadParameter(_) => RESULT_BAD_PARAMETER,
            IoError::UnknownHandle(_) => RESULT_BAD_CONTEXT,
            IoError::ExecutorBusy
            | IoError::Os(_)
            | IoError::Device(_) => RESULT_EXCEPTION,
        }
    }

    /// Create a bad parameter error.
    pub fn bad_parameter<T: Into<String>>(msg: T) -> Self {
        IoError::BadParameter(msg.into())
    }

    /// Create a device error.
    pub fn device<T: Into<String>>(msg: T) -> Self {
        IoError::Device(msg.into())
    }
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::OutOfMemory => write!(f, "Out of memory"),
            IoError::BadParameter(msg) => write!(f, "Invalid parameter: {}", msg),
            IoError::ExecutorBusy => write!(f, "Task executor has not finished"),
            IoError::UnknownHandle(handle) => write!(f, "Unknown handle: {}", handle),
            IoError::Os(errno) => write!(f, "OS error {}", errno),
            IoError::Device(msg) => write!(f, "Device error: {}", msg),
        }
    }
}

impl From<alloc::collections::TryReserveError> for IoError {
    fn from(_: alloc::collections::TryReserveError) -> Self {
        IoError::OutOfMemory
    }
}

#[cfg(feature = "std")]
impl From<std::io::Error> for IoError {
    fn from(error: std::io::Error) -> Self {
        match error.raw_os_error() {
            Some(errno) => IoError::Os(errno),
            None => IoError::Device(alloc::format!("{}", error)),
        }
    }
}
