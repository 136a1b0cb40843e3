//! Stack-wide error type
//!
//! Every public operation returns `Result<_, NetError>`. Wire codecs keep
//! their own finer-grained parse errors and convert into this one at the
//! layer boundary.

use core::fmt;

/// Errors surfaced by the network stack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Argument out of range, malformed input, or unknown handle
    InvalidArg,
    /// A bounded table or queue is full
    OutOfMemory,
    /// No route, handler, cache entry, data or answer
    NotFound,
    /// Unhandled protocol, option or socket type
    NotSupported,
    /// Retry budget or deadline exhausted
    Timeout,
    /// Checksum mismatch, negative acknowledgment or device failure
    Failed,
    /// Interface missing or down
    DeviceNotFound,
    /// Operation not valid in the current socket/connection state
    InvalidState,
    /// Resource (e.g. a listening port) is already taken
    AlreadyExists,
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetError::InvalidArg => write!(f, "Invalid argument"),
            NetError::OutOfMemory => write!(f, "Out of memory"),
            NetError::NotFound => write!(f, "Not found"),
            NetError::NotSupported => write!(f, "Not supported"),
            NetError::Timeout => write!(f, "Timed out"),
            NetError::Failed => write!(f, "Operation failed"),
            NetError::DeviceNotFound => write!(f, "Network device not found"),
            NetError::InvalidState => write!(f, "Invalid state"),
            NetError::AlreadyExists => write!(f, "Already exists"),
        }
    }
}

/// Result alias used throughout the stack
pub type NetResult<T> = Result<T, NetError>;
