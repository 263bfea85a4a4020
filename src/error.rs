//! Error types for the playback engine
//!
//! Defines the engine-wide error taxonomy using thiserror for clear error
//! propagation. Player-visible failures also carry an [`ErrorKind`]
//! discriminant so asynchronous error events can report a category without
//! moving the full error value.

use thiserror::Error;

/// Main error type for the playback engine
#[derive(Error, Debug)]
pub enum Error {
    /// A caller-supplied argument is out of range or malformed.
    /// Never causes a state transition.
    #[error("Illegal argument: {0}")]
    IllegalArgument(String),

    /// The operation is not legal in the current state
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Backing memory for a pipe or adapter could not be allocated
    #[error("Memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    /// A fixed-size pool (pipe slots, mixer clients) is exhausted
    #[error("Resource allocation failed: {0}")]
    ResourceAllocationFailed(String),

    /// The decoder rejected the content format
    #[error("Content unsupported: {0}")]
    ContentUnsupported(String),

    /// The content could not be located or opened
    #[error("Content not found: {0}")]
    ContentNotFound(String),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),

    /// A bounded wait expired before the operation completed
    #[error("Timed out: {0}")]
    TimedOut(String),
}

impl Error {
    /// Category discriminant for event reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::IllegalArgument(_) => ErrorKind::IllegalArgument,
            Error::IllegalState(_) => ErrorKind::IllegalState,
            Error::MemoryAllocationFailed(_) => ErrorKind::MemoryAllocationFailed,
            Error::ResourceAllocationFailed(_) => ErrorKind::ResourceAllocationFailed,
            Error::ContentUnsupported(_) => ErrorKind::ContentUnsupported,
            Error::ContentNotFound(_) => ErrorKind::ContentNotFound,
            Error::Internal(_) => ErrorKind::Internal,
            Error::TimedOut(_) => ErrorKind::TimedOut,
        }
    }
}

/// Copyable error category carried by asynchronous error events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    IllegalArgument,
    IllegalState,
    MemoryAllocationFailed,
    ResourceAllocationFailed,
    ContentUnsupported,
    ContentNotFound,
    Internal,
    TimedOut,
}

impl ErrorKind {
    /// Rebuild a full [`Error`] from a stored kind and message
    ///
    /// Used where a failure must be held in `Clone`-able form (worker thread
    /// state, queued events) and surfaced as an `Error` on each query.
    pub fn with_message(self, message: impl Into<String>) -> Error {
        let message = message.into();
        match self {
            ErrorKind::IllegalArgument => Error::IllegalArgument(message),
            ErrorKind::IllegalState => Error::IllegalState(message),
            ErrorKind::MemoryAllocationFailed => Error::MemoryAllocationFailed(message),
            ErrorKind::ResourceAllocationFailed => Error::ResourceAllocationFailed(message),
            ErrorKind::ContentUnsupported => Error::ContentUnsupported(message),
            ErrorKind::ContentNotFound => Error::ContentNotFound(message),
            ErrorKind::Internal => Error::Internal(message),
            ErrorKind::TimedOut => Error::TimedOut(message),
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::IllegalArgument => "illegal_argument",
            ErrorKind::IllegalState => "illegal_state",
            ErrorKind::MemoryAllocationFailed => "memory_allocation_failed",
            ErrorKind::ResourceAllocationFailed => "resource_allocation_failed",
            ErrorKind::ContentUnsupported => "content_unsupported",
            ErrorKind::ContentNotFound => "content_not_found",
            ErrorKind::Internal => "internal_error",
            ErrorKind::TimedOut => "timed_out",
        };
        write!(f, "{}", s)
    }
}

/// Convenience Result type using the engine Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_mapping() {
        let err = Error::IllegalState("start before prepare".to_string());
        assert_eq!(err.kind(), ErrorKind::IllegalState);

        let err = Error::ResourceAllocationFailed("no free source pipe".to_string());
        assert_eq!(err.kind(), ErrorKind::ResourceAllocationFailed);
    }

    #[test]
    fn test_error_display_includes_message() {
        let err = Error::ContentNotFound("/missing/file.mp3".to_string());
        let msg = format!("{}", err);
        assert!(msg.contains("Content not found"));
        assert!(msg.contains("/missing/file.mp3"));
    }

    #[test]
    fn test_kind_display_is_stable() {
        assert_eq!(ErrorKind::TimedOut.to_string(), "timed_out");
        assert_eq!(ErrorKind::Internal.to_string(), "internal_error");
    }

    #[test]
    fn test_with_message_round_trips_kind() {
        for kind in [
            ErrorKind::IllegalArgument,
            ErrorKind::ContentUnsupported,
            ErrorKind::TimedOut,
        ] {
            let err = kind.with_message("detail");
            assert_eq!(err.kind(), kind);
            assert!(err.to_string().contains("detail"));
        }
    }
}
