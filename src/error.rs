//! Error types for tilestore

use std::cell::RefCell;
use std::io;

/// Result type for tilestore operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Error types that can occur during array storage operations
#[derive(Debug)]
pub enum StoreError {
    /// Invalid argument: schema violation, unknown attribute, subarray
    /// outside the domain, mis-sized buffer
    InvalidArg(String),
    /// Missing array, fragment or attribute file
    NotFound(String),
    /// Creating over an existing array, workspace or group
    AlreadyExists(String),
    /// I/O error from the filesystem layer
    Io(io::Error),
    /// Codec rejected its input, or bookkeeping failed its integrity check
    Decode(String),
    /// Codec failed while producing output
    Encode(String),
    /// Operation not supported by the configured backend or build
    Unsupported(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::InvalidArg(msg) => write!(f, "Invalid argument: {}", msg),
            StoreError::NotFound(msg) => write!(f, "Not found: {}", msg),
            StoreError::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            StoreError::Io(e) => write!(f, "I/O error: {}", e),
            StoreError::Decode(msg) => write!(f, "Decode error: {}", msg),
            StoreError::Encode(msg) => write!(f, "Encode error: {}", msg),
            StoreError::Unsupported(msg) => write!(f, "Unsupported: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<io::Error> for StoreError {
    fn from(err: io::Error) -> Self {
        StoreError::Io(err)
    }
}

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

/// Record `err` in the thread-local message buffer and return it.
///
/// Library-surface functions funnel their failures through this so that a
/// caller holding only a status can still retrieve a diagnostic string.
pub(crate) fn record(err: StoreError) -> StoreError {
    LAST_ERROR.with(|msg| {
        *msg.borrow_mut() = err.to_string();
    });
    err
}

/// Clear the thread-local message buffer (called on successful surface calls).
pub(crate) fn clear_last_error() {
    LAST_ERROR.with(|msg| msg.borrow_mut().clear());
}

/// The message of the last error recorded on this thread, empty if none.
pub fn last_error_message() -> String {
    LAST_ERROR.with(|msg| msg.borrow().clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_kinds() {
        let e = StoreError::InvalidArg("bad subarray".to_string());
        assert_eq!(e.to_string(), "Invalid argument: bad subarray");
        let e = StoreError::NotFound("no such array".to_string());
        assert!(e.to_string().starts_with("Not found"));
    }

    #[test]
    fn test_last_error_roundtrip() {
        clear_last_error();
        assert!(last_error_message().is_empty());
        let _ = record(StoreError::Decode("counts mismatch".to_string()));
        assert_eq!(last_error_message(), "Decode error: counts mismatch");
        clear_last_error();
        assert!(last_error_message().is_empty());
    }

    #[test]
    fn test_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "denied");
        let e: StoreError = io_err.into();
        assert!(matches!(e, StoreError::Io(_)));
    }
}
