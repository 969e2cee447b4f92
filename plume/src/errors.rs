use backtrace::Backtrace;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::result::Result;

use crate::common::{atomic, Atomic};

/// Error kinds for Plume operations.
///
/// Each error kind describes a specific category of failure, enabling precise
/// error handling at operation boundaries.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorKind {
    /// Bad document shape, reserved field misuse, or an invalid update spec
    ValidationError,
    /// A unique index constraint was violated
    UniqueConstraintViolation,
    /// Generic IO error
    IOError,
    /// The file was not found
    FileNotFound,
    /// Permission denied for a file operation
    PermissionDenied,
    /// The datafile is corrupted beyond the tolerated threshold
    FileCorrupted,
    /// The provided document id is invalid
    InvalidId,
    /// The operation is not valid in the current context
    InvalidOperation,
    /// Error during query evaluation (unknown operator, malformed query)
    FilterError,
    /// Error during index creation or maintenance
    IndexingError,
    /// Internal error (usually indicates a bug)
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ValidationError => write!(f, "Validation error"),
            ErrorKind::UniqueConstraintViolation => write!(f, "Unique constraint violation"),
            ErrorKind::IOError => write!(f, "IO error"),
            ErrorKind::FileNotFound => write!(f, "File not found"),
            ErrorKind::PermissionDenied => write!(f, "Permission denied"),
            ErrorKind::FileCorrupted => write!(f, "File corrupted"),
            ErrorKind::InvalidId => write!(f, "Invalid ID"),
            ErrorKind::InvalidOperation => write!(f, "Invalid operation"),
            ErrorKind::FilterError => write!(f, "Filter error"),
            ErrorKind::IndexingError => write!(f, "Indexing error"),
            ErrorKind::InternalError => write!(f, "Internal error"),
        }
    }
}

/// Custom Plume error type.
///
/// `PlumeError` encapsulates the error message, kind, and an optional cause.
/// It supports error chaining and captures a backtrace at construction time
/// for debugging.
///
/// The `PlumeResult<T>` type alias is equivalent to `Result<T, PlumeError>`
/// and is used throughout the codebase for operations that can fail.
#[derive(Clone)]
pub struct PlumeError {
    message: String,
    error_kind: ErrorKind,
    cause: Option<Box<PlumeError>>,
    backtrace: Atomic<Backtrace>,
}

impl PlumeError {
    /// Creates a new `PlumeError` with the specified message and error kind.
    pub fn new(message: &str, error_kind: ErrorKind) -> Self {
        PlumeError {
            message: message.to_string(),
            error_kind,
            cause: None,
            backtrace: atomic(Backtrace::new()),
        }
    }

    /// Creates a new `PlumeError` with a cause error.
    ///
    /// This creates an error chain where the cause error is preserved for
    /// debugging.
    pub fn new_with_cause(message: &str, error_kind: ErrorKind, cause: PlumeError) -> Self {
        PlumeError {
            message: message.to_string(),
            error_kind,
            cause: Some(Box::new(cause)),
            backtrace: atomic(Backtrace::new()),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    pub fn cause(&self) -> Option<&PlumeError> {
        self.cause.as_deref()
    }
}

impl Display for PlumeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl Debug for PlumeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        // print error message with stack trace followed by cause
        match &self.cause {
            Some(cause) => write!(f, "{}\nCaused by: {:?}", self.message, cause),
            None => write!(f, "{}\n{:?}", self.message, self.backtrace.read()),
        }
    }
}

impl Error for PlumeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

/// A result type alias for Plume operations.
pub type PlumeResult<T> = Result<T, PlumeError>;

// From trait implementations for automatic error conversion
impl From<std::io::Error> for PlumeError {
    fn from(err: std::io::Error) -> Self {
        let error_kind = match err.kind() {
            std::io::ErrorKind::NotFound => ErrorKind::FileNotFound,
            std::io::ErrorKind::PermissionDenied => ErrorKind::PermissionDenied,
            _ => ErrorKind::IOError,
        };
        PlumeError::new(&format!("IO error: {}", err), error_kind)
    }
}

impl From<serde_json::Error> for PlumeError {
    fn from(err: serde_json::Error) -> Self {
        PlumeError::new(
            &format!("Record serialization error: {}", err),
            ErrorKind::FileCorrupted,
        )
    }
}

impl From<String> for PlumeError {
    fn from(msg: String) -> Self {
        PlumeError::new(&msg, ErrorKind::InternalError)
    }
}

impl From<&str> for PlumeError {
    fn from(msg: &str) -> Self {
        PlumeError::new(msg, ErrorKind::InternalError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plume_error_new_creates_error() {
        let error = PlumeError::new("An error occurred", ErrorKind::IOError);
        assert_eq!(error.message, "An error occurred");
        assert_eq!(error.error_kind, ErrorKind::IOError);
        assert!(error.cause.is_none());
    }

    #[test]
    fn plume_error_new_with_cause_creates_error() {
        let cause = PlumeError::new("disk gone", ErrorKind::IOError);
        let error =
            PlumeError::new_with_cause("Append failed", ErrorKind::IOError, cause);
        assert_eq!(error.message(), "Append failed");
        assert_eq!(error.kind(), &ErrorKind::IOError);
        assert!(error.cause().is_some());
    }

    #[test]
    fn plume_error_display_formats_correctly() {
        let error = PlumeError::new("An error occurred", ErrorKind::ValidationError);
        assert_eq!(format!("{}", error), "An error occurred");
    }

    #[test]
    fn plume_error_debug_contains_message_and_cause() {
        let cause = PlumeError::new("root cause", ErrorKind::IOError);
        let error = PlumeError::new_with_cause("outer", ErrorKind::IOError, cause);
        let formatted = format!("{:?}", error);
        assert!(formatted.contains("outer"));
        assert!(formatted.contains("root cause"));
    }

    #[test]
    fn io_error_kinds_map_to_error_kinds() {
        let not_found = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: PlumeError = not_found.into();
        assert_eq!(err.kind(), &ErrorKind::FileNotFound);

        let denied = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "no");
        let err: PlumeError = denied.into();
        assert_eq!(err.kind(), &ErrorKind::PermissionDenied);

        let other = std::io::Error::other("boom");
        let err: PlumeError = other.into();
        assert_eq!(err.kind(), &ErrorKind::IOError);
    }

    #[test]
    fn error_source_chain_is_exposed() {
        let cause = PlumeError::new("inner", ErrorKind::FileCorrupted);
        let error = PlumeError::new_with_cause("outer", ErrorKind::IOError, cause);
        let source = std::error::Error::source(&error);
        assert!(source.is_some());
        assert_eq!(source.unwrap().to_string(), "inner");
    }
}
