//! Error types for Bento containers
//!
//! This module defines all error types used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Conditions detected by the update machinery are identified by an
//! [`ErrorCode`]. They are reported through the container's
//! [`ErrorReporter`](crate::reporter::ErrorReporter) first and then surface
//! to the caller as [`Error::Container`].

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type alias for container operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for Bento containers
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file operations)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Data corruption detected
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Invalid operation or state
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A condition reported through the container's error reporter
    #[error("{code}: {message}")]
    Container {
        /// Reported condition
        code: ErrorCode,
        /// Message with inserts substituted
        message: String,
    },
}

impl Error {
    /// Get the reported error code, if this error went through a reporter
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::Container { code, .. } => Some(*code),
            _ => None,
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::SerializationError(e.to_string())
    }
}

/// Reportable container conditions
///
/// Each code carries a message template in which `^0` through `^4` are
/// replaced by the report's string inserts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// A touch entry could not be allocated
    NoTouchedEntry,
    /// An I/O buffer could not be acquired
    NoBuffer,
    /// Reading an update stream failed
    UpdateReadFailed,
    /// Writing an update stream failed
    UpdateWriteFailed,
    /// Unknown control byte in an update stream
    BadUpdateControl,
    /// Update refers to an object that does not exist
    MissingObject,
    /// Update refers to a property that does not exist
    MissingProperty,
    /// Update refers to a value type that does not exist
    MissingType,
    /// Generation number out of range
    BadGeneration,
    /// Insert offset beyond the end of the value
    BadInsertOffset,
    /// Byte range outside the value
    BadOffset,
    /// Immediate replacement applied to a stored value
    NotImmediate,
    /// Base type replacement applied to an ordinary value
    NotBaseType,
    /// Property already has a value of this type
    DuplicateType,
    /// Container layer is not writable
    NotWritable,
    /// Operation needs an updating session
    NoSession,
}

impl ErrorCode {
    /// Message template for this code
    pub fn template(self) -> &'static str {
        match self {
            ErrorCode::NoTouchedEntry => "cannot allocate touch entry for ^0 in ^1",
            ErrorCode::NoBuffer => "cannot allocate update I/O buffer in ^0",
            ErrorCode::UpdateReadFailed => "read of update instructions for ^0 failed: ^1",
            ErrorCode::UpdateWriteFailed => "write of update instructions for ^0 failed: ^1",
            ErrorCode::BadUpdateControl => "invalid update control byte ^0 for ^1 in ^2",
            ErrorCode::MissingObject => "cannot find object ^0 for ^1 in ^2",
            ErrorCode::MissingProperty => "cannot find property ^0 of object ^1 in ^2",
            ErrorCode::MissingType => "cannot find value of type ^0 in ^1 of ^2",
            ErrorCode::BadGeneration => "invalid generation ^0 for value ^1 in ^2",
            ErrorCode::BadInsertOffset => "insert offset ^0 beyond end ^1 of value ^2",
            ErrorCode::BadOffset => "range ^0..^1 outside value ^2 of size ^3",
            ErrorCode::NotImmediate => "value ^0 in ^1 is not an immediate",
            ErrorCode::NotBaseType => "value ^0 in ^1 is not a base type array",
            ErrorCode::DuplicateType => "property ^0 already has a value of type ^1",
            ErrorCode::NotWritable => "^0 is not writable in ^1",
            ErrorCode::NoSession => "^0 requires an updating session on ^1",
        }
    }

    /// Substitute inserts into the template
    ///
    /// Placeholders without a matching insert are left as-is.
    pub fn format(self, inserts: &[&str]) -> String {
        let template = self.template();
        let mut out = String::with_capacity(template.len() + 16);
        let mut chars = template.chars().peekable();
        while let Some(c) = chars.next() {
            if c == '^' {
                if let Some(d) = chars.peek().and_then(|d| d.to_digit(10)) {
                    chars.next();
                    match inserts.get(d as usize) {
                        Some(insert) => out.push_str(insert),
                        None => {
                            out.push('^');
                            out.push_str(&d.to_string());
                        }
                    }
                    continue;
                }
            }
            out.push(c);
        }
        out
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_io() {
        let err = Error::IoError(io::Error::new(io::ErrorKind::NotFound, "file not found"));
        let msg = err.to_string();
        assert!(msg.contains("I/O error"));
    }

    #[test]
    fn test_error_display_corruption() {
        let err = Error::Corruption("CRC check failed".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Data corruption"));
        assert!(msg.contains("CRC check failed"));
    }

    #[test]
    fn test_error_display_container() {
        let err = Error::Container {
            code: ErrorCode::MissingObject,
            message: ErrorCode::MissingObject.format(&["#77", "InsertedValue", "updates"]),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("MissingObject"));
        assert!(msg.contains("cannot find object #77 for InsertedValue in updates"));
        assert_eq!(err.code(), Some(ErrorCode::MissingObject));
    }

    #[test]
    fn test_format_leaves_missing_inserts() {
        let msg = ErrorCode::BadOffset.format(&["10", "20"]);
        assert_eq!(msg, "range 10..20 outside value ^2 of size ^3");
    }

    #[test]
    fn test_code_absent_for_plain_errors() {
        let err = Error::InvalidOperation("nope".to_string());
        assert_eq!(err.code(), None);
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::IoError(_)));
    }

    #[test]
    fn test_error_from_bincode() {
        let invalid_data = vec![0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF];
        let result: Result<String> = bincode::deserialize(&invalid_data).map_err(|e| e.into());
        assert!(matches!(result, Err(Error::SerializationError(_))));
    }
}
