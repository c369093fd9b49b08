//! Errors surfaced by the access layer
use thiserror::Error;

use crate::driver::DriverError;

/// The kinds of errors the layer distinguishes
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ErrorContent {
    /// An error reported by the wire driver
    #[error("driver error{}: {message}", .code.map(|c| format!(" {c}")).unwrap_or_default())]
    Driver {
        /// 2-byte mysql error code, if the driver had one
        code: Option<u16>,
        /// Error message
        message: String,
    },
    /// The caller supplied cancel signal fired before the operation finished
    #[error("operation canceled")]
    Canceled,
    /// Result metadata was read before the stream became ready
    #[error("result metadata not ready")]
    NotReady,
    /// A surface call was made on a closed object
    #[error("{0} is closed")]
    Closed(&'static str),
    /// The object was driven in a way its state machine does not allow
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// An isolation level token outside the supported set
    #[error("unsupported isolation level {0:?}")]
    UnsupportedIsolation(String),
    /// A row producing statement was run through an execute-only surface
    #[error("statement returned rows, expected update result")]
    UnexpectedRows,
    /// An update statement was run through a row-reading surface
    #[error("statement returned update result, expected rows")]
    ExpectedRows,
}

/// Error returned by the access layer
///
/// This type is a Box around [ErrorContent], to make sure
/// that the error type is as small as possible
#[derive(Clone)]
pub struct Error(Box<ErrorContent>);

const _: () = {
    assert!(size_of::<Error>() == size_of::<usize>());
};

impl Error {
    /// Return the content of the error
    pub fn content(&self) -> &ErrorContent {
        &self.0
    }

    /// True if this is the canceled error
    pub fn is_canceled(&self) -> bool {
        matches!(*self.0, ErrorContent::Canceled)
    }
}

impl std::ops::Deref for Error {
    type Target = ErrorContent;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl<E: Into<ErrorContent>> From<E> for Error {
    fn from(value: E) -> Self {
        Error(Box::new(value.into()))
    }
}

impl From<DriverError> for ErrorContent {
    fn from(value: DriverError) -> Self {
        ErrorContent::Driver {
            code: value.code,
            message: value.message,
        }
    }
}

impl std::fmt::Debug for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(&self.0, f)
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.0, f)
    }
}

impl std::error::Error for Error {}

/// Result type used throughout the layer
pub type Result<T> = std::result::Result<T, Error>;
