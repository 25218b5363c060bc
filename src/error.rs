use std::error::Error as StdError;
use std::fmt;

use thiserror::Error;

pub type BoxDynError = Box<dyn StdError + Send + Sync + 'static>;

/// Which kind of handle an operation was attempted on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleKind {
    Database,
    Statement,
}

impl fmt::Display for HandleKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            HandleKind::Database => "Database",
            HandleKind::Statement => "Statement",
        })
    }
}

/// Error type for rsdbi operations.
///
/// Backends translate their native errors into one of the portable kinds
/// below; callers never see a backend-native error type.
#[derive(Debug, Error)]
pub enum Error {
    /// The API was used incorrectly: empty SQL, a closed handle, a bad
    /// argument count to a driver function, and so on.
    #[error("interface error: {0}")]
    Interface(String),

    /// A named capability is unavailable on this backend or server version.
    #[error("not supported: {0}")]
    NotSupported(String),

    /// The backend rejected the statement.
    #[error("programming error: {0}")]
    Programming(String),

    #[error("database error: {0}")]
    Database(String),

    /// The connection failed or the server became unavailable.
    #[error("operational error: {0}")]
    Operational(String),

    /// Raised from inside a driver-specific function. Passed through as-is.
    #[error(transparent)]
    Driver(BoxDynError),
}

/// Portable error category, for callers that branch on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Interface,
    NotSupported,
    Programming,
    Database,
    Operational,
    Driver,
}

impl ErrorKind {
    /// True for errors reported by the backend itself.
    pub fn is_database(self) -> bool {
        matches!(
            self,
            ErrorKind::Programming | ErrorKind::Database | ErrorKind::Operational
        )
    }
}

impl Error {
    pub fn interface(msg: impl Into<String>) -> Self {
        Error::Interface(msg.into())
    }

    pub fn not_supported(msg: impl Into<String>) -> Self {
        Error::NotSupported(msg.into())
    }

    pub fn closed(kind: HandleKind) -> Self {
        Error::Interface(format!("{} handle was already closed", kind))
    }

    pub fn driver(err: impl Into<BoxDynError>) -> Self {
        Error::Driver(err.into())
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Interface(_) => ErrorKind::Interface,
            Error::NotSupported(_) => ErrorKind::NotSupported,
            Error::Programming(_) => ErrorKind::Programming,
            Error::Database(_) => ErrorKind::Database,
            Error::Operational(_) => ErrorKind::Operational,
            Error::Driver(_) => ErrorKind::Driver,
        }
    }
}

/// Result type alias for rsdbi operations
pub type Result<T> = std::result::Result<T, Error>;
