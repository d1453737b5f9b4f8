//! Error types for the PostgreSQL protocol implementation.

use std::fmt;
use std::io;

use crate::error::DbError;

/// Result type for PostgreSQL operations.
pub type PgResult<T> = Result<T, PgError>;

/// Errors that can occur during PostgreSQL operations.
#[derive(Debug)]
pub enum PgError {
    /// I/O error during communication.
    Io(io::Error),

    /// Malformed framing, unexpected message or missing terminal message.
    Protocol(String),

    /// Authentication failed.
    Auth(String),

    /// Server returned an error.
    Server {
        severity: String,
        code: String,
        message: String,
        detail: Option<String>,
        hint: Option<String>,
    },

    /// Malformed connection string or a request that cannot be framed.
    Config(String),

    /// Connection is closed or was invalidated by an earlier failure.
    ConnectionClosed,
}

impl PgError {
    /// Whether the connection that produced this error must not be reused.
    ///
    /// Server errors leave the session protocol-ready, everything on the
    /// transport or framing level does not.
    pub fn invalidates_connection(&self) -> bool {
        matches!(
            self,
            PgError::Io(_) | PgError::Protocol(_) | PgError::ConnectionClosed
        )
    }

    /// SQLSTATE code of a server error.
    pub fn code(&self) -> Option<&str> {
        match self {
            PgError::Server { code, .. } => Some(code),
            _ => None,
        }
    }
}

impl fmt::Display for PgError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PgError::Io(e) => write!(f, "I/O error: {}", e),
            PgError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
            PgError::Auth(msg) => write!(f, "Authentication failed: {}", msg),
            PgError::Server {
                severity,
                code,
                message,
                detail,
                hint,
            } => {
                write!(f, "{}: {} ({})", severity, message, code)?;
                if let Some(d) = detail {
                    write!(f, "\nDetail: {}", d)?;
                }
                if let Some(h) = hint {
                    write!(f, "\nHint: {}", h)?;
                }
                Ok(())
            }
            PgError::Config(msg) => write!(f, "Configuration error: {}", msg),
            PgError::ConnectionClosed => write!(f, "Connection is closed"),
        }
    }
}

impl std::error::Error for PgError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PgError::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for PgError {
    fn from(e: io::Error) -> Self {
        PgError::Io(e)
    }
}

impl From<PgError> for DbError {
    fn from(e: PgError) -> Self {
        match e {
            PgError::Config(msg) => DbError::ConfigError(msg),
            other => DbError::driver(other),
        }
    }
}
