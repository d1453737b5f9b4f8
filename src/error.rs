//! Error types for the driver-neutral database facade.
//!
//! Backend errors travel inside `DriverError` and can be recovered with
//! [`DbError::driver_error`].

use thiserror::Error;

#[derive(Error, Debug)]
pub enum DbError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("No driver available for: {0}")]
    UnknownDriver(String),

    #[error("No connection available")]
    PoolExhausted,

    #[error("Pool is closed")]
    PoolClosed,

    #[error("Type conversion error: {0}")]
    TypeError(String),

    #[error("Transaction error: {0}")]
    TransactionError(String),

    #[error(transparent)]
    DriverError(Box<dyn std::error::Error + Send + Sync + 'static>),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl DbError {
    /// Wrap a backend-specific error.
    pub fn driver<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        DbError::DriverError(Box::new(err))
    }

    /// Borrow the backend error if this is a `DriverError` of type `E`.
    pub fn driver_error<E>(&self) -> Option<&E>
    where
        E: std::error::Error + 'static,
    {
        match self {
            DbError::DriverError(inner) => inner.downcast_ref::<E>(),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, DbError>;
