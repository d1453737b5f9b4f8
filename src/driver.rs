//! Capability traits a database backend implements, and the registry that
//! maps driver names to implementations.

use async_trait::async_trait;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{DbError, Result};
use crate::executor::{RowValues, Value};

/// A database backend.
#[async_trait]
pub trait Driver: Send + Sync {
    /// Name the driver is registered under by default.
    fn name(&self) -> &str;

    /// Validate `dsn` and return a factory for connections to it.
    ///
    /// Configuration errors surface here, before any socket is opened.
    fn connector(&self, dsn: &str) -> Result<Arc<dyn Connector>>;

    /// Open a single connection.
    async fn open(&self, dsn: &str) -> Result<Box<dyn Conn>> {
        self.connector(dsn)?.connect().await
    }
}

/// Creates connections to one configured database.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn Conn>>;
}

/// One exclusively owned database session.
#[async_trait]
pub trait Conn: Send {
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Box<dyn Rows>>;

    /// Run a statement and return the number of affected rows.
    async fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64>;

    async fn begin(&mut self) -> Result<()>;
    async fn commit(&mut self) -> Result<()>;
    async fn rollback(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;

    /// Whether the session can be handed to another caller.
    fn is_valid(&self) -> bool;
}

/// Forward-only result cursor produced by a driver.
pub trait Rows: Send {
    fn columns(&self) -> &[String];

    fn next_row(&mut self) -> Option<RowValues>;
}

/// Driver lookup by name.
#[derive(Clone, Default)]
pub struct Registry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in driver.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        let pg: Arc<dyn Driver> = Arc::new(crate::pg::PgDriver);
        registry.register(pg.name().to_string(), pg);
        registry
    }

    /// Add or replace a driver.
    pub fn register(&mut self, name: impl Into<String>, driver: Arc<dyn Driver>) -> &mut Self {
        self.drivers.insert(name.into(), driver);
        self
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::UnknownDriver(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.drivers.keys().map(String::as_str)
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("drivers", &self.drivers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullDriver;

    impl Driver for NullDriver {
        fn name(&self) -> &str {
            "null"
        }

        fn connector(&self, dsn: &str) -> Result<Arc<dyn Connector>> {
            Err(DbError::ConfigError(format!("cannot connect to {}", dsn)))
        }
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = Registry::with_defaults();
        assert!(registry.get("postgres").is_ok());
        assert!(matches!(
            registry.get("mysql"),
            Err(DbError::UnknownDriver(name)) if name == "mysql"
        ));

        registry.register("null", Arc::new(NullDriver));
        let mut names: Vec<_> = registry.names().collect();
        names.sort_unstable();
        assert_eq!(names, ["null", "postgres"]);
    }

    #[tokio::test]
    async fn test_open_surfaces_config_error() {
        let driver = NullDriver;
        assert!(matches!(
            driver.open("nowhere").await,
            Err(DbError::ConfigError(_))
        ));
    }
}
