//! PostgreSQL implementation of the driver capability traits.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::connection::{ConnectionSpec, PgConnection};
use super::statement::{QueryResult, RowDescription};
use super::types;
use crate::driver::{Conn, Connector, Driver, Rows};
use crate::error::Result;
use crate::executor::{RowValues, Value};

/// Driver for `postgresql://` connection strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct PgDriver;

impl Driver for PgDriver {
    fn name(&self) -> &str {
        "postgres"
    }

    fn connector(&self, dsn: &str) -> Result<Arc<dyn Connector>> {
        let spec = ConnectionSpec::parse(dsn)?;
        Ok(Arc::new(PgConnector { spec }))
    }
}

/// Opens authenticated TCP connections for one `ConnectionSpec`.
#[derive(Debug, Clone)]
pub struct PgConnector {
    spec: ConnectionSpec,
}

impl PgConnector {
    pub fn new(spec: ConnectionSpec) -> Self {
        Self { spec }
    }

    pub fn spec(&self) -> &ConnectionSpec {
        &self.spec
    }
}

#[async_trait]
impl Connector for PgConnector {
    async fn connect(&self) -> Result<Box<dyn Conn>> {
        let conn = PgConnection::connect(&self.spec).await?;
        Ok(Box::new(conn))
    }
}

#[async_trait]
impl<S> Conn for PgConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    async fn query(&mut self, sql: &str, params: &[Value]) -> Result<Box<dyn Rows>> {
        let result = PgConnection::query(self, sql, params).await?;
        Ok(Box::new(PgRows::new(result)))
    }

    async fn exec(&mut self, sql: &str, params: &[Value]) -> Result<u64> {
        Ok(PgConnection::execute(self, sql, params).await?)
    }

    async fn begin(&mut self) -> Result<()> {
        Ok(PgConnection::begin(self).await?)
    }

    async fn commit(&mut self) -> Result<()> {
        Ok(PgConnection::commit(self).await?)
    }

    async fn rollback(&mut self) -> Result<()> {
        Ok(PgConnection::rollback(self).await?)
    }

    async fn close(&mut self) -> Result<()> {
        Ok(PgConnection::close(self).await?)
    }

    fn is_valid(&self) -> bool {
        self.is_reusable()
    }
}

/// Cursor over a buffered PostgreSQL result.
#[derive(Debug)]
pub struct PgRows {
    result: QueryResult,
}

impl PgRows {
    pub fn new(result: QueryResult) -> Self {
        Self { result }
    }

    pub fn description(&self) -> &RowDescription {
        &self.result.description
    }

    pub fn rows_affected(&self) -> u64 {
        self.result.rows_affected()
    }
}

impl Rows for PgRows {
    fn columns(&self) -> &[String] {
        &self.result.description.names
    }

    fn next_row(&mut self) -> Option<RowValues> {
        let raw = self.result.rows.pop_front()?;
        let oids = &self.result.description.type_oids;
        Some(
            raw.iter()
                .zip(oids)
                .map(|(value, oid)| types::decode_text(*oid, value.as_deref()))
                .collect(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DbError;
    use crate::pg::types::Oid;
    use bytes::Bytes;

    #[test]
    fn test_connector_rejects_bad_dsn() {
        let err = PgDriver.connector("postgresql://u:p@db.internal:5432/app").err();
        assert!(matches!(err, Some(DbError::ConfigError(_))));
    }

    #[test]
    fn test_pg_rows_decodes_by_type() {
        let mut result = QueryResult {
            description: RowDescription {
                names: vec!["id".to_string(), "title".to_string(), "done".to_string()],
                type_oids: vec![Oid::INT8, Oid::TEXT, Oid::BOOL],
            },
            command_tag: "SELECT 1".to_string(),
            ..Default::default()
        };
        result.rows.push_back(vec![
            Some(Bytes::from_static(b"7")),
            None,
            Some(Bytes::from_static(b"f")),
        ]);

        let mut rows = PgRows::new(result);
        assert_eq!(rows.columns(), ["id", "title", "done"]);
        assert_eq!(rows.rows_affected(), 1);

        let row = rows.next_row().unwrap();
        assert_eq!(
            row.as_slice(),
            [Value::Int(7), Value::Null, Value::Bool(false)]
        );
        assert!(rows.next_row().is_none());
    }
}
