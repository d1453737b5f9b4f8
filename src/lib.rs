//! pgkit - a pooled PostgreSQL client built directly on the wire protocol.
//!
//! ```no_run
//! use pgkit::{Db, DbConfig, Registry, Value};
//!
//! # async fn run() -> pgkit::Result<()> {
//! let registry = Registry::with_defaults();
//! let db = Db::open(&registry, DbConfig::from_env()?)?;
//!
//! db.exec("INSERT INTO todos (title) VALUES ($1)", &[Value::from("write docs")])
//!     .await?;
//! for row in db.query("SELECT id, title FROM todos", &[]).await? {
//!     let id: i64 = row.get("id")?;
//!     let title: String = row.get("title")?;
//!     println!("{id}: {title}");
//! }
//! db.close().await;
//! # Ok(())
//! # }
//! ```

pub mod crypto;
pub mod db;
pub mod driver;
pub mod error;
pub mod executor;
pub mod pg;
pub mod pool;

pub use db::{Db, DbConfig, Transaction};
pub use driver::Registry;
pub use error::{DbError, Result};
pub use executor::{FromValue, Row, Rows, Value};
pub use pool::{ConnectionFactory, Pool, PooledConnection};
