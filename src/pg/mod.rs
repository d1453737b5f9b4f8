//! PostgreSQL wire protocol driver.
//!
//! Talks protocol 3.0 directly over TCP:
//! - Text-format parameters and results
//! - SCRAM-SHA-256 authentication
//! - One statement in flight per connection
//!
//! Architecture:
//! - `protocol`: Low-level wire protocol encoding/decoding and the receive backlog
//! - `scram`: SCRAM-SHA-256 client session
//! - `connection`: Connection string parsing, handshake and statement round trips
//! - `statement`: Request batches and response assembly
//! - `types`: Type OIDs and text-format conversion
//! - `driver`: Plugs the connection into the generic driver traits

pub mod connection;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod scram;
pub mod statement;
pub mod types;


pub use connection::{ConnectionSpec, ConnectionState, PgConnection};
pub use driver::{PgConnector, PgDriver, PgRows};
pub use error::{PgError, PgResult};
pub use statement::QueryResult;
pub use types::Oid;
