//! Async, shard-aware driver for Cassandra-compatible databases (Apache
//! Cassandra and ScyllaDB), speaking native protocol versions 1 through
//! 5 over TCP with optional TLS.
//!
//! The building blocks:
//! - [`client::Session`] / [`client::SessionBuilder`] — the entry point:
//!   connection pools, the request pipeline and the prepared-statement
//!   cache;
//! - [`statement`] — unprepared, prepared and batch statements with
//!   their per-statement options;
//! - [`client::QueryPager`] — lazy iteration over paged result sets;
//! - [`policies`] — load balancing, retry, reconnection and speculative
//!   execution;
//! - [`typhon_cql`] (re-exported as [`cql`]) — the protocol layer:
//!   frames, messages and the CQL type codec.
//!
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use typhon::client::SessionBuilder;
//! use typhon::statement::Statement;
//!
//! let session = SessionBuilder::new()
//!     .known_node("127.0.0.1:9042")
//!     .build()
//!     .await?;
//!
//! let statement = Statement::new("SELECT name, year FROM library.books");
//! let result = session.query_unpaged(&statement).await?;
//! for row in result.rows() {
//!     println!("{:?}", row);
//! }
//! # Ok(())
//! # }
//! ```

pub mod authentication;
pub mod client;
pub mod cluster;
pub mod errors;
pub mod network;
pub mod observability;
pub mod policies;
pub mod response;
pub mod routing;
pub mod statement;

#[cfg(test)]
pub(crate) mod test_utils;

pub use typhon_cql as cql;

pub use client::{Session, SessionBuilder};
pub use response::QueryResult;
pub use typhon_cql::{Compression, Consistency, ProtocolVersion, SerialConsistency};
