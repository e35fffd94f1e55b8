//! `typhon-cql` implements the CQL binary protocol: framing, the request
//! and response messages the driver exchanges with the server, and a
//! descriptor-driven codec between [`value::CqlValue`]s and their wire
//! form, for protocol versions 1 through 5.
//!
//! This crate holds everything that can be reasoned about with a byte
//! buffer and a protocol version; sockets, pools and sessions live in the
//! `typhon` crate.

pub mod deserialize;
pub mod frame;
pub mod serialize;
pub mod value;

pub use frame::protocol::ProtocolVersion;
pub use frame::types::{Consistency, SerialConsistency};
pub use frame::Compression;
