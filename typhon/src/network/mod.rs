//! The networking layer: single connections and per-node pools.

pub(crate) mod connection;
pub(crate) mod connection_pool;
#[cfg(feature = "rustls-023")]
pub(crate) mod tls;

pub use connection_pool::PoolSize;
