//! The driver's view of the cluster: one [`Node`] per known host, each
//! owning a connection pool.
//!
//! Topology discovery is out of scope; the node set is the (resolved)
//! contact points, refreshed only by server events the caller wires in.

pub mod metadata;

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::network::connection_pool::NodeConnectionPool;
use crate::routing::sharding::Sharder;

/// How far away a node is, from the load-balancing policy's perspective.
/// Governs the pool size the node gets; `Ignored` drains its pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeDistance {
    Local,
    Remote,
    Ignored,
}

/// One known host and its connection pool.
pub struct Node {
    pub address: SocketAddr,
    pub(crate) pool: NodeConnectionPool,
}

/// A borrowed reference to a node, as produced by query plans.
pub type NodeRef<'a> = &'a Arc<Node>;

impl Node {
    pub(crate) fn new(address: SocketAddr, pool: NodeConnectionPool) -> Self {
        Node { address, pool }
    }

    /// The node's sharder, when it is shard-aware (Scylla).
    pub fn sharder(&self) -> Option<Sharder> {
        self.pool.sharder()
    }

    pub fn is_connected(&self) -> bool {
        self.pool.is_connected()
    }

    /// Informs the node's pool of a distance change decided by the
    /// load-balancing policy. `Ignored` drains the pool gracefully;
    /// anything else (re)starts filling it.
    pub fn update_distance(&self, distance: NodeDistance) {
        self.pool.update_distance(distance);
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        std::ptr::eq(self, other)
    }
}

impl Eq for Node {}

/// An immutable snapshot of the known nodes, handed to load-balancing
/// policies when computing query plans.
#[derive(Debug, Default)]
pub struct ClusterState {
    pub(crate) nodes: Vec<Arc<Node>>,
}

impl ClusterState {
    pub fn get_nodes_info(&self) -> &[Arc<Node>] {
        &self.nodes
    }
}
