//! Load balancing: producing query plans, i.e. ordered streams of
//! `(node, shard)` targets for a request.

use std::sync::atomic::{AtomicUsize, Ordering};

use rand::Rng as _;
use tracing::error;

use crate::cluster::{ClusterState, NodeRef};
use crate::routing::sharding::Shard;
use crate::routing::Token;
use typhon_cql::{Consistency, SerialConsistency};

/// Routing information of a single request, consulted by policies.
#[derive(Debug, Default, Clone)]
pub struct RoutingInfo<'a> {
    pub consistency: Consistency,
    pub serial_consistency: Option<SerialConsistency>,
    /// The composed routing key, when derivable from the statement.
    pub routing_key: Option<&'a [u8]>,
    /// The token the routing key hashes to.
    pub token: Option<Token>,
    pub keyspace: Option<&'a str>,
    /// Lightweight transactions prefer a deterministic replica order to
    /// cut down on Paxos conflicts.
    pub is_confirmed_lwt: bool,
}

/// The rest of a query plan after the picked target.
pub type FallbackPlan<'a> =
    Box<dyn Iterator<Item = (NodeRef<'a>, Option<Shard>)> + Send + Sync + 'a>;

/// Produces query plans: an eagerly computed first target (the happy
/// path allocates nothing more) and a lazy remainder.
pub trait LoadBalancingPolicy: std::fmt::Debug + Send + Sync {
    fn pick<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<(NodeRef<'a>, Option<Shard>)>;

    fn fallback<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a>;

    fn name(&self) -> String;
}

enum PlanState<'a> {
    Created,
    PickedNone,
    Picked((NodeRef<'a>, Option<Shard>)),
    Fallback {
        iter: FallbackPlan<'a>,
        target_to_filter_out: (NodeRef<'a>, Option<Shard>),
    },
}

/// The ordered list of targets for one request. Implements
/// `Iterator<Item = (NodeRef, Shard)>`; a policy returning no shard gets
/// a random one, so shard-aware pools always receive a concrete hint.
pub struct Plan<'a> {
    policy: &'a dyn LoadBalancingPolicy,
    routing_info: &'a RoutingInfo<'a>,
    cluster: &'a ClusterState,
    state: PlanState<'a>,
}

impl<'a> Plan<'a> {
    pub fn new(
        policy: &'a dyn LoadBalancingPolicy,
        routing_info: &'a RoutingInfo<'a>,
        cluster: &'a ClusterState,
    ) -> Self {
        Plan {
            policy,
            routing_info,
            cluster,
            state: PlanState::Created,
        }
    }

    fn with_random_shard(
        (node, shard): (NodeRef<'a>, Option<Shard>),
    ) -> (NodeRef<'a>, Shard) {
        let shard = shard.unwrap_or_else(|| {
            node.sharder()
                .map(|sharder| rand::rng().random_range(0..sharder.nr_shards.get() as u32))
                .unwrap_or(0)
        });
        (node, shard)
    }
}

impl<'a> Iterator for Plan<'a> {
    type Item = (NodeRef<'a>, Shard);

    fn next(&mut self) -> Option<Self::Item> {
        match &mut self.state {
            PlanState::Created => {
                if let Some(picked) = self.policy.pick(self.routing_info, self.cluster) {
                    self.state = PlanState::Picked(picked);
                    Some(Self::with_random_shard(picked))
                } else {
                    // The policy was unable to pick eagerly; fall back to
                    // the full plan right away.
                    error!(
                        "Load balancing policy {} failed to pick a target",
                        self.policy.name()
                    );
                    let mut iter = self.policy.fallback(self.routing_info, self.cluster);
                    let first = iter.next();
                    match first {
                        Some(target) => {
                            self.state = PlanState::Fallback {
                                iter,
                                target_to_filter_out: target,
                            };
                            Some(Self::with_random_shard(target))
                        }
                        None => {
                            self.state = PlanState::PickedNone;
                            None
                        }
                    }
                }
            }
            PlanState::Picked(picked) => {
                let picked = *picked;
                self.state = PlanState::Fallback {
                    iter: self.policy.fallback(self.routing_info, self.cluster),
                    target_to_filter_out: picked,
                };
                self.next()
            }
            PlanState::Fallback {
                iter,
                target_to_filter_out,
            } => {
                for target in iter.by_ref() {
                    if target.0.address == target_to_filter_out.0.address
                        && target.1 == target_to_filter_out.1
                    {
                        continue;
                    }
                    return Some(Self::with_random_shard(target));
                }
                None
            }
            PlanState::PickedNone => None,
        }
    }
}

/// The default policy: round-robin over known nodes, with the shard
/// derived from the request token on shard-aware nodes.
///
/// Replica awareness requires topology metadata, which is an external
/// collaborator; this policy is deliberately oblivious to it.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    index: AtomicUsize,
}

impl RoundRobinPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard_for<'a>(node: NodeRef<'a>, request: &RoutingInfo) -> Option<Shard> {
        let token = request.token?;
        let sharder = node.sharder()?;
        Some(sharder.shard_of(token))
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn pick<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<(NodeRef<'a>, Option<Shard>)> {
        let nodes = cluster.get_nodes_info();
        if nodes.is_empty() {
            return None;
        }
        let start = self.index.fetch_add(1, Ordering::Relaxed);

        // Prefer a connected node for the first target.
        let node = nodes
            .iter()
            .cycle()
            .skip(start % nodes.len())
            .take(nodes.len())
            .find(|node| node.is_connected())
            .unwrap_or(&nodes[start % nodes.len()]);

        Some((node, Self::shard_for(node, request)))
    }

    fn fallback<'a>(
        &'a self,
        request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> FallbackPlan<'a> {
        let nodes = cluster.get_nodes_info();
        let start = self.index.load(Ordering::Relaxed);
        let len = nodes.len();
        Box::new(
            nodes
                .iter()
                .cycle()
                .skip(if len == 0 { 0 } else { start % len })
                .take(len)
                .map(move |node| (node, Self::shard_for(node, request))),
        )
    }

    fn name(&self) -> String {
        "RoundRobinPolicy".to_owned()
    }
}

/// A policy that always targets one specific node, used by the reprepare
/// coordinator and single-host retries.
#[derive(Debug)]
pub struct SingleTargetPolicy {
    pub address: std::net::SocketAddr,
    pub shard: Option<Shard>,
}

impl LoadBalancingPolicy for SingleTargetPolicy {
    fn pick<'a>(
        &'a self,
        _request: &'a RoutingInfo,
        cluster: &'a ClusterState,
    ) -> Option<(NodeRef<'a>, Option<Shard>)> {
        cluster
            .get_nodes_info()
            .iter()
            .find(|node| node.address == self.address)
            .map(|node| (node, self.shard))
    }

    fn fallback<'a>(
        &'a self,
        _request: &'a RoutingInfo,
        _cluster: &'a ClusterState,
    ) -> FallbackPlan<'a> {
        Box::new(std::iter::empty())
    }

    fn name(&self) -> String {
        format!("SingleTargetPolicy({})", self.address)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::sync::Arc;

    use crate::cluster::Node;
    use crate::network::connection_pool::{NodeConnectionPool, PoolConfig};

    // The pools never connect anywhere in these tests; the nodes only
    // serve as plan targets.
    fn make_node(port: u16) -> Arc<Node> {
        let address = SocketAddr::from(([127, 0, 0, 1], port));
        let pool = NodeConnectionPool::new(address, PoolConfig::default(), None);
        Arc::new(Node::new(address, pool))
    }

    fn make_cluster(ports: &[u16]) -> ClusterState {
        ClusterState {
            nodes: ports.iter().map(|port| make_node(*port)).collect(),
        }
    }

    fn addresses_of(cluster: &ClusterState) -> Vec<SocketAddr> {
        cluster
            .get_nodes_info()
            .iter()
            .map(|node| node.address)
            .collect()
    }

    /// Picks nothing; the whole plan must come from the fallback.
    #[derive(Debug)]
    struct PickNonePolicy;

    impl LoadBalancingPolicy for PickNonePolicy {
        fn pick<'a>(
            &'a self,
            _request: &'a RoutingInfo,
            _cluster: &'a ClusterState,
        ) -> Option<(NodeRef<'a>, Option<Shard>)> {
            None
        }

        fn fallback<'a>(
            &'a self,
            _request: &'a RoutingInfo,
            cluster: &'a ClusterState,
        ) -> FallbackPlan<'a> {
            Box::new(
                cluster
                    .get_nodes_info()
                    .iter()
                    .map(|node| (node, Some(0))),
            )
        }

        fn name(&self) -> String {
            "PickNonePolicy".to_owned()
        }
    }

    /// Always picks the first node; the fallback repeats it.
    #[derive(Debug)]
    struct FirstTargetPolicy;

    impl LoadBalancingPolicy for FirstTargetPolicy {
        fn pick<'a>(
            &'a self,
            _request: &'a RoutingInfo,
            cluster: &'a ClusterState,
        ) -> Option<(NodeRef<'a>, Option<Shard>)> {
            cluster.get_nodes_info().first().map(|node| (node, Some(0)))
        }

        fn fallback<'a>(
            &'a self,
            _request: &'a RoutingInfo,
            cluster: &'a ClusterState,
        ) -> FallbackPlan<'a> {
            Box::new(
                cluster
                    .get_nodes_info()
                    .iter()
                    .map(|node| (node, Some(0))),
            )
        }

        fn name(&self) -> String {
            "FirstTargetPolicy".to_owned()
        }
    }

    #[tokio::test]
    async fn plan_falls_back_when_pick_returns_none() {
        let cluster = make_cluster(&[1101, 1102, 1103]);
        let routing_info = RoutingInfo::default();

        let policy = PickNonePolicy;
        let plan = Plan::new(&policy, &routing_info, &cluster);
        let planned: Vec<_> = plan.map(|(node, _shard)| node.address).collect();

        // Every fallback target is still produced even though the eager
        // pick yielded nothing.
        assert_eq!(planned, addresses_of(&cluster));
    }

    #[tokio::test]
    async fn plan_does_not_repeat_the_picked_target() {
        let cluster = make_cluster(&[1201, 1202, 1203]);
        let routing_info = RoutingInfo::default();

        let policy = FirstTargetPolicy;
        let plan = Plan::new(&policy, &routing_info, &cluster);
        let planned: Vec<_> = plan.map(|(node, _shard)| node.address).collect();

        // The picked target opens the plan and is filtered out of the
        // fallback, so it appears exactly once.
        assert_eq!(planned, addresses_of(&cluster));
    }

    #[tokio::test]
    async fn empty_cluster_produces_an_empty_plan() {
        let cluster = ClusterState { nodes: Vec::new() };
        let routing_info = RoutingInfo::default();

        let policy = PickNonePolicy;
        let mut plan = Plan::new(&policy, &routing_info, &cluster);
        assert!(plan.next().is_none());
    }
}
