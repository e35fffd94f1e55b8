//! The per-node connection pool.
//!
//! Borrowers read a copy-on-write snapshot published through an
//! [`ArcSwap`], so the borrow path takes no locks. A background
//! `PoolRefiller` task owns the real connection vectors: it fills the
//! pool to its target size, replaces broken connections on the schedule
//! produced by the reconnection policy, grows the pool when borrowers
//! report congestion, and drains it when the node's distance becomes
//! `Ignored`.

use std::num::NonZeroUsize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use futures::future::RemoteHandle;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use rand::Rng as _;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::connection::{
    open_connection, Connection, ErrorReceiver, HostConnectionConfig, VerifiedKeyspaceName,
};
use crate::cluster::NodeDistance;
use crate::errors::{
    ConnectionError, ConnectionPoolError, UseKeyspaceError,
};
use crate::policies::reconnection::{ReconnectionPolicy, ReconnectionSchedule};
use crate::routing::sharding::{Shard, Sharder};
use crate::routing::Token;

/// How long a growth request is ignored after a resize, so a burst of
/// congested borrows triggers one resize, not many.
const RESIZE_COOLDOWN: Duration = Duration::from_secs(2);

/// How many candidates the global fallback of the borrow algorithm
/// inspects; bounds the cost of a borrow on large pools.
const BORROW_SAMPLE_SIZE: usize = 8;

/// The cap on how long a drained pool keeps its connections alive for
/// requests already in flight.
const MAX_DRAIN_DELAY: Duration = Duration::from_secs(300);

/// Target number of connections to one node.
#[derive(Debug, Clone, Copy)]
pub enum PoolSize {
    /// A fixed total, spread over shards on shard-aware nodes.
    PerHost(NonZeroUsize),
    /// A per-shard count; non-sharded nodes treat it as per-host.
    PerShard(NonZeroUsize),
}

impl Default for PoolSize {
    fn default() -> Self {
        PoolSize::PerShard(NonZeroUsize::new(1).unwrap())
    }
}

#[derive(Clone)]
pub(crate) struct PoolConfig {
    pub(crate) connection_config: HostConnectionConfig,
    /// Core pool size, maintained eagerly.
    pub(crate) pool_size: PoolSize,
    /// Hard cap the pool may grow to under load.
    pub(crate) max_pool_size: usize,
    /// Per-connection in-flight cap; borrowing past it is `PoolBusy`.
    pub(crate) max_requests_per_connection: usize,
    /// In-flight level at which a borrow requests pool growth.
    pub(crate) max_inflight_threshold: usize,
    pub(crate) can_use_shard_aware_port: bool,
    pub(crate) reconnection_policy: Arc<dyn ReconnectionPolicy>,
    /// Drain delay on distance change, typically twice the read timeout.
    pub(crate) drain_delay: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connection_config: HostConnectionConfig::default(),
            pool_size: PoolSize::default(),
            max_pool_size: 16,
            max_requests_per_connection: 2048,
            max_inflight_threshold: 1024,
            can_use_shard_aware_port: true,
            reconnection_policy: Arc::new(
                crate::policies::reconnection::ExponentialReconnectionPolicy::default(),
            ),
            drain_delay: Duration::from_secs(10),
        }
    }
}

enum MaybePoolConnections {
    Initializing,
    Broken(ConnectionError),
    Ready(PoolConnections),
    /// Distance became `Ignored` or the pool is shutting down; nothing
    /// is borrowable.
    Draining,
}

enum PoolConnections {
    NotSharded(Vec<Arc<Connection>>),
    Sharded {
        sharder: Sharder,
        connections: Vec<Vec<Arc<Connection>>>,
    },
}

impl PoolConnections {
    fn iter(&self) -> impl Iterator<Item = &Arc<Connection>> {
        // Both arms go through the same helper so the opaque return
        // types unify.
        match self {
            PoolConnections::NotSharded(conns) => flatten_shards(std::slice::from_ref(conns)),
            PoolConnections::Sharded { connections, .. } => flatten_shards(connections),
        }
    }

    fn len(&self) -> usize {
        self.iter().count()
    }
}

fn flatten_shards(v: &[Vec<Arc<Connection>>]) -> impl Iterator<Item = &Arc<Connection>> {
    v.iter().flatten()
}

/// The handle through which requests borrow connections to one node.
pub(crate) struct NodeConnectionPool {
    endpoint: SocketAddr,
    conns: Arc<ArcSwap<MaybePoolConnections>>,
    max_requests_per_connection: usize,
    max_inflight_threshold: usize,
    /// Round-robin cursor of the borrow fallback sampling.
    borrow_cursor: AtomicUsize,
    excess_demand_sender: mpsc::UnboundedSender<()>,
    use_keyspace_request_sender: mpsc::Sender<UseKeyspaceRequest>,
    distance_sender: mpsc::UnboundedSender<NodeDistance>,
    pool_updated_notify: Arc<Notify>,
    connectivity_receiver: watch::Receiver<bool>,
    _refiller_handle: RemoteHandle<()>,
}

struct UseKeyspaceRequest {
    keyspace_name: VerifiedKeyspaceName,
    response_sender: oneshot::Sender<Result<(), UseKeyspaceError>>,
}

impl NodeConnectionPool {
    pub(crate) fn new(
        endpoint: SocketAddr,
        config: PoolConfig,
        current_keyspace: Option<VerifiedKeyspaceName>,
    ) -> Self {
        let conns = Arc::new(ArcSwap::from_pointee(MaybePoolConnections::Initializing));
        let pool_updated_notify = Arc::new(Notify::new());
        let (excess_demand_sender, excess_demand_receiver) = mpsc::unbounded_channel();
        let (use_keyspace_request_sender, use_keyspace_request_receiver) = mpsc::channel(1);
        let (distance_sender, distance_receiver) = mpsc::unbounded_channel();
        let (connectivity_sender, connectivity_receiver) = watch::channel(false);

        let max_requests_per_connection = config.max_requests_per_connection;
        let max_inflight_threshold = config.max_inflight_threshold;

        let refiller = PoolRefiller {
            endpoint,
            config,
            conns: Vec::new(),
            sharder: None,
            shard_aware_port: None,
            current_keyspace,
            shared_conns: conns.clone(),
            pool_updated_notify: pool_updated_notify.clone(),
            connectivity_sender,
            last_error: None,
            last_resize: None,
            excess_demand: false,
            distance: NodeDistance::Local,
            draining_conns: Vec::new(),
        };

        let (fut, handle) = refiller
            .run(
                excess_demand_receiver,
                use_keyspace_request_receiver,
                distance_receiver,
            )
            .remote_handle();
        tokio::spawn(fut);

        Self {
            endpoint,
            conns,
            max_requests_per_connection,
            max_inflight_threshold,
            borrow_cursor: AtomicUsize::new(0),
            excess_demand_sender,
            use_keyspace_request_sender,
            distance_sender,
            pool_updated_notify,
            connectivity_receiver,
            _refiller_handle: handle,
        }
    }

    pub(crate) fn sharder(&self) -> Option<Sharder> {
        match &**self.conns.load() {
            MaybePoolConnections::Ready(PoolConnections::Sharded { sharder, .. }) => {
                Some(sharder.clone())
            }
            _ => None,
        }
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(&**self.conns.load(), MaybePoolConnections::Ready(p) if p.len() > 0)
    }

    /// Observes pool connectivity; `false` once every connection is
    /// gone, so the owner can mark the node down.
    pub(crate) fn subscribe_connectivity(&self) -> watch::Receiver<bool> {
        self.connectivity_receiver.clone()
    }

    /// Borrows a connection for a request.
    ///
    /// The target shard is the caller's hint, else derived from the
    /// token, else random. Within the shard the least-loaded connection
    /// wins; a congested or missing shard falls back to a bounded
    /// least-loaded sample across the whole pool.
    pub(crate) fn borrow(
        &self,
        shard_hint: Option<Shard>,
        token: Option<Token>,
    ) -> Result<Arc<Connection>, ConnectionPoolError> {
        let conns = self.conns.load();
        let pool = match &**conns {
            MaybePoolConnections::Ready(pool) => pool,
            MaybePoolConnections::Initializing => {
                return Err(ConnectionPoolError::Initializing)
            }
            MaybePoolConnections::Broken(err) => {
                return Err(ConnectionPoolError::Broken {
                    last_connection_error: err.clone(),
                })
            }
            MaybePoolConnections::Draining => return Err(ConnectionPoolError::ShuttingDown),
        };

        let chosen = match pool {
            PoolConnections::NotSharded(conns) => self.pick_least_loaded(conns)?,
            PoolConnections::Sharded {
                sharder,
                connections,
            } => {
                let shard = shard_hint
                    .or_else(|| token.map(|t| sharder.shard_of(t)))
                    .unwrap_or_else(|| {
                        rand::rng().random_range(0..sharder.nr_shards.get() as u32)
                    });
                let shard_conns = connections
                    .get(shard as usize)
                    .ok_or(ConnectionPoolError::ShardOutOfBounds {
                        shard,
                        nr_shards: sharder.nr_shards.get(),
                    })?;

                match self.pick_least_loaded(shard_conns) {
                    Ok(conn) if conn.in_flight() < self.max_inflight_threshold => conn,
                    // Congested or empty shard: sample across all shards.
                    _ => self.pick_from_global_sample(connections)?,
                }
            }
        };

        if chosen.in_flight() >= self.max_requests_per_connection {
            return Err(ConnectionPoolError::Busy {
                host: self.endpoint,
                max_inflight: self.max_requests_per_connection,
                length: pool.len(),
            });
        }

        if chosen.in_flight() >= self.max_inflight_threshold {
            // Ask the refiller to consider growing; it applies the
            // cool-down and the max-size cap.
            let _ = self.excess_demand_sender.send(());
        }

        Ok(chosen)
    }

    fn pick_least_loaded(
        &self,
        conns: &[Arc<Connection>],
    ) -> Result<Arc<Connection>, ConnectionPoolError> {
        conns
            .iter()
            .min_by_key(|conn| conn.in_flight())
            .cloned()
            .ok_or(ConnectionPoolError::Broken {
                last_connection_error: ConnectionError::ConnectTimeout,
            })
    }

    fn pick_from_global_sample(
        &self,
        connections: &[Vec<Arc<Connection>>],
    ) -> Result<Arc<Connection>, ConnectionPoolError> {
        let total: usize = connections.iter().map(Vec::len).sum();
        if total == 0 {
            return Err(ConnectionPoolError::Broken {
                last_connection_error: ConnectionError::ConnectTimeout,
            });
        }
        // Round-robin the sampling window so successive borrows spread
        // over the pool instead of re-examining the same prefix.
        let start = self.borrow_cursor.fetch_add(1, Ordering::Relaxed) % total;
        connections
            .iter()
            .flatten()
            .cycle()
            .skip(start)
            .take(BORROW_SAMPLE_SIZE.min(total))
            .min_by_key(|conn| conn.in_flight())
            .cloned()
            .ok_or(ConnectionPoolError::Broken {
                last_connection_error: ConnectionError::ConnectTimeout,
            })
    }

    /// A connection of any shard, e.g. for preparing statements.
    pub(crate) fn random_connection(&self) -> Result<Arc<Connection>, ConnectionPoolError> {
        self.borrow(None, None)
    }

    /// All live connections, e.g. for repreparation on every shard.
    pub(crate) fn get_working_connections(
        &self,
    ) -> Result<Vec<Arc<Connection>>, ConnectionPoolError> {
        match &**self.conns.load() {
            MaybePoolConnections::Ready(pool) => Ok(pool.iter().cloned().collect()),
            MaybePoolConnections::Initializing => Err(ConnectionPoolError::Initializing),
            MaybePoolConnections::Broken(err) => Err(ConnectionPoolError::Broken {
                last_connection_error: err.clone(),
            }),
            MaybePoolConnections::Draining => Err(ConnectionPoolError::ShuttingDown),
        }
    }

    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        let (response_sender, response_receiver) = oneshot::channel();
        self.use_keyspace_request_sender
            .send(UseKeyspaceRequest {
                keyspace_name,
                response_sender,
            })
            .await
            .map_err(|_| UseKeyspaceError::Timeout)?;
        response_receiver
            .await
            .map_err(|_| UseKeyspaceError::Timeout)?
    }

    /// Tells the pool the node's distance changed. `Ignored` drains the
    /// pool; anything else (re)starts filling.
    pub(crate) fn update_distance(&self, distance: NodeDistance) {
        let _ = self.distance_sender.send(distance);
    }

    /// Waits until the first fill attempt concluded, successfully or
    /// not.
    pub(crate) async fn wait_until_initialized(&self) {
        loop {
            // Register for the notification before checking, so an update
            // landing in between is not missed.
            let updated = self.pool_updated_notify.notified();
            if !matches!(&**self.conns.load(), MaybePoolConnections::Initializing) {
                return;
            }
            updated.await;
        }
    }
}

struct OpenedConnectionEvent {
    result: Result<(Connection, ErrorReceiver), ConnectionError>,
    requested_shard: Option<Shard>,
}

struct BrokenConnectionEvent {
    connection: std::sync::Weak<Connection>,
    error: ConnectionError,
}

struct PoolRefiller {
    endpoint: SocketAddr,
    config: PoolConfig,
    /// Per-shard connection vectors; a single vector when not sharded.
    conns: Vec<Vec<Arc<Connection>>>,
    sharder: Option<Sharder>,
    shard_aware_port: Option<u16>,
    current_keyspace: Option<VerifiedKeyspaceName>,
    shared_conns: Arc<ArcSwap<MaybePoolConnections>>,
    pool_updated_notify: Arc<Notify>,
    connectivity_sender: watch::Sender<bool>,
    last_error: Option<ConnectionError>,
    last_resize: Option<Instant>,
    excess_demand: bool,
    distance: NodeDistance,
    /// Connections removed from the borrowable set, kept alive until the
    /// drain delay elapses so in-flight requests can finish.
    draining_conns: Vec<Arc<Connection>>,
}

impl PoolRefiller {
    async fn run(
        mut self,
        mut excess_demand_receiver: mpsc::UnboundedReceiver<()>,
        mut use_keyspace_request_receiver: mpsc::Receiver<UseKeyspaceRequest>,
        mut distance_receiver: mpsc::UnboundedReceiver<NodeDistance>,
    ) {
        debug!("Starting the pool refiller for {}", self.endpoint);

        let mut ready_connections =
            FuturesUnordered::<futures::future::BoxFuture<'static, OpenedConnectionEvent>>::new();
        let mut broken_connections =
            FuturesUnordered::<futures::future::BoxFuture<'static, BrokenConnectionEvent>>::new();
        let mut reconnection_schedule: Option<Box<dyn ReconnectionSchedule + Send>> = None;
        let mut next_fill: Option<Instant> = Some(Instant::now());
        let mut drain_deadline: Option<Instant> = None;

        loop {
            // Cap in-progress opens to the current deficit: a due fill
            // while opens are still in flight is dropped, and the
            // completion handler reschedules if a deficit remains.
            if let Some(when) = next_fill {
                if Instant::now() >= when {
                    if self.distance != NodeDistance::Ignored
                        && ready_connections.is_empty()
                    {
                        self.start_filling(&mut ready_connections);
                    }
                    next_fill = None;
                }
            }

            let fill_sleep = async move {
                match next_fill {
                    Some(when) => tokio::time::sleep_until(when).await,
                    None => futures::future::pending().await,
                }
            };
            let drain_sleep = async move {
                match drain_deadline {
                    Some(when) => tokio::time::sleep_until(when).await,
                    None => futures::future::pending().await,
                }
            };

            tokio::select! {
                evt = ready_connections.select_next_some(), if !ready_connections.is_empty() => {
                    let success = self.handle_ready_connection(evt, &mut broken_connections);
                    if ready_connections.is_empty() {
                        if self.has_deficit() {
                            // More to open: back off on failure, go again
                            // immediately on success.
                            let delay = if success {
                                reconnection_schedule = None;
                                Duration::ZERO
                            } else {
                                reconnection_schedule
                                    .get_or_insert_with(|| {
                                        self.config.reconnection_policy.new_schedule()
                                    })
                                    .next_delay()
                            };
                            next_fill = Some(Instant::now() + delay);
                        } else {
                            reconnection_schedule = None;
                        }
                    }
                }
                evt = broken_connections.select_next_some(), if !broken_connections.is_empty() => {
                    self.handle_broken_connection(evt);
                    if next_fill.is_none() && self.has_deficit() {
                        next_fill = Some(Instant::now());
                    }
                }
                Some(()) = excess_demand_receiver.recv() => {
                    self.note_excess_demand();
                    if self.excess_demand && next_fill.is_none() && self.has_deficit() {
                        next_fill = Some(Instant::now());
                    }
                }
                Some(request) = use_keyspace_request_receiver.recv() => {
                    self.handle_use_keyspace(request).await;
                }
                Some(distance) = distance_receiver.recv() => {
                    match distance {
                        NodeDistance::Ignored if self.distance != NodeDistance::Ignored => {
                            self.distance = NodeDistance::Ignored;
                            self.begin_drain();
                            let delay = self.config.drain_delay.min(MAX_DRAIN_DELAY);
                            drain_deadline = Some(Instant::now() + delay);
                            next_fill = None;
                        }
                        NodeDistance::Ignored => {}
                        other => {
                            self.distance = other;
                            if next_fill.is_none() && self.has_deficit() {
                                next_fill = Some(Instant::now());
                            }
                        }
                    }
                }
                _ = fill_sleep, if next_fill.is_some() => {
                    // Loop around; the fill happens at the loop head.
                }
                _ = drain_sleep, if drain_deadline.is_some() => {
                    debug!(
                        "Dropping {} drained connections to {}",
                        self.draining_conns.len(),
                        self.endpoint
                    );
                    self.draining_conns.clear();
                    drain_deadline = None;
                }
                else => break,
            }
        }
    }

    fn shard_count(&self) -> usize {
        self.sharder
            .as_ref()
            .map(|s| s.nr_shards.get() as usize)
            .unwrap_or(1)
    }

    /// Core connections per shard, derived from the configured pool
    /// size; growth under load adds one more per congested pool, up to
    /// `max_pool_size` in total.
    fn target_per_shard(&self) -> usize {
        let shard_count = self.shard_count();
        let core = match self.config.pool_size {
            PoolSize::PerShard(count) => count.get(),
            PoolSize::PerHost(count) => count.get().div_ceil(shard_count),
        };
        let growth = if self.excess_demand { 1 } else { 0 };
        let max_per_shard = self.config.max_pool_size.div_ceil(shard_count).max(1);
        (core + growth).min(max_per_shard)
    }

    fn total_connections(&self) -> usize {
        self.conns.iter().map(Vec::len).sum()
    }

    fn has_deficit(&self) -> bool {
        if self.distance == NodeDistance::Ignored {
            return false;
        }
        let target = self.target_per_shard();
        self.conns.is_empty() || self.conns.iter().any(|shard| shard.len() < target)
    }

    fn note_excess_demand(&mut self) {
        let now = Instant::now();
        let cooled_down = self
            .last_resize
            .map(|at| now.duration_since(at) >= RESIZE_COOLDOWN)
            .unwrap_or(true);
        if cooled_down && self.total_connections() < self.config.max_pool_size {
            self.excess_demand = true;
            self.last_resize = Some(now);
        }
    }

    /// Starts opening connections for every shard below target. The
    /// target shard set is a pure function of the current vectors, so
    /// concurrent growth cannot race the selection.
    fn start_filling(
        &mut self,
        ready_connections: &mut FuturesUnordered<
            futures::future::BoxFuture<'static, OpenedConnectionEvent>,
        >,
    ) {
        let target = self.target_per_shard();

        if self.conns.is_empty() {
            // Nothing known about sharding yet; open one connection and
            // learn from its SUPPORTED options.
            ready_connections.push(self.spawn_open(None));
            return;
        }

        for (shard, shard_conns) in self.conns.iter().enumerate() {
            for _ in shard_conns.len()..target {
                ready_connections.push(self.spawn_open(Some(shard as u32)));
            }
        }
    }

    fn spawn_open(
        &self,
        requested_shard: Option<Shard>,
    ) -> futures::future::BoxFuture<'static, OpenedConnectionEvent> {
        let endpoint = self.endpoint;
        let mut config = self.config.connection_config.clone();
        config.keyspace_to_use = self.current_keyspace.clone();

        // Shard placement: connect to the shard-aware port from a source
        // port that maps to the wanted shard. Any ephemeral port works
        // when there is no wanted shard.
        let shard_aware = match (requested_shard, &self.sharder, self.shard_aware_port) {
            (Some(shard), Some(sharder), Some(port)) if self.config.can_use_shard_aware_port => {
                Some((shard, sharder.clone(), port))
            }
            _ => None,
        };
        let port_range = config.shard_aware_local_port_range.clone();

        async move {
            let result = match shard_aware {
                Some((shard, sharder, shard_aware_port)) => {
                    let shard_aware_endpoint = SocketAddr::new(endpoint.ip(), shard_aware_port);
                    let mut last_err = None;
                    let mut opened = None;
                    // A source port may race another socket; try a few.
                    for source_port in
                        sharder.iter_source_ports_for_shard(shard, &port_range).take(4)
                    {
                        match open_connection(shard_aware_endpoint, Some(source_port), &config)
                            .await
                        {
                            Ok(ok) => {
                                opened = Some(ok);
                                break;
                            }
                            Err(err) => {
                                trace!(
                                    "Shard-aware connect to {} from port {} failed: {}",
                                    shard_aware_endpoint,
                                    source_port,
                                    err
                                );
                                last_err = Some(err);
                            }
                        }
                    }
                    match opened {
                        Some(ok) => Ok(ok),
                        None => match last_err {
                            Some(err) => Err(err),
                            None => open_connection(endpoint, None, &config).await,
                        },
                    }
                }
                None => open_connection(endpoint, None, &config).await,
            };
            OpenedConnectionEvent {
                result,
                requested_shard,
            }
        }
        .boxed()
    }

    fn handle_ready_connection(
        &mut self,
        evt: OpenedConnectionEvent,
        broken_connections: &mut FuturesUnordered<
            futures::future::BoxFuture<'static, BrokenConnectionEvent>,
        >,
    ) -> bool {
        match evt.result {
            Err(err) => {
                warn!("Failed to open a connection to {}: {}", self.endpoint, err);
                self.last_error = Some(err);
                if self.total_connections() == 0 {
                    self.publish_broken();
                }
                false
            }
            Ok((connection, error_receiver)) => {
                let connection = Arc::new(connection);

                // First successful open teaches us the sharding layout.
                if self.conns.is_empty() {
                    match connection.features().shard_info.as_ref() {
                        Some(info) => {
                            self.sharder = Some(info.get_sharder());
                            self.shard_aware_port = if self.config.connection_config.is_tls() {
                                info.shard_aware_port_ssl
                            } else {
                                info.shard_aware_port
                            };
                            self.conns = vec![Vec::new(); info.nr_shards.get() as usize];
                        }
                        None => {
                            self.conns = vec![Vec::new()];
                        }
                    }
                }

                // File the connection under the shard it actually landed
                // on, which may differ from the requested one.
                let landed_shard = connection
                    .get_shard()
                    .map(|s| s as usize)
                    .filter(|s| *s < self.conns.len())
                    .unwrap_or(0);
                if evt.requested_shard.is_some()
                    && evt.requested_shard != connection.get_shard()
                {
                    trace!(
                        "Connection to {} requested shard {:?} but landed on {:?}",
                        self.endpoint,
                        evt.requested_shard,
                        connection.get_shard()
                    );
                }

                let weak = Arc::downgrade(&connection);
                broken_connections.push(
                    async move {
                        let error = match error_receiver.await {
                            Ok(error) => error,
                            // The router stopped cleanly: treat as closed.
                            Err(_) => ConnectionError::Broken(
                                crate::errors::BrokenConnectionErrorKind::ChannelError.into(),
                            ),
                        };
                        BrokenConnectionEvent {
                            connection: weak,
                            error,
                        }
                    }
                    .boxed(),
                );

                self.conns[landed_shard].push(connection);
                self.excess_demand = false;
                self.publish_ready();
                true
            }
        }
    }

    fn handle_broken_connection(&mut self, evt: BrokenConnectionEvent) {
        let Some(broken) = evt.connection.upgrade() else {
            return;
        };
        warn!("Connection to {} broke: {}", self.endpoint, evt.error);
        self.last_error = Some(evt.error);

        for shard_conns in self.conns.iter_mut() {
            shard_conns.retain(|conn| !Arc::ptr_eq(conn, &broken));
        }

        if self.total_connections() == 0 {
            warn!("All connections to {} are gone", self.endpoint);
            self.publish_broken();
        } else {
            self.publish_ready();
        }
    }

    async fn handle_use_keyspace(&mut self, request: UseKeyspaceRequest) {
        self.current_keyspace = Some(request.keyspace_name.clone());

        let conns: Vec<Arc<Connection>> = self.conns.iter().flatten().cloned().collect();
        let keyspace_name = request.keyspace_name;
        // Propagate to every connection; a single failure fails the
        // request, as the pool is now in a mixed state the next
        // reconnect will converge from.
        let result = async {
            let mut first_error: Option<UseKeyspaceError> = None;
            let mut futures_unordered: FuturesUnordered<_> = conns
                .iter()
                .map(|conn| conn.use_keyspace(&keyspace_name))
                .collect();
            while let Some(result) = futures_unordered.next().await {
                if let Err(err) = result {
                    first_error.get_or_insert(err);
                }
            }
            match first_error {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
        .await;

        let _ = request.response_sender.send(result);
    }

    fn begin_drain(&mut self) {
        debug!("Draining the pool of {}", self.endpoint);
        for shard_conns in self.conns.iter_mut() {
            self.draining_conns.append(shard_conns);
        }
        self.shared_conns
            .store(Arc::new(MaybePoolConnections::Draining));
        let _ = self.connectivity_sender.send(false);
        self.pool_updated_notify.notify_waiters();
    }

    fn publish_ready(&self) {
        let pool = match &self.sharder {
            Some(sharder) => PoolConnections::Sharded {
                sharder: sharder.clone(),
                connections: self.conns.clone(),
            },
            None => PoolConnections::NotSharded(
                self.conns.first().cloned().unwrap_or_default(),
            ),
        };
        self.shared_conns
            .store(Arc::new(MaybePoolConnections::Ready(pool)));
        let _ = self.connectivity_sender.send(self.total_connections() > 0);
        self.pool_updated_notify.notify_waiters();
    }

    fn publish_broken(&self) {
        let error = self
            .last_error
            .clone()
            .unwrap_or(ConnectionError::ConnectTimeout);
        self.shared_conns
            .store(Arc::new(MaybePoolConnections::Broken(error)));
        let _ = self.connectivity_sender.send(false);
        self.pool_updated_notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_defaults_to_one_per_shard() {
        match PoolSize::default() {
            PoolSize::PerShard(count) => assert_eq!(count.get(), 1),
            other => panic!("unexpected default {other:?}"),
        }
    }

    #[test]
    fn per_host_size_is_split_across_shards() {
        let config = PoolConfig {
            pool_size: PoolSize::PerHost(NonZeroUsize::new(6).unwrap()),
            ..Default::default()
        };
        // 6 connections over 4 shards round up to 2 per shard.
        let per_shard = match config.pool_size {
            PoolSize::PerHost(count) => count.get().div_ceil(4),
            PoolSize::PerShard(count) => count.get(),
        };
        assert_eq!(per_shard, 2);
    }
}
