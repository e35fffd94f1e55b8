//! The session: the entry point applications use to run statements.
//!
//! The session owns one pool per known node, the prepared-statement
//! cache and the request pipeline: for every request it asks the
//! load-balancing policy for a query plan, borrows a connection to each
//! target in turn, and applies the retry policy to failed attempts.

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use std::time::Duration;

use futures::stream::StreamExt;
use tracing::{debug, warn};

use crate::client::pager::QueryPager;
use crate::client::prepared_cache::PreparedCache;
use crate::client::session_builder::SessionConfig;
use crate::cluster::{ClusterState, Node};
use crate::errors::{
    ConnectionPoolError, DbError, ExecutionError, NewSessionError, PrepareError,
    RequestAttemptError, TriedHosts, UseKeyspaceError,
};
use crate::network::connection::{
    is_protocol_version_rejection, open_connection, Connection, HostConnectionConfig,
    VerifiedKeyspaceName,
};
use crate::network::connection_pool::{NodeConnectionPool, PoolConfig};
use crate::observability::{IdAllocator, RequestListener};
use crate::policies::load_balancing::{LoadBalancingPolicy, Plan, RoutingInfo};
use crate::policies::retry::{RequestInfo, RetryDecision, RetryPolicy, RetrySession};
use crate::policies::speculative_execution::{self, SpeculativeExecutionPolicy};
use crate::response::{PagingState, QueryResult};
use crate::routing::{hash_routing_key, Token};
use crate::statement::{
    Batch, BatchStatement, BoundStatement, PageSize, PreparedStatement, Statement,
    StatementConfig,
};
use typhon_cql::frame::request::query::{PagingStateResponse, QueryParameters};
use typhon_cql::frame::request::{
    batch as batch_request, BatchStatement as WireBatchStatement,
};
use typhon_cql::frame::response::result::ResultMetadata;
use typhon_cql::serialize::SerializedValues;
use typhon_cql::{Consistency, ProtocolVersion, SerialConsistency};

/// How many repreparations may be in flight at once when spreading a
/// statement over the cluster.
const REPREPARE_CONCURRENCY: usize = 64;

/// An open session. Cheap to clone; clones share all state including the
/// prepared-statement cache.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

pub(crate) struct SessionShared {
    cluster: ClusterState,
    protocol_version: ProtocolVersion,
    keyspace: StdRwLock<Option<VerifiedKeyspaceName>>,
    cache: PreparedCache,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    speculative_execution: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    listener: Arc<dyn RequestListener>,
    ids: IdAllocator,
    default_consistency: Consistency,
    default_serial_consistency: Option<SerialConsistency>,
    default_page_size: PageSize,
    request_timeout: Option<Duration>,
    prepare_on_all_hosts: bool,
    schema_metadata: Option<Arc<dyn crate::cluster::metadata::SchemaMetadataProvider>>,
}

/// What gets sent on one attempt.
enum RequestKind<'a> {
    Query {
        contents: &'a str,
        values: &'a SerializedValues,
    },
    Execute {
        prepared: &'a PreparedStatement,
        values: &'a SerializedValues,
    },
    Batch {
        batch: &'a Batch,
        values: &'a [SerializedValues],
    },
}

/// Options resolved from statement config and session defaults.
struct ResolvedOptions {
    consistency: Consistency,
    serial_consistency: Option<SerialConsistency>,
    timestamp: Option<i64>,
    keyspace: Option<String>,
    page_size: Option<i32>,
    paging_state: PagingState,
    is_idempotent: bool,
    tracing: bool,
}

impl Session {
    /// Connects to the cluster and builds pools for every contact point.
    pub async fn connect(config: SessionConfig) -> Result<Session, NewSessionError> {
        let addresses = config.resolve_contact_points().await?;
        if addresses.is_empty() {
            return Err(NewSessionError::EmptyKnownNodesList);
        }

        let keyspace = config
            .keyspace
            .as_ref()
            .map(|(name, case_sensitive)| {
                VerifiedKeyspaceName::new(name.clone(), *case_sensitive)
            })
            .transpose()
            .map_err(UseKeyspaceError::BadKeyspaceName)?;

        // Version negotiation: probe with the highest configured version
        // and step down every time a server refuses it.
        let mut version = config.protocol_max_version;
        let negotiated = 'negotiation: loop {
            let probe_config = config.host_connection_config(version, None);
            let mut last_error = None;
            for address in &addresses {
                match open_connection(*address, None, &probe_config).await {
                    Ok((_probe, _receiver)) => break 'negotiation version,
                    Err(err) if is_protocol_version_rejection(&err) => {
                        match version.predecessor() {
                            Some(lower) => {
                                debug!(
                                    "Server {} rejected protocol version {}; retrying with {}",
                                    address, version, lower
                                );
                                version = lower;
                                continue 'negotiation;
                            }
                            None => {
                                return Err(NewSessionError::FailedToConnect(
                                    crate::errors::ConnectionError::UnsupportedProtocolVersion {
                                        server: version as u8,
                                    },
                                ))
                            }
                        }
                    }
                    Err(err) => last_error = Some(err),
                }
            }
            // Every contact point failed for reasons other than version.
            return Err(match last_error {
                Some(err) => NewSessionError::FailedToConnect(err),
                None => NewSessionError::EmptyKnownNodesList,
            });
        };

        let nodes: Vec<Arc<Node>> = addresses
            .iter()
            .map(|address| {
                let pool_config = PoolConfig {
                    connection_config: config
                        .host_connection_config(negotiated, keyspace.clone()),
                    pool_size: config.pool_size,
                    max_pool_size: config.max_pool_size,
                    max_requests_per_connection: config.max_requests_per_connection,
                    max_inflight_threshold: config.max_inflight_threshold,
                    can_use_shard_aware_port: !config.disable_shard_awareness,
                    reconnection_policy: config.reconnection_policy.clone(),
                    drain_delay: config.read_timeout * 2,
                };
                let pool = NodeConnectionPool::new(*address, pool_config, keyspace.clone());
                Arc::new(Node::new(*address, pool))
            })
            .collect();

        for node in &nodes {
            node.pool.wait_until_initialized().await;
        }

        let shared = Arc::new(SessionShared {
            cluster: ClusterState { nodes },
            protocol_version: negotiated,
            keyspace: StdRwLock::new(keyspace),
            cache: PreparedCache::new(),
            load_balancing: config.load_balancing,
            retry_policy: config.retry_policy,
            speculative_execution: config.speculative_execution,
            listener: config.listener,
            ids: IdAllocator::default(),
            default_consistency: config.default_consistency,
            default_serial_consistency: config.default_serial_consistency,
            default_page_size: config.default_page_size,
            request_timeout: config.request_timeout,
            prepare_on_all_hosts: config.prepare_on_all_hosts,
            schema_metadata: config.schema_metadata,
        });

        if config.reprepare_on_up {
            SessionShared::spawn_reprepare_on_up_watchers(&shared);
        }

        Ok(Session { shared })
    }

    pub fn get_cluster_state(&self) -> &ClusterState {
        &self.shared.cluster
    }

    pub fn protocol_version(&self) -> ProtocolVersion {
        self.shared.protocol_version
    }

    /// Runs an unpaged query: the server returns the whole result set in
    /// one response.
    pub async fn query_unpaged(
        &self,
        statement: &Statement,
    ) -> Result<QueryResult, ExecutionError> {
        let values = statement
            .values
            .serialize_inferred(self.shared.protocol_version)?;
        let options = self
            .shared
            .resolve_options(&statement.config, None, PagingState::start());
        self.shared
            .run_with_timeout(statement.config.request_timeout, async {
                self.shared
                    .run_request(
                        RequestKind::Query {
                            contents: &statement.contents,
                            values: &values,
                        },
                        &options,
                        self.shared.routing_info(&statement.config, None, &options),
                    )
                    .await
            })
            .await
    }

    /// Runs one page of a query, resuming at `paging_state`. The
    /// returned paging state resumes after this page.
    pub async fn query_single_page(
        &self,
        statement: &Statement,
        paging_state: PagingState,
    ) -> Result<(QueryResult, PagingStateResponse), ExecutionError> {
        let values = statement
            .values
            .serialize_inferred(self.shared.protocol_version)?;
        let page_size = statement
            .config
            .page_size
            .unwrap_or(self.shared.default_page_size);
        let options =
            self.shared
                .resolve_options(&statement.config, Some(page_size), paging_state);
        let result = self
            .shared
            .run_with_timeout(statement.config.request_timeout, async {
                self.shared
                    .run_request(
                        RequestKind::Query {
                            contents: &statement.contents,
                            values: &values,
                        },
                        &options,
                        self.shared.routing_info(&statement.config, None, &options),
                    )
                    .await
            })
            .await?;
        let paging_state_response = result.paging_state_response().clone();
        Ok((result, paging_state_response))
    }

    /// Runs a query as a lazy row stream, fetching pages on demand.
    pub async fn query_iter(&self, statement: Statement) -> Result<QueryPager, ExecutionError> {
        let shared = self.shared.clone();
        let values = statement
            .values
            .serialize_inferred(shared.protocol_version)?;
        let page_size = statement
            .config
            .page_size
            .unwrap_or(shared.default_page_size);
        let initial_paging_state = statement.config.paging_state.clone();
        let auto_page = statement.config.auto_page;

        let fetcher = move |paging_state: PagingState| {
            let shared = shared.clone();
            let statement = statement.clone();
            let values = values.clone();
            async move {
                let options = shared.resolve_options(
                    &statement.config,
                    Some(page_size),
                    paging_state,
                );
                shared
                    .run_request(
                        RequestKind::Query {
                            contents: &statement.contents,
                            values: &values,
                        },
                        &options,
                        shared.routing_info(&statement.config, None, &options),
                    )
                    .await
            }
        };

        QueryPager::new(fetcher, initial_paging_state, auto_page)
            .await
            .map_err(pager_error_into_execution)
    }

    /// Runs a bound statement unpaged.
    pub async fn execute_unpaged(
        &self,
        bound: &BoundStatement,
    ) -> Result<QueryResult, ExecutionError> {
        let prepared = bound.prepared();
        let values = prepared.serialize_values(&bound.values, self.shared.protocol_version)?;
        let options =
            self.shared
                .resolve_options(bound.config(), None, PagingState::start());
        self.shared
            .run_with_timeout(bound.config().request_timeout, async {
                self.shared
                    .run_request(
                        RequestKind::Execute {
                            prepared,
                            values: &values,
                        },
                        &options,
                        self.shared
                            .routing_info_for_bound(prepared, &values, bound.config(), &options)?,
                    )
                    .await
            })
            .await
    }

    /// Runs one page of a bound statement.
    pub async fn execute_single_page(
        &self,
        bound: &BoundStatement,
        paging_state: PagingState,
    ) -> Result<(QueryResult, PagingStateResponse), ExecutionError> {
        let prepared = bound.prepared();
        let values = prepared.serialize_values(&bound.values, self.shared.protocol_version)?;
        let page_size = bound
            .config()
            .page_size
            .unwrap_or(self.shared.default_page_size);
        let options = self
            .shared
            .resolve_options(bound.config(), Some(page_size), paging_state);
        let result = self
            .shared
            .run_with_timeout(bound.config().request_timeout, async {
                self.shared
                    .run_request(
                        RequestKind::Execute {
                            prepared,
                            values: &values,
                        },
                        &options,
                        self.shared
                            .routing_info_for_bound(prepared, &values, bound.config(), &options)?,
                    )
                    .await
            })
            .await?;
        let paging_state_response = result.paging_state_response().clone();
        Ok((result, paging_state_response))
    }

    /// Runs a bound statement as a lazy row stream.
    pub async fn execute_iter(
        &self,
        bound: BoundStatement,
    ) -> Result<QueryPager, ExecutionError> {
        let shared = self.shared.clone();
        let values = bound
            .prepared()
            .serialize_values(&bound.values, shared.protocol_version)?;
        let page_size = bound
            .config()
            .page_size
            .unwrap_or(shared.default_page_size);
        let initial_paging_state = bound.config().paging_state.clone();
        let auto_page = bound.config().auto_page;

        let fetcher = move |paging_state: PagingState| {
            let shared = shared.clone();
            let bound = bound.clone();
            let values = values.clone();
            async move {
                let prepared = bound.prepared();
                let options =
                    shared.resolve_options(bound.config(), Some(page_size), paging_state);
                let routing = shared.routing_info_for_bound(
                    prepared,
                    &values,
                    bound.config(),
                    &options,
                )?;
                shared
                    .run_request(
                        RequestKind::Execute {
                            prepared,
                            values: &values,
                        },
                        &options,
                        routing,
                    )
                    .await
            }
        };

        QueryPager::new(fetcher, initial_paging_state, auto_page)
            .await
            .map_err(pager_error_into_execution)
    }

    /// Runs a batch.
    pub async fn batch(&self, batch: &Batch) -> Result<QueryResult, ExecutionError> {
        let version = self.shared.protocol_version;
        let mut values = Vec::with_capacity(batch.statements.len());
        for child in &batch.statements {
            values.push(match child {
                BatchStatement::Query(statement) => {
                    statement.values.serialize_inferred(version)?
                }
                BatchStatement::Prepared(bound) => bound
                    .prepared()
                    .serialize_values(&bound.values, version)?,
            });
        }

        let options = self
            .shared
            .resolve_options(&batch.config, None, PagingState::start());

        // Route by the first bound child, when there is one.
        let routing = batch
            .statements
            .iter()
            .zip(values.iter())
            .find_map(|(child, serialized)| match child {
                BatchStatement::Prepared(bound) => self
                    .shared
                    .routing_info_for_bound(
                        bound.prepared(),
                        serialized,
                        &batch.config,
                        &options,
                    )
                    .ok(),
                BatchStatement::Query(_) => None,
            })
            .unwrap_or_else(|| self.shared.routing_info(&batch.config, None, &options));

        let mut options = options;
        options.is_idempotent = batch.is_idempotent();
        options.page_size = None;

        self.shared
            .run_with_timeout(batch.config.request_timeout, async {
                self.shared
                    .run_request(RequestKind::Batch { batch, values: &values }, &options, routing)
                    .await
            })
            .await
    }

    /// Prepares a statement. With `prepare_on_all_hosts` the PREPARE is
    /// sent to every reachable connection so any node can serve
    /// subsequent EXECUTEs without a roundtrip.
    pub async fn prepare(
        &self,
        statement: impl Into<Statement>,
    ) -> Result<Arc<PreparedStatement>, PrepareError> {
        let statement = statement.into();
        self.shared.prepare_inner(statement, None).await
    }

    /// The cached-prepare entry point: returns the cached statement for
    /// (current keyspace, text), preparing it on first use. Single
    /// flight per key; see [`PreparedCache`].
    pub async fn get_or_prepare(
        &self,
        statement: impl Into<Statement>,
        keyspace_override: Option<String>,
    ) -> Result<Arc<PreparedStatement>, PrepareError> {
        let statement = statement.into();
        let keyspace = keyspace_override.or_else(|| self.shared.current_keyspace_name());
        let shared = self.shared.clone();
        let statement_for_prepare = statement.clone();
        let keyspace_for_prepare = keyspace.clone();
        self.shared
            .cache
            .get_or_prepare(keyspace, &statement.contents, move || async move {
                shared
                    .prepare_inner(statement_for_prepare, keyspace_for_prepare)
                    .await
            })
            .await
    }

    /// Switches the session (and every pooled connection) to a
    /// keyspace.
    pub async fn use_keyspace(
        &self,
        keyspace_name: impl Into<String>,
        case_sensitive: bool,
    ) -> Result<(), UseKeyspaceError> {
        let verified = VerifiedKeyspaceName::new(keyspace_name.into(), case_sensitive)?;

        *self.shared.keyspace.write().unwrap() = Some(verified.clone());

        for node in &self.shared.cluster.nodes {
            node.pool.use_keyspace(verified.clone()).await?;
        }
        Ok(())
    }
}

impl SessionShared {
    fn current_keyspace_name(&self) -> Option<String> {
        self.keyspace
            .read()
            .unwrap()
            .as_ref()
            .map(|ks| ks.as_str().to_owned())
    }

    fn resolve_options(
        &self,
        config: &StatementConfig,
        page_size: Option<PageSize>,
        paging_state: PagingState,
    ) -> ResolvedOptions {
        ResolvedOptions {
            consistency: config.consistency.unwrap_or(self.default_consistency),
            serial_consistency: config
                .serial_consistency
                .or(self.default_serial_consistency),
            timestamp: config.timestamp,
            keyspace: config.keyspace.clone(),
            page_size: page_size.map(PageSize::get),
            paging_state,
            is_idempotent: config.is_idempotent(),
            tracing: config.tracing,
        }
    }

    fn routing_info<'a>(
        &self,
        config: &'a StatementConfig,
        token: Option<Token>,
        options: &ResolvedOptions,
    ) -> RoutingInfo<'a> {
        let routing_key = config.routing_key.as_deref();
        let token = token.or_else(|| routing_key.map(hash_routing_key));
        RoutingInfo {
            consistency: options.consistency,
            serial_consistency: options.serial_consistency,
            routing_key,
            token,
            keyspace: config.keyspace.as_deref(),
            is_confirmed_lwt: false,
        }
    }

    fn routing_info_for_bound<'a>(
        &self,
        prepared: &'a PreparedStatement,
        values: &SerializedValues,
        config: &'a StatementConfig,
        options: &ResolvedOptions,
    ) -> Result<RoutingInfo<'a>, ExecutionError> {
        let token = match config.routing_key.as_deref() {
            Some(key) => Some(hash_routing_key(key)),
            None => prepared
                .calculate_token(values)
                .map_err(|err| ExecutionError::LastAttempt(err_to_attempt(err)))?,
        };
        let mut info = self.routing_info(config, token, options);
        info.is_confirmed_lwt = prepared.is_confirmed_lwt();
        if info.keyspace.is_none() {
            info.keyspace = prepared.get_keyspace_name();
        }
        Ok(info)
    }

    async fn run_with_timeout(
        &self,
        statement_timeout: Option<Duration>,
        fut: impl std::future::Future<Output = Result<QueryResult, ExecutionError>>,
    ) -> Result<QueryResult, ExecutionError> {
        let timeout = statement_timeout.or(self.request_timeout);
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut)
                .await
                .unwrap_or(Err(ExecutionError::RequestTimeout(timeout))),
            None => fut.await,
        }
    }

    /// The request pipeline: walk the query plan, borrow a connection
    /// per target, send, and let the retry policy judge failures.
    /// Speculative execution races additional plan walks when enabled
    /// and the statement is idempotent.
    async fn run_request(
        &self,
        kind: RequestKind<'_>,
        options: &ResolvedOptions,
        routing: RoutingInfo<'_>,
    ) -> Result<QueryResult, ExecutionError> {
        let request_id = self.ids.next_request_id();
        self.listener.on_request_start(request_id);

        let result = match (&self.speculative_execution, options.is_idempotent) {
            (Some(policy), true) => {
                let runner = |_is_speculative: bool| {
                    let kind = &kind;
                    let routing = &routing;
                    async move {
                        Some(
                            self.run_plan(kind, options, routing, request_id)
                                .await,
                        )
                    }
                };
                speculative_execution::execute(policy.as_ref(), runner).await
            }
            _ => self.run_plan(&kind, options, &routing, request_id).await,
        };

        match &result {
            Ok(_) => self.listener.on_request_success(request_id),
            Err(error) => self.listener.on_request_failure(request_id, error),
        }
        result
    }

    async fn run_plan(
        &self,
        kind: &RequestKind<'_>,
        options: &ResolvedOptions,
        routing: &RoutingInfo<'_>,
        request_id: crate::observability::RequestId,
    ) -> Result<QueryResult, ExecutionError> {
        let mut retry_session = self.retry_policy.new_session();
        let mut tried = TriedHosts::default();
        let mut consistency = options.consistency;

        let plan = Plan::new(self.load_balancing.as_ref(), routing, &self.cluster);

        'targets: for (node, shard) in plan {
            let connection = match node.pool.borrow(Some(shard), routing.token) {
                Ok(connection) => connection,
                // A busy pool is a configuration problem, not a node
                // fault; surface it instead of masking it as
                // unavailability.
                Err(err @ ConnectionPoolError::Busy { .. }) => return Err(err.into()),
                Err(err) => {
                    tried.record(node.address, err);
                    continue 'targets;
                }
            };

            let mut reprepared_here = false;
            'same_target: loop {
                let attempt_id = self.ids.next_attempt_id();
                self.listener
                    .on_attempt_start(request_id, attempt_id, node.address);

                let result = self
                    .run_attempt(&connection, kind, options, consistency)
                    .await;

                let error = match result {
                    Ok(result) => {
                        self.listener.on_attempt_success(attempt_id);
                        return Ok(result);
                    }
                    Err(error) => error,
                };

                // UNPREPARED: reprepare on this very node and retry once
                // on it; a second UNPREPARED fails the request.
                if let (
                    RequestKind::Execute { prepared, .. },
                    RequestAttemptError::Db(DbError::Unprepared { .. }, _),
                ) = (kind, &error)
                {
                    if !reprepared_here {
                        debug!(
                            "Node {} has not prepared statement \"{}\"; repreparing",
                            node.address,
                            prepared.get_statement()
                        );
                        match connection
                            .reprepare(
                                prepared.get_statement(),
                                prepared.get_keyspace_name(),
                                prepared.get_id(),
                            )
                            .await
                        {
                            Ok(()) => {
                                reprepared_here = true;
                                continue 'same_target;
                            }
                            Err(reprepare_error) => {
                                self.listener.on_attempt_error(
                                    attempt_id,
                                    &reprepare_error,
                                    &RetryDecision::DontRetry,
                                );
                                // A rotated statement id means the cached
                                // statement no longer matches what the
                                // server would execute; fail fast.
                                return Err(match reprepare_error {
                                    RequestAttemptError::RepreparedIdChanged {
                                        expected_id,
                                        reprepared_id,
                                        ..
                                    } => ExecutionError::Prepare(PrepareError::IdMismatch {
                                        expected_id,
                                        reprepared_id,
                                    }),
                                    other => ExecutionError::LastAttempt(other),
                                });
                            }
                        }
                    }
                    return Err(ExecutionError::LastAttempt(error));
                }

                let decision = retry_session.decide_should_retry(RequestInfo {
                    error: &error,
                    is_idempotent: options.is_idempotent,
                    consistency,
                });
                self.listener.on_attempt_error(attempt_id, &error, &decision);

                match decision {
                    RetryDecision::RetrySameTarget(new_consistency) => {
                        if let Some(new_consistency) = new_consistency {
                            consistency = new_consistency;
                        }
                        continue 'same_target;
                    }
                    RetryDecision::RetryNextTarget(new_consistency) => {
                        if let Some(new_consistency) = new_consistency {
                            consistency = new_consistency;
                        }
                        tried.record(node.address, error);
                        continue 'targets;
                    }
                    RetryDecision::IgnoreWriteError => {
                        return Ok(QueryResult::new(
                            None,
                            Vec::new(),
                            PagingStateResponse::NoMorePages,
                        ));
                    }
                    RetryDecision::DontRetry => {
                        // Errors that provably left no effect on the
                        // server are safe to take to the next target
                        // even when the policy gave up.
                        if error.is_safe_to_retry() {
                            tried.record(node.address, error);
                            continue 'targets;
                        }
                        return Err(ExecutionError::LastAttempt(error));
                    }
                }
            }
        }

        if tried.0.is_empty() {
            Err(ExecutionError::EmptyPlan)
        } else {
            Err(ExecutionError::NoHostAvailable(tried))
        }
    }

    async fn run_attempt(
        &self,
        connection: &Connection,
        kind: &RequestKind<'_>,
        options: &ResolvedOptions,
        consistency: Consistency,
    ) -> Result<QueryResult, RequestAttemptError> {
        let version = self.protocol_version;

        let parameters = |values: &'_ SerializedValues| QueryParameters {
            consistency,
            serial_consistency: options.serial_consistency,
            timestamp: options.timestamp,
            page_size: options.page_size,
            paging_state: options.paging_state.clone(),
            skip_metadata: false,
            keyspace: options
                .keyspace
                .as_deref()
                .filter(|_| version.supports_per_request_keyspace())
                .map(|ks| Cow::Owned(ks.to_owned())),
            values: Cow::Owned(values.clone()),
        };

        match kind {
            RequestKind::Query { contents, values } => {
                let response = connection
                    .query_raw(contents, parameters(values), options.tracing)
                    .await?;
                response
                    .into_non_error_query_response()?
                    .into_query_result()
            }
            RequestKind::Execute { prepared, values } => {
                let metadata_snapshot = prepared.result_metadata();
                let response = connection
                    .execute_raw(
                        prepared.get_id().clone(),
                        metadata_snapshot.id.clone(),
                        parameters(values),
                        Some(metadata_snapshot.metadata.col_specs.as_slice()),
                        options.tracing,
                    )
                    .await?;
                let result = response
                    .into_non_error_query_response()?
                    .into_query_result()?;

                // The server rotated the result metadata after a schema
                // change; install the new id and columns atomically.
                if let Some(new_id) = result.new_metadata_id() {
                    prepared.rotate_result_metadata(
                        new_id.clone(),
                        ResultMetadata {
                            col_count: result.col_specs().len(),
                            col_specs: result.col_specs().to_vec(),
                            new_metadata_id: None,
                        },
                    );
                }
                Ok(result)
            }
            RequestKind::Batch { batch, values } => {
                let wire_statements = batch
                    .statements
                    .iter()
                    .map(|child| match child {
                        BatchStatement::Query(statement) => WireBatchStatement::Query {
                            text: Cow::Borrowed(statement.contents()),
                        },
                        BatchStatement::Prepared(bound) => WireBatchStatement::Prepared {
                            id: Cow::Borrowed(bound.prepared().get_id()),
                        },
                    })
                    .collect();
                let wire_batch = batch_request::Batch {
                    batch_type: batch.batch_type,
                    statements: wire_statements,
                    values: values.iter().map(Cow::Borrowed).collect(),
                    consistency,
                    serial_consistency: options.serial_consistency,
                    timestamp: options.timestamp,
                    keyspace: options
                        .keyspace
                        .as_deref()
                        .filter(|_| version.supports_per_request_keyspace())
                        .map(|ks| Cow::Owned(ks.to_owned())),
                };
                let response = connection.batch_raw(wire_batch, options.tracing).await?;
                response
                    .into_non_error_query_response()?
                    .into_query_result()
            }
        }
    }

    /// Prepares a statement on the cluster: on every reachable
    /// connection when `prepare_on_all_hosts`, else on a single one.
    /// The first successful response becomes the cached statement.
    async fn prepare_inner(
        &self,
        statement: Statement,
        keyspace_override: Option<String>,
    ) -> Result<Arc<PreparedStatement>, PrepareError> {
        let keyspace = keyspace_override.or_else(|| self.current_keyspace_name());

        let connections: Vec<Arc<Connection>> = if self.prepare_on_all_hosts {
            self.cluster
                .nodes
                .iter()
                .filter_map(|node| node.pool.get_working_connections().ok())
                .flatten()
                .collect()
        } else {
            self.cluster
                .nodes
                .iter()
                .find_map(|node| node.pool.random_connection().ok())
                .into_iter()
                .collect()
        };

        if connections.is_empty() {
            return Err(PrepareError::NoConnections);
        }

        let mut first_ok = None;
        let mut first_err = None;
        let mut lwt_mask = None;

        let mut prepares = futures::stream::iter(connections.into_iter().map(|connection| {
            let contents = statement.contents.clone();
            let keyspace = keyspace.clone();
            async move {
                let result = connection
                    .prepare_raw(&contents, keyspace.as_deref(), false)
                    .await;
                (result, connection)
            }
        }))
        .buffer_unordered(REPREPARE_CONCURRENCY);

        while let Some((result, connection)) = prepares.next().await {
            match result {
                Ok(prepared) => {
                    if first_ok.is_none() {
                        lwt_mask = connection.features().lwt_optimization_mask;
                        first_ok = Some(prepared);
                    }
                }
                Err(err) => {
                    debug!(
                        "Preparing on {} failed: {}",
                        connection.get_connect_address(),
                        err
                    );
                    first_err.get_or_insert(err);
                }
            }
        }
        drop(prepares);

        let mut prepared_response = match (first_ok, first_err) {
            (Some(prepared), _) => prepared,
            (None, Some(err)) => return Err(PrepareError::Attempt(err)),
            (None, None) => return Err(PrepareError::NoConnections),
        };

        // Servers older than protocol v4 do not send partition-key
        // indexes; fall back to the schema collaborator when configured.
        if prepared_response.prepared_metadata.pk_indexes.is_empty() {
            if let Some(schema) = &self.schema_metadata {
                crate::cluster::metadata::derive_pk_indexes(
                    &mut prepared_response.prepared_metadata,
                    schema.as_ref(),
                );
            }
        }

        let is_lwt = lwt_mask
            .map(|mask| (prepared_response.prepared_metadata.flags as u32) & mask != 0)
            .unwrap_or(false);

        Ok(Arc::new(PreparedStatement::new(
            statement.contents.clone(),
            prepared_response,
            keyspace,
            statement.config.clone(),
            is_lwt,
        )))
    }

    /// Reprepares every cached statement on one node's connections,
    /// after the node regained connectivity. Per-connection failures
    /// are logged, never fatal.
    async fn reprepare_cached_on_node(&self, node: &Node) {
        let Ok(connections) = node.pool.get_working_connections() else {
            return;
        };
        let statements = self.cache.cached_statements();
        if statements.is_empty() || connections.is_empty() {
            return;
        }
        debug!(
            "Repreparing {} statements on {}",
            statements.len(),
            node.address
        );

        let pairs: Vec<_> = statements
            .iter()
            .flat_map(|prepared| {
                connections
                    .iter()
                    .map(move |connection| (prepared.clone(), connection.clone()))
            })
            .collect();

        let mut reprepares = futures::stream::iter(pairs.into_iter().map(|(prepared, connection)| async move {
            let result = connection
                .reprepare(
                    prepared.get_statement(),
                    prepared.get_keyspace_name(),
                    prepared.get_id(),
                )
                .await;
            (result, connection.get_connect_address())
        }))
        .buffer_unordered(REPREPARE_CONCURRENCY);

        while let Some((result, address)) = reprepares.next().await {
            if let Err(err) = result {
                warn!("Repreparing on {} failed: {}", address, err);
            }
        }
    }

    fn spawn_reprepare_on_up_watchers(shared_arc: &Arc<Self>) {
        for node in shared_arc.cluster.nodes.iter().cloned() {
            let shared = Arc::downgrade(shared_arc);
            let mut connectivity = node.pool.subscribe_connectivity();
            tokio::spawn(async move {
                let mut was_connected = *connectivity.borrow();
                while connectivity.changed().await.is_ok() {
                    let is_connected = *connectivity.borrow();
                    if is_connected && !was_connected {
                        let Some(shared) = shared.upgrade() else {
                            return;
                        };
                        shared.reprepare_cached_on_node(&node).await;
                    }
                    was_connected = is_connected;
                }
            });
        }
    }
}

fn pager_error_into_execution(error: crate::errors::NextPageError) -> ExecutionError {
    match error {
        crate::errors::NextPageError::Execution(error) => error,
        // The runtime tore the worker down before the first page; there
        // is no more specific cause to report.
        crate::errors::NextPageError::WorkerGone => ExecutionError::EmptyPlan,
    }
}

fn err_to_attempt(err: crate::errors::PartitionKeyError) -> RequestAttemptError {
    RequestAttemptError::Values(typhon_cql::serialize::SerializeError::Unencodable(
        match err {
            crate::errors::PartitionKeyError::UnboundColumn { .. } => {
                "unbound partition key column"
            }
            crate::errors::PartitionKeyError::ValueTooLong { .. } => {
                "partition key component too long"
            }
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    use crate::client::session_builder::SessionBuilder;
    use crate::test_utils::setup_tracing;
    use typhon_cql::frame::types;

    const PREPARED_ID: [u8; 4] = [0xaa; 4];
    const ROTATED_ID: [u8; 4] = [0xbb; 4];

    /// Scripted behavior of one mock node, shared by all its
    /// connections. Counters let tests assert how many requests of each
    /// kind the node actually served.
    #[derive(Default)]
    struct MockNodeBehavior {
        prepare_count: AtomicUsize,
        execute_count: AtomicUsize,
        query_count: AtomicUsize,
        /// Every PREPARE after the first returns a rotated statement id,
        /// simulating a cache keyed to a statement the server replaced.
        rotate_prepared_id: bool,
        /// The first EXECUTE is answered with UNPREPARED.
        fail_first_execute_unprepared: bool,
        /// Every EXECUTE is answered with UNPREPARED.
        always_unprepared: bool,
        /// Every QUERY is answered with IS_BOOTSTRAPPING.
        bootstrapping_on_query: bool,
        /// The first QUERY is answered with a digest-only read timeout,
        /// which the default retry policy retries on the same node.
        read_timeout_once_on_query: bool,
    }

    async fn run_mock_node(listener: TcpListener, behavior: Arc<MockNodeBehavior>) {
        loop {
            let Ok((socket, _)) = listener.accept().await else {
                return;
            };
            tokio::spawn(serve_mock_connection(socket, behavior.clone()));
        }
    }

    async fn serve_mock_connection(mut socket: TcpStream, behavior: Arc<MockNodeBehavior>) {
        loop {
            let mut header = [0u8; 9];
            if socket.read_exact(&mut header).await.is_err() {
                return;
            }
            let stream = i16::from_be_bytes([header[2], header[3]]);
            let opcode = header[4];
            let body_len = u32::from_be_bytes([header[5], header[6], header[7], header[8]]);
            let mut body = vec![0u8; body_len as usize];
            socket.read_exact(&mut body).await.unwrap();

            let (response_opcode, response_body): (u8, Vec<u8>) = match opcode {
                0x05 => {
                    // OPTIONS -> SUPPORTED with no options
                    let mut body = Vec::new();
                    types::write_short(0, &mut body);
                    (0x06, body)
                }
                0x01 => (0x02, Vec::new()), // STARTUP -> READY
                0x07 => {
                    let n = behavior.query_count.fetch_add(1, Ordering::SeqCst);
                    let mut body = Vec::new();
                    if behavior.bootstrapping_on_query {
                        types::write_int(0x1002, &mut body);
                        types::write_string("bootstrapping", &mut body).unwrap();
                        (0x00, body)
                    } else if behavior.read_timeout_once_on_query && n == 0 {
                        types::write_int(0x1200, &mut body);
                        types::write_string("read timeout", &mut body).unwrap();
                        types::write_consistency(Consistency::Quorum, &mut body);
                        types::write_int(2, &mut body); // received
                        types::write_int(2, &mut body); // required
                        body.push(0); // data_present: digests only
                        (0x00, body)
                    } else {
                        types::write_int(0x0001, &mut body);
                        (0x08, body)
                    }
                }
                0x09 => {
                    let n = behavior.prepare_count.fetch_add(1, Ordering::SeqCst);
                    let id = if behavior.rotate_prepared_id && n > 0 {
                        &ROTATED_ID
                    } else {
                        &PREPARED_ID
                    };
                    // RESULT/Prepared with no bind markers and no result
                    // columns.
                    let mut body = Vec::new();
                    types::write_int(0x0004, &mut body);
                    types::write_short_bytes(id, &mut body).unwrap();
                    types::write_int(0, &mut body); // prepared flags
                    types::write_int(0, &mut body); // col count
                    types::write_int(0, &mut body); // pk count
                    types::write_int(0, &mut body); // result flags
                    types::write_int(0, &mut body); // result col count
                    (0x08, body)
                }
                0x0A => {
                    let n = behavior.execute_count.fetch_add(1, Ordering::SeqCst);
                    let unprepared = behavior.always_unprepared
                        || (behavior.fail_first_execute_unprepared && n == 0);
                    let mut body = Vec::new();
                    if unprepared {
                        types::write_int(0x2500, &mut body);
                        types::write_string("unprepared", &mut body).unwrap();
                        types::write_short_bytes(&PREPARED_ID, &mut body).unwrap();
                        (0x00, body)
                    } else {
                        types::write_int(0x0001, &mut body);
                        (0x08, body)
                    }
                }
                other => panic!("mock node got unexpected opcode {other:#04x}"),
            };

            let mut frame = vec![0x84, 0x00];
            frame.extend_from_slice(&stream.to_be_bytes());
            frame.push(response_opcode);
            frame.extend_from_slice(&(response_body.len() as u32).to_be_bytes());
            frame.extend_from_slice(&response_body);
            socket.write_all(&frame).await.unwrap();
        }
    }

    /// Spins up one mock node per behavior and connects a session to
    /// them, in the given order.
    async fn mock_session(behaviors: &[Arc<MockNodeBehavior>]) -> Session {
        setup_tracing();
        let mut builder = SessionBuilder::new().protocol_max_version(ProtocolVersion::V4);
        for behavior in behaviors {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            builder = builder.known_node(listener.local_addr().unwrap().to_string());
            tokio::spawn(run_mock_node(listener, behavior.clone()));
        }
        builder.build().await.unwrap()
    }

    #[tokio::test]
    async fn unprepared_execute_reprepares_transparently_once() {
        let behavior = Arc::new(MockNodeBehavior {
            fail_first_execute_unprepared: true,
            ..Default::default()
        });
        let session = mock_session(std::slice::from_ref(&behavior)).await;

        let prepared = session.prepare("SELECT a FROM ks.t").await.unwrap();
        assert_eq!(behavior.prepare_count.load(Ordering::SeqCst), 1);

        // First EXECUTE gets UNPREPARED; the pipeline reprepares on the
        // same node and retries once, invisibly to the caller.
        let result = session.execute_unpaged(&prepared.bind(vec![])).await.unwrap();
        assert!(!result.is_rows());
        assert_eq!(behavior.prepare_count.load(Ordering::SeqCst), 2);
        assert_eq!(behavior.execute_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_unprepared_after_reprepare_fails_the_request() {
        let behavior = Arc::new(MockNodeBehavior {
            always_unprepared: true,
            ..Default::default()
        });
        let session = mock_session(std::slice::from_ref(&behavior)).await;

        let prepared = session.prepare("SELECT a FROM ks.t").await.unwrap();
        let err = session
            .execute_unpaged(&prepared.bind(vec![]))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            ExecutionError::LastAttempt(RequestAttemptError::Db(
                DbError::Unprepared { .. },
                _
            ))
        );
        // Exactly one repreparation was attempted before giving up.
        assert_eq!(behavior.prepare_count.load(Ordering::SeqCst), 2);
        assert_eq!(behavior.execute_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reprepared_id_rotation_fails_with_id_mismatch() {
        let behavior = Arc::new(MockNodeBehavior {
            fail_first_execute_unprepared: true,
            rotate_prepared_id: true,
            ..Default::default()
        });
        let session = mock_session(std::slice::from_ref(&behavior)).await;

        let prepared = session.prepare("SELECT a FROM ks.t").await.unwrap();
        assert_eq!(prepared.get_id().as_ref(), &PREPARED_ID);

        // Repreparing returns a different id than the cached one; the
        // request must fail fast instead of executing something else.
        let err = session
            .execute_unpaged(&prepared.bind(vec![]))
            .await
            .unwrap_err();
        assert_matches!(
            err,
            ExecutionError::Prepare(PrepareError::IdMismatch {
                expected_id,
                reprepared_id,
            }) if expected_id.as_ref() == &PREPARED_ID[..]
                && reprepared_id.as_ref() == &ROTATED_ID[..]
        );
    }

    #[tokio::test]
    async fn retry_policy_retries_digest_only_read_timeout_on_the_same_node() {
        let behavior = Arc::new(MockNodeBehavior {
            read_timeout_once_on_query: true,
            ..Default::default()
        });
        let session = mock_session(std::slice::from_ref(&behavior)).await;

        let result = session
            .query_unpaged(&Statement::new("SELECT a FROM ks.t"))
            .await
            .unwrap();
        assert!(!result.is_rows());
        // Both the timed-out attempt and the retry hit the same node.
        assert_eq!(behavior.query_count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn retry_policy_moves_to_the_next_node_on_bootstrapping() {
        let bootstrapping = Arc::new(MockNodeBehavior {
            bootstrapping_on_query: true,
            ..Default::default()
        });
        let healthy = Arc::new(MockNodeBehavior::default());
        let session = mock_session(&[bootstrapping.clone(), healthy.clone()]).await;

        // The plan starts at the bootstrapping node; the retry policy
        // sends the request onward instead of failing it.
        let result = session
            .query_unpaged(&Statement::new("SELECT a FROM ks.t"))
            .await
            .unwrap();
        assert!(!result.is_rows());
        assert_eq!(bootstrapping.query_count.load(Ordering::SeqCst), 1);
        assert_eq!(healthy.query_count.load(Ordering::SeqCst), 1);
    }
}
