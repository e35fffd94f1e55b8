//! A single CQL connection: one TCP (optionally TLS) stream, multiplexing
//! requests over stream ids.
//!
//! The connection spawns a router task internally composed of four
//! cooperating loops: `reader` (deframes responses and completes pending
//! requests), `writer` (allocates stream ids and writes serialized
//! frames), `orphaner` (reclaims stream ids whose requesters went away)
//! and `keepaliver` (issues OPTIONS when the link idles). The failure of
//! any loop breaks the connection and fails every pending request.

use std::borrow::Cow;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BTreeSet, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use bytes::Bytes;
use futures::future::RemoteHandle;
use futures::FutureExt;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{split, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, error, trace, warn};

use crate::authentication::AuthenticatorProvider;
use crate::errors::{
    AuthError, BadKeyspaceName, BrokenConnectionError, BrokenConnectionErrorKind,
    ConnectionError, ConnectionSetupError, RequestAttemptError, UseKeyspaceError,
};
use crate::response::QueryResponse;
use crate::routing::sharding::{Shard, ShardAwarePortRange, ShardInfo};
use typhon_cql::frame::request::{
    self, execute, query, AuthResponse, Batch, Options, Prepare, Register, SerializableRequest,
    Startup,
};
use typhon_cql::frame::response::event::{Event, EventType};
use typhon_cql::frame::response::result::{CqlResult, Prepared};
use typhon_cql::frame::response::{Error as ErrorResponse, Response, ResponseOpcode};
use typhon_cql::frame::response::error::DbError;
use typhon_cql::frame::{
    self, frame_errors::FrameError, FrameParams, SerializedRequest,
};
use typhon_cql::value::ColumnSpec;
use typhon_cql::{Compression, ProtocolVersion};

// A stream id is "orphaned" when the future awaiting its response was
// dropped (cancelled or timed out). The id stays reserved until the late
// response arrives. A connection accumulating many old orphans is not
// getting responses anymore and gets shut down by the orphaner.
const OLD_ORPHAN_COUNT_THRESHOLD: usize = 1024;

type RequestId = u64;

/// Configuration of connections to one endpoint.
#[derive(Clone)]
pub(crate) struct HostConnectionConfig {
    pub(crate) protocol_version: ProtocolVersion,
    pub(crate) compression: Option<Compression>,
    pub(crate) use_beta: bool,
    pub(crate) tcp_nodelay: bool,
    pub(crate) tcp_keepalive_interval: Option<Duration>,
    pub(crate) connect_timeout: Duration,
    /// Heartbeat period; `None` disables heartbeats.
    pub(crate) keepalive_interval: Option<Duration>,
    pub(crate) keepalive_timeout: Option<Duration>,
    /// How long an orphaned stream id may wait for its late response
    /// before counting towards defuncting the connection.
    pub(crate) defunct_read_timeout: Duration,
    /// Set only on connections that should receive server events.
    pub(crate) event_sender: Option<mpsc::Sender<Event>>,
    pub(crate) authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    pub(crate) keyspace_to_use: Option<VerifiedKeyspaceName>,
    pub(crate) shard_aware_local_port_range: ShardAwarePortRange,
    #[cfg(feature = "rustls-023")]
    pub(crate) tls_config: Option<super::tls::TlsConfig>,
}

impl Default for HostConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_version: ProtocolVersion::LATEST,
            compression: None,
            use_beta: false,
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            connect_timeout: Duration::from_secs(5),
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            defunct_read_timeout: Duration::from_secs(1),
            event_sender: None,
            authenticator: None,
            keyspace_to_use: None,
            shard_aware_local_port_range: ShardAwarePortRange::EPHEMERAL_PORT_RANGE,
            #[cfg(feature = "rustls-023")]
            tls_config: None,
        }
    }
}

impl HostConnectionConfig {
    pub(crate) fn is_tls(&self) -> bool {
        #[cfg(feature = "rustls-023")]
        {
            self.tls_config.is_some()
        }
        #[cfg(not(feature = "rustls-023"))]
        false
    }
}

/// Capabilities learned from the SUPPORTED response.
#[derive(Default, Debug, Clone)]
pub(crate) struct ConnectionFeatures {
    pub(crate) shard_info: Option<ShardInfo>,
    /// Scylla marks prepared LWT statements with this bit in the
    /// prepared-metadata flags, when the extension is advertised.
    pub(crate) lwt_optimization_mask: Option<u32>,
}

/// Listens for the fatal error of a connection.
pub(crate) type ErrorReceiver = oneshot::Receiver<ConnectionError>;

struct ResponseHandler {
    response_sender: oneshot::Sender<Result<TaskResponse, RequestAttemptError>>,
    request_id: RequestId,
}

struct Task {
    serialized_request: SerializedRequest,
    response_handler: ResponseHandler,
}

struct TaskResponse {
    params: FrameParams,
    opcode: ResponseOpcode,
    body: Bytes,
}

/// Notifies the router when a `send_request` future is dropped before its
/// response arrived, so the stream id can be marked orphaned.
struct OrphanhoodNotifier<'a> {
    enabled: bool,
    request_id: RequestId,
    notification_sender: &'a mpsc::UnboundedSender<RequestId>,
}

impl<'a> OrphanhoodNotifier<'a> {
    fn new(
        request_id: RequestId,
        notification_sender: &'a mpsc::UnboundedSender<RequestId>,
    ) -> Self {
        Self {
            enabled: true,
            request_id,
            notification_sender,
        }
    }

    fn disable(mut self) {
        self.enabled = false;
    }
}

impl Drop for OrphanhoodNotifier<'_> {
    fn drop(&mut self) {
        if self.enabled {
            let _ = self.notification_sender.send(self.request_id);
        }
    }
}

struct RouterHandle {
    submit_channel: mpsc::Sender<Task>,
    request_id_generator: AtomicU64,
    // Unbounded so that Drop impls can push without awaiting.
    orphan_notification_sender: mpsc::UnboundedSender<RequestId>,
}

impl RouterHandle {
    fn allocate_request_id(&self) -> RequestId {
        self.request_id_generator.fetch_add(1, Ordering::Relaxed)
    }

    async fn send_request(
        &self,
        serialized_request: SerializedRequest,
    ) -> Result<TaskResponse, RequestAttemptError> {
        let request_id = self.allocate_request_id();
        let (response_sender, receiver) = oneshot::channel();
        let response_handler = ResponseHandler {
            response_sender,
            request_id,
        };

        let notifier = OrphanhoodNotifier::new(request_id, &self.orphan_notification_sender);

        // Both channel ends close only when the Connection is dropped;
        // a broken connection instead fails the handler explicitly with
        // the broken-connection cause.
        self.submit_channel
            .send(Task {
                serialized_request,
                response_handler,
            })
            .await
            .map_err(|_| RequestAttemptError::ConnectionClosed)?;

        let task_response = receiver
            .await
            .map_err(|_| RequestAttemptError::ConnectionClosed)?;

        // Response received; the stream id will not be orphaned.
        notifier.disable();

        task_response
    }
}

/// One open connection. Dropping it stops the router task and thereby
/// cancels every pending request with `ConnectionClosed`.
pub(crate) struct Connection {
    _worker_handle: RemoteHandle<()>,
    connect_address: SocketAddr,
    config: HostConnectionConfig,
    features: ConnectionFeatures,
    router_handle: Arc<RouterHandle>,
    in_flight: AtomicUsize,
}

/// Decrements the connection's in-flight counter when an attempt ends,
/// however it ends.
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::Relaxed);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::Relaxed);
    }
}

impl Connection {
    /// Opens the TCP (or TLS) stream and spawns the router. No CQL
    /// frames are exchanged yet.
    async fn new(
        connect_address: SocketAddr,
        source_port: Option<u16>,
        config: HostConnectionConfig,
    ) -> Result<(Self, ErrorReceiver), ConnectionError> {
        let stream = tokio::time::timeout(
            config.connect_timeout,
            connect_with_source_port(connect_address, source_port),
        )
        .await
        .map_err(|_| ConnectionError::ConnectTimeout)??;

        stream.set_nodelay(config.tcp_nodelay)?;
        if let Some(interval) = config.tcp_keepalive_interval {
            Self::setup_tcp_keepalive(&stream, interval)?;
        }

        let (sender, receiver) = mpsc::channel(1024);
        let (error_sender, error_receiver) = oneshot::channel();
        let (orphan_notification_sender, orphan_notification_receiver) =
            mpsc::unbounded_channel();

        let router_handle = Arc::new(RouterHandle {
            submit_channel: sender,
            request_id_generator: AtomicU64::new(0),
            orphan_notification_sender,
        });

        let _worker_handle = Self::run_router(
            config.clone(),
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
            router_handle.clone(),
            connect_address.ip(),
        )
        .await?;

        let connection = Connection {
            _worker_handle,
            connect_address,
            config,
            features: Default::default(),
            router_handle,
            in_flight: AtomicUsize::new(0),
        };

        Ok((connection, error_receiver))
    }

    fn setup_tcp_keepalive(
        stream: &TcpStream,
        tcp_keepalive_interval: Duration,
    ) -> std::io::Result<()> {
        let mut tcp_keepalive = TcpKeepalive::new().with_time(tcp_keepalive_interval);

        #[cfg(any(target_os = "android", target_os = "linux", target_os = "macos"))]
        {
            tcp_keepalive = tcp_keepalive.with_interval(Duration::from_secs(1));
        }
        #[cfg(any(target_os = "android", target_os = "linux", target_os = "macos"))]
        {
            tcp_keepalive = tcp_keepalive.with_retries(10);
        }

        let sf = SockRef::from(stream);
        sf.set_tcp_keepalive(&tcp_keepalive)
    }

    pub(crate) fn get_connect_address(&self) -> SocketAddr {
        self.connect_address
    }

    pub(crate) fn features(&self) -> &ConnectionFeatures {
        &self.features
    }

    /// The shard this connection landed on, when the node is
    /// shard-aware.
    pub(crate) fn get_shard(&self) -> Option<Shard> {
        self.features
            .shard_info
            .as_ref()
            .map(|info| info.shard as Shard)
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Serializes and sends a request, returning the parsed response.
    /// `cached_metadata` supplies column specs for skip-metadata EXECUTE
    /// responses.
    async fn send_request(
        &self,
        request: &impl SerializableRequest,
        compress: bool,
        tracing: bool,
        cached_metadata: Option<&[ColumnSpec]>,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let version = self.config.protocol_version;
        let compression = if compress {
            self.config.compression
        } else {
            None
        };
        let serialized_request =
            SerializedRequest::make(request, version, compression, tracing, self.config.use_beta)
                .map_err(frame_error_to_attempt_error)?;

        let _in_flight = InFlightGuard::new(&self.in_flight);
        let task_response = self.router_handle.send_request(serialized_request).await?;

        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            self.config.compression,
            task_response.body,
        )
        .map_err(frame_error_to_attempt_error)?;

        let response = Response::deserialize(
            version,
            task_response.opcode,
            &body_with_ext.body,
            cached_metadata,
        )?;

        Ok(QueryResponse {
            response,
            tracing_id: body_with_ext.trace_id,
            warnings: body_with_ext.warnings,
        })
    }

    async fn get_options(&self) -> Result<typhon_cql::frame::response::Supported, ConnectionSetupError> {
        let response = self
            .send_request(&Options, false, false, None)
            .await?;
        match response.response {
            Response::Supported(supported) => Ok(supported),
            Response::Error(ErrorResponse { error, reason }) => {
                Err(ConnectionSetupError::Db(error, reason))
            }
            other => Err(ConnectionSetupError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    async fn startup(&self) -> Result<Response, ConnectionSetupError> {
        let mut options: HashMap<Cow<'_, str>, Cow<'_, str>> = HashMap::new();
        options.insert(
            Cow::Borrowed(request::startup::CQL_VERSION),
            Cow::Borrowed(request::startup::DEFAULT_CQL_PROTOCOL_VERSION),
        );
        options.insert(
            Cow::Borrowed(request::startup::DRIVER_NAME),
            Cow::Borrowed(request::startup::DEFAULT_DRIVER_NAME),
        );
        options.insert(
            Cow::Borrowed(request::startup::DRIVER_VERSION),
            Cow::Borrowed(request::startup::DEFAULT_DRIVER_VERSION),
        );
        if let Some(compression) = self.config.compression {
            options.insert(
                Cow::Borrowed(request::startup::COMPRESSION),
                Cow::Owned(compression.to_string()),
            );
        }

        // STARTUP itself is never compressed; compression starts with the
        // next frame.
        let response = self
            .send_request(&Startup { options }, false, false, None)
            .await?;
        Ok(response.response)
    }

    async fn perform_authenticate(
        &self,
        authenticator_name: &str,
    ) -> Result<(), ConnectionSetupError> {
        let Some(provider) = &self.config.authenticator else {
            return Err(ConnectionSetupError::Auth(AuthError::MissingAuthenticator));
        };

        let (mut response_bytes, mut session) = provider
            .start_authentication_session(authenticator_name)
            .await
            .map_err(ConnectionSetupError::Auth)?;

        loop {
            let reply = self
                .send_request(
                    &AuthResponse {
                        response: response_bytes,
                    },
                    true,
                    false,
                    None,
                )
                .await?;
            match reply.response {
                Response::AuthChallenge(challenge) => {
                    response_bytes = session
                        .evaluate_challenge(challenge.authenticate_message.as_deref())
                        .await
                        .map_err(ConnectionSetupError::Auth)?;
                }
                Response::AuthSuccess(success) => {
                    session
                        .success(success.success_message.as_deref())
                        .await
                        .map_err(ConnectionSetupError::Auth)?;
                    return Ok(());
                }
                Response::Error(ErrorResponse { error, reason }) => {
                    return Err(ConnectionSetupError::Db(error, reason));
                }
                other => {
                    return Err(ConnectionSetupError::UnexpectedResponse(
                        other.to_response_kind(),
                    ));
                }
            }
        }
    }

    pub(crate) async fn register(
        &self,
        event_types: Vec<EventType>,
    ) -> Result<(), RequestAttemptError> {
        let response = self
            .send_request(
                &Register {
                    event_types_to_register_for: event_types,
                },
                true,
                false,
                None,
            )
            .await?;
        match response.response {
            Response::Ready => Ok(()),
            Response::Error(ErrorResponse { error, reason }) => {
                Err(RequestAttemptError::Db(error, reason))
            }
            other => Err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    /// Executes a QUERY with the given parameters.
    pub(crate) async fn query_raw(
        &self,
        contents: &str,
        parameters: query::QueryParameters<'_>,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let query = query::Query {
            contents: Cow::Borrowed(contents),
            parameters,
        };
        self.send_request(&query, true, tracing, None).await
    }

    /// Executes an EXECUTE for a prepared statement.
    pub(crate) async fn execute_raw(
        &self,
        id: Bytes,
        result_metadata_id: Option<Bytes>,
        parameters: query::QueryParameters<'_>,
        cached_metadata: Option<&[ColumnSpec]>,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        let execute = execute::Execute {
            id,
            result_metadata_id,
            parameters,
        };
        self.send_request(&execute, true, tracing, cached_metadata)
            .await
    }

    /// Executes a BATCH.
    pub(crate) async fn batch_raw(
        &self,
        batch: Batch<'_>,
        tracing: bool,
    ) -> Result<QueryResponse, RequestAttemptError> {
        self.send_request(&batch, true, tracing, None).await
    }

    /// Prepares a statement on this connection.
    pub(crate) async fn prepare_raw(
        &self,
        contents: &str,
        keyspace: Option<&str>,
        tracing: bool,
    ) -> Result<Prepared, RequestAttemptError> {
        let keyspace = if self.config.protocol_version.supports_per_request_keyspace() {
            keyspace.map(Cow::Borrowed)
        } else {
            // Older protocols prepare in the connection's keyspace.
            None
        };
        let response = self
            .send_request(
                &Prepare {
                    query: contents,
                    keyspace,
                },
                true,
                tracing,
                None,
            )
            .await?;
        match response.response {
            Response::Result(CqlResult::Prepared(prepared)) => Ok(prepared),
            Response::Error(ErrorResponse { error, reason }) => {
                Err(RequestAttemptError::Db(error, reason))
            }
            other => Err(RequestAttemptError::UnexpectedResponse(
                other.to_response_kind(),
            )),
        }
    }

    /// Reprepares a statement whose id the server lost, verifying the
    /// returned id still matches the cached one.
    pub(crate) async fn reprepare(
        &self,
        contents: &str,
        keyspace: Option<&str>,
        expected_id: &Bytes,
    ) -> Result<(), RequestAttemptError> {
        let prepared = self.prepare_raw(contents, keyspace, false).await?;
        // Statement ids are content hashes, so a changed id means the
        // statement now refers to something else than what was cached.
        if prepared.id != *expected_id {
            return Err(RequestAttemptError::RepreparedIdChanged {
                statement: contents.to_owned(),
                expected_id: expected_id.clone(),
                reprepared_id: prepared.id,
            });
        }
        Ok(())
    }

    /// Switches the connection to a keyspace via `USE`, verifying that
    /// the server ended up in the keyspace that was asked for.
    pub(crate) async fn use_keyspace(
        &self,
        keyspace_name: &VerifiedKeyspaceName,
    ) -> Result<(), UseKeyspaceError> {
        // A keyspace name cannot be a bind marker, so quote it inline.
        let query_text = if keyspace_name.is_case_sensitive {
            format!("USE \"{}\"", keyspace_name.as_str())
        } else {
            format!("USE {}", keyspace_name.as_str())
        };

        let response = self
            .query_raw(&query_text, query::QueryParameters::default(), false)
            .await
            .map_err(UseKeyspaceError::Attempt)?;
        match response.response {
            Response::Result(CqlResult::SetKeyspace(set_keyspace)) => {
                // Names of case-insensitive keyspaces come back
                // lowercased, so compare ignoring case.
                if !set_keyspace
                    .keyspace_name
                    .eq_ignore_ascii_case(keyspace_name.as_str())
                {
                    let expected = keyspace_name.as_str().to_owned();
                    let received = set_keyspace.keyspace_name;
                    error!(
                        "Connection to {} switched to unexpected keyspace {}, expected {}",
                        self.connect_address, received, expected,
                    );
                    return Err(UseKeyspaceError::KeyspaceNameMismatch { expected, received });
                }
                debug!(
                    "Connection to {} switched to keyspace {}",
                    self.connect_address, set_keyspace.keyspace_name
                );
                Ok(())
            }
            Response::Error(ErrorResponse { error, reason }) => {
                Err(UseKeyspaceError::Attempt(RequestAttemptError::Db(
                    error, reason,
                )))
            }
            other => Err(UseKeyspaceError::Attempt(
                RequestAttemptError::UnexpectedResponse(other.to_response_kind()),
            )),
        }
    }

    async fn run_router(
        config: HostConnectionConfig,
        stream: TcpStream,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        router_handle: Arc<RouterHandle>,
        node_address: IpAddr,
    ) -> Result<RemoteHandle<()>, ConnectionError> {
        async fn spawn_router(
            config: HostConnectionConfig,
            stream: impl AsyncRead + AsyncWrite + Send + 'static,
            receiver: mpsc::Receiver<Task>,
            error_sender: oneshot::Sender<ConnectionError>,
            orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
            router_handle: Arc<RouterHandle>,
            node_address: IpAddr,
        ) -> RemoteHandle<()> {
            let (task, handle) = Connection::router(
                config,
                stream,
                receiver,
                error_sender,
                orphan_notification_receiver,
                router_handle,
                node_address,
            )
            .remote_handle();
            tokio::task::spawn(task);
            handle
        }

        #[cfg(feature = "rustls-023")]
        if let Some(tls_config) = &config.tls_config {
            let stream = tls_config.connect(node_address, stream).await?;
            return Ok(spawn_router(
                config.clone(),
                stream,
                receiver,
                error_sender,
                orphan_notification_receiver,
                router_handle,
                node_address,
            )
            .await);
        }

        Ok(spawn_router(
            config,
            stream,
            receiver,
            error_sender,
            orphan_notification_receiver,
            router_handle,
            node_address,
        )
        .await)
    }

    async fn router(
        config: HostConnectionConfig,
        stream: impl AsyncRead + AsyncWrite,
        receiver: mpsc::Receiver<Task>,
        error_sender: oneshot::Sender<ConnectionError>,
        orphan_notification_receiver: mpsc::UnboundedReceiver<RequestId>,
        router_handle: Arc<RouterHandle>,
        node_address: IpAddr,
    ) {
        let (read_half, write_half) = split(stream);

        // Shared between the reader and writer halves, which run on the
        // same task and never hold the lock across an await point, so
        // try_lock always succeeds.
        let handler_map = StdMutex::new(ResponseHandlerMap::new(
            config.protocol_version.max_streams(),
            config.defunct_read_timeout,
        ));

        let r = Self::reader(
            BufReader::with_capacity(8192, read_half),
            &handler_map,
            config.protocol_version,
            config.event_sender.clone(),
            config.compression,
        );
        let w = Self::writer(
            BufWriter::with_capacity(8192, write_half),
            &handler_map,
            receiver,
        );
        let o = Self::orphaner(&handler_map, orphan_notification_receiver, config.defunct_read_timeout);
        let k = Self::keepaliver(
            router_handle,
            config.protocol_version,
            config.keepalive_interval,
            config.keepalive_timeout,
            node_address,
        );

        let result = futures::try_join!(r, w, o, k);
        let error: BrokenConnectionError = match result {
            Ok(_) => return, // The Connection was dropped; a clean stop.
            Err(err) => err,
        };

        // Fail all pending requests with the broken-connection error.
        let response_handlers: HashMap<i16, ResponseHandler> =
            handler_map.into_inner().unwrap().into_handlers();
        for (_, handler) in response_handlers {
            let _ = handler
                .response_sender
                .send(Err(error.clone().into()));
        }

        let _ = error_sender.send(error.into());
    }

    async fn reader(
        mut read_half: impl AsyncRead + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        version: ProtocolVersion,
        event_sender: Option<mpsc::Sender<Event>>,
        compression: Option<Compression>,
    ) -> Result<(), BrokenConnectionError> {
        loop {
            let (params, opcode, body) = frame::read_response_frame(&mut read_half, version)
                .await
                .map_err(BrokenConnectionErrorKind::FrameHeaderParse)?;
            let response = TaskResponse {
                params,
                opcode,
                body,
            };

            match params.stream.cmp(&-1) {
                CmpOrdering::Less => {
                    // Negative streams are reserved for server events;
                    // only -1 is in use.
                    continue;
                }
                CmpOrdering::Equal => {
                    if let Some(event_sender) = event_sender.as_ref() {
                        Self::handle_event(response, version, compression, event_sender)
                            .await
                            .map_err(BrokenConnectionErrorKind::EventHandling)?;
                    }
                    continue;
                }
                CmpOrdering::Greater => {}
            }

            let handler_lookup_res = {
                let mut handler_map_guard = handler_map.try_lock().unwrap();
                handler_map_guard.lookup(params.stream)
            };

            match handler_lookup_res {
                HandlerLookupResult::Handler(handler) => {
                    // A send error just means the requester stopped
                    // waiting; drop the response.
                    let _ = handler.response_sender.send(Ok(response));
                }
                HandlerLookupResult::Orphaned => {
                    // Late response to a cancelled request; id reclaimed.
                }
                HandlerLookupResult::Missing => {
                    debug!("Received response with unexpected stream id {}", params.stream);
                    return Err(
                        BrokenConnectionErrorKind::UnexpectedStreamId(params.stream).into(),
                    );
                }
            }
        }
    }

    fn alloc_stream_id(
        handler_map: &StdMutex<ResponseHandlerMap>,
        response_handler: ResponseHandler,
    ) -> Option<i16> {
        let mut handler_map_guard = handler_map.try_lock().unwrap();
        match handler_map_guard.allocate(response_handler) {
            Ok(stream_id) => Some(stream_id),
            Err(response_handler) => {
                error!("Could not allocate stream id");
                let _ = response_handler
                    .response_sender
                    .send(Err(RequestAttemptError::UnableToAllocStreamId));
                None
            }
        }
    }

    async fn writer(
        mut write_half: impl AsyncWrite + Unpin,
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut task_receiver: mpsc::Receiver<Task>,
    ) -> Result<(), BrokenConnectionError> {
        // When the Connection is dropped the channel closes and this
        // loop (and with it the whole router) finishes cleanly.
        while let Some(mut task) = task_receiver.recv().await {
            let mut num_requests = 0;
            loop {
                if let Some(stream_id) = Self::alloc_stream_id(handler_map, task.response_handler)
                {
                    let mut req = task.serialized_request;
                    req.set_stream(stream_id);
                    num_requests += 1;
                    write_half
                        .write_all(req.get_data())
                        .await
                        .map_err(BrokenConnectionErrorKind::Write)?;
                }
                // Coalesce whatever is already enqueued into one flush.
                match task_receiver.try_recv() {
                    Ok(next) => task = next,
                    Err(_) => break,
                }
            }
            trace!("Flushing {} requests", num_requests);
            write_half
                .flush()
                .await
                .map_err(BrokenConnectionErrorKind::Write)?;
        }

        Ok(())
    }

    // Receives orphan notifications and periodically checks how many old
    // orphans there are; past the threshold the connection is broken so
    // the pool replaces it.
    async fn orphaner(
        handler_map: &StdMutex<ResponseHandlerMap>,
        mut orphan_receiver: mpsc::UnboundedReceiver<RequestId>,
        orphan_age_threshold: Duration,
    ) -> Result<(), BrokenConnectionError> {
        let mut interval = tokio::time::interval(orphan_age_threshold);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let handler_map_guard = handler_map.try_lock().unwrap();
                    let old_orphan_count = handler_map_guard.old_orphans_count();
                    if old_orphan_count > OLD_ORPHAN_COUNT_THRESHOLD {
                        warn!("Too many old orphaned stream ids: {}", old_orphan_count);
                        return Err(BrokenConnectionErrorKind::TooManyOrphanedStreamIds(
                            old_orphan_count,
                        )
                        .into());
                    }
                }
                Some(request_id) = orphan_receiver.recv() => {
                    trace!(
                        "Orphaning the stream id associated with request_id {}",
                        request_id
                    );
                    let mut handler_map_guard = handler_map.try_lock().unwrap();
                    handler_map_guard.orphan(request_id);
                }
                else => break,
            }
        }

        Ok(())
    }

    async fn keepaliver(
        router_handle: Arc<RouterHandle>,
        version: ProtocolVersion,
        keepalive_interval: Option<Duration>,
        keepalive_timeout: Option<Duration>,
        node_address: IpAddr,
    ) -> Result<(), BrokenConnectionError> {
        async fn issue_keepalive_request(
            router_handle: &RouterHandle,
            version: ProtocolVersion,
        ) -> Result<(), BrokenConnectionError> {
            let serialized = SerializedRequest::make(&Options, version, None, false, false)
                .map_err(|err| -> BrokenConnectionError {
                    BrokenConnectionErrorKind::KeepaliveQuery(frame_error_to_attempt_error(err))
                        .into()
                })?;
            router_handle
                .send_request(serialized)
                .await
                .map(|_| ())
                .map_err(|err| BrokenConnectionErrorKind::KeepaliveQuery(err).into())
        }

        let Some(keepalive_interval) = keepalive_interval else {
            return Ok(());
        };

        let mut interval = tokio::time::interval(keepalive_interval);
        interval.tick().await; // Consume the first, instant tick.
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let keepalive = issue_keepalive_request(&router_handle, version);
            let result = if let Some(timeout) = keepalive_timeout {
                match tokio::time::timeout(timeout, keepalive).await {
                    Ok(res) => res,
                    Err(_) => {
                        warn!(
                            "Timed out waiting for keepalive response on connection to {}",
                            node_address
                        );
                        return Err(BrokenConnectionErrorKind::KeepaliveTimeout.into());
                    }
                }
            } else {
                keepalive.await
            };

            if let Err(err) = result {
                warn!(
                    "Keepalive request failed on connection to {}: {}",
                    node_address, err
                );
                return Err(err);
            }
            trace!("Keepalive request successful on connection to {}", node_address);
        }
    }

    async fn handle_event(
        task_response: TaskResponse,
        version: ProtocolVersion,
        compression: Option<Compression>,
        event_sender: &mpsc::Sender<Event>,
    ) -> Result<(), typhon_cql::frame::frame_errors::ResponseParseError> {
        let body_with_ext = frame::parse_response_body_extensions(
            task_response.params.flags,
            compression,
            task_response.body,
        )
        .map_err(|err| {
            typhon_cql::frame::frame_errors::ResponseParseError::LowLevel(
                std::io::Error::other(err).into(),
            )
        })?;

        let response =
            Response::deserialize(version, task_response.opcode, &body_with_ext.body, None)?;
        let event = match response {
            Response::Event(event) => event,
            other => {
                warn!("Expected EVENT on stream -1, got {}", other.to_response_kind());
                return Ok(());
            }
        };

        if event_sender.send(event).await.is_err() {
            warn!("Some server event was not handled: the receiver is gone");
        }
        Ok(())
    }
}

fn frame_error_to_attempt_error(err: FrameError) -> RequestAttemptError {
    match err {
        FrameError::RequestSerialization(err) => err.into(),
        other => RequestAttemptError::Broken(
            BrokenConnectionErrorKind::FrameHeaderParse(other).into(),
        ),
    }
}

async fn connect_with_source_port(
    connect_address: SocketAddr,
    source_port: Option<u16>,
) -> Result<TcpStream, std::io::Error> {
    // A specific source port carries the shard intent; an ephemeral one
    // leaves shard assignment to the server.
    match source_port {
        Some(port) => {
            let socket = if connect_address.is_ipv4() {
                TcpSocket::new_v4()?
            } else {
                TcpSocket::new_v6()?
            };
            socket.set_reuseaddr(true)?;
            let unspecified: IpAddr = if connect_address.is_ipv4() {
                std::net::Ipv4Addr::UNSPECIFIED.into()
            } else {
                std::net::Ipv6Addr::UNSPECIFIED.into()
            };
            socket.bind(SocketAddr::new(unspecified, port))?;
            Ok(socket.connect(connect_address).await?)
        }
        None => Ok(TcpStream::connect(connect_address).await?),
    }
}

/// Opens a connection and performs the whole handshake: OPTIONS,
/// STARTUP, authentication, event registration and keyspace selection.
pub(crate) async fn open_connection(
    endpoint: SocketAddr,
    source_port: Option<u16>,
    config: &HostConnectionConfig,
) -> Result<(Connection, ErrorReceiver), ConnectionError> {
    let (mut connection, error_receiver) =
        Connection::new(endpoint, source_port, config.clone()).await?;

    // OPTIONS → SUPPORTED: learn sharding and compression capabilities.
    let supported = connection.get_options().await?;

    let shard_info = match ShardInfo::try_from(&supported.options) {
        Ok(info) => Some(info),
        Err(crate::routing::sharding::ShardingError::NoShardInfo) => None,
        Err(err) => {
            return Err(ConnectionSetupError::Sharding(err.to_string()).into());
        }
    };
    let lz4_supported = supported
        .options
        .get("COMPRESSION")
        .is_some_and(|algos| algos.iter().any(|a| a == "lz4"));

    let lwt_optimization_mask = supported
        .options
        .get("SCYLLA_LWT_ADD_METADATA_MARK")
        .and_then(|values| values.first())
        .and_then(|value| value.strip_prefix("LWT_OPTIMIZATION_META_BIT_MASK="))
        .and_then(|mask| mask.parse::<u32>().ok());

    if connection.config.compression == Some(Compression::Lz4) && !lz4_supported {
        warn!(
            "Node {} does not support lz4 compression; disabling it for this connection",
            endpoint
        );
        connection.config.compression = None;
    }

    connection.features = ConnectionFeatures {
        shard_info,
        lwt_optimization_mask,
    };

    // STARTUP → READY, or AUTHENTICATE followed by the SASL exchange.
    match connection.startup().await? {
        Response::Ready => {}
        Response::Authenticate(authenticate) => {
            connection
                .perform_authenticate(&authenticate.authenticator_name)
                .await?;
        }
        Response::Error(ErrorResponse { error, reason }) => {
            return Err(ConnectionSetupError::Db(error, reason).into());
        }
        other => {
            return Err(
                ConnectionSetupError::UnexpectedResponse(other.to_response_kind()).into(),
            );
        }
    }

    if connection.config.event_sender.is_some() {
        connection
            .register(vec![
                EventType::TopologyChange,
                EventType::StatusChange,
                EventType::SchemaChange,
            ])
            .await
            .map_err(ConnectionSetupError::from)?;
    }

    if let Some(keyspace) = connection.config.keyspace_to_use.clone() {
        connection
            .use_keyspace(&keyspace)
            .await
            .map_err(ConnectionSetupError::from)?;
    }

    Ok((connection, error_receiver))
}

/// Whether a handshake failure means the server rejected our protocol
/// version, so a lower one is worth trying.
pub(crate) fn is_protocol_version_rejection(error: &ConnectionError) -> bool {
    matches!(
        error,
        ConnectionError::Setup(ConnectionSetupError::Db(DbError::ProtocolError, _))
    )
}

struct OrphanageTracker {
    orphans: HashMap<i16, Instant>,
    by_orphaning_times: BTreeSet<(Instant, i16)>,
}

impl OrphanageTracker {
    fn new() -> Self {
        Self {
            orphans: HashMap::new(),
            by_orphaning_times: BTreeSet::new(),
        }
    }

    fn insert(&mut self, stream_id: i16) {
        let now = Instant::now();
        self.orphans.insert(stream_id, now);
        self.by_orphaning_times.insert((now, stream_id));
    }

    fn remove(&mut self, stream_id: i16) {
        if let Some(time) = self.orphans.remove(&stream_id) {
            self.by_orphaning_times.remove(&(time, stream_id));
        }
    }

    fn contains(&self, stream_id: i16) -> bool {
        self.orphans.contains_key(&stream_id)
    }

    fn orphans_older_than(&self, age: Duration) -> usize {
        let minimal_age = Instant::now() - age;
        // Linear in the number of OLD orphans; a healthy connection has
        // none, so this is cheap.
        self.by_orphaning_times
            .range(..(minimal_age, i16::MAX))
            .count()
    }
}

struct ResponseHandlerMap {
    stream_set: StreamIdSet,
    handlers: HashMap<i16, ResponseHandler>,
    request_to_stream: HashMap<RequestId, i16>,
    orphanage_tracker: OrphanageTracker,
    orphan_age_threshold: Duration,
}

enum HandlerLookupResult {
    Orphaned,
    Handler(ResponseHandler),
    Missing,
}

impl ResponseHandlerMap {
    fn new(max_streams: usize, orphan_age_threshold: Duration) -> Self {
        Self {
            stream_set: StreamIdSet::new(max_streams),
            handlers: HashMap::new(),
            request_to_stream: HashMap::new(),
            orphanage_tracker: OrphanageTracker::new(),
            orphan_age_threshold,
        }
    }

    fn allocate(&mut self, response_handler: ResponseHandler) -> Result<i16, ResponseHandler> {
        if let Some(stream_id) = self.stream_set.allocate() {
            self.request_to_stream
                .insert(response_handler.request_id, stream_id);
            let prev_handler = self.handlers.insert(stream_id, response_handler);
            assert!(prev_handler.is_none());
            Ok(stream_id)
        } else {
            Err(response_handler)
        }
    }

    // Moves the stream id associated with this request to the orphanage
    // and frees its handler; the id itself stays reserved until the late
    // response shows up.
    fn orphan(&mut self, request_id: RequestId) {
        if let Some(stream_id) = self.request_to_stream.get(&request_id) {
            debug!(
                "Orphaning stream_id = {} associated with request_id = {}",
                stream_id, request_id
            );
            self.orphanage_tracker.insert(*stream_id);
            self.handlers.remove(stream_id);
            self.request_to_stream.remove(&request_id);
        }
    }

    fn old_orphans_count(&self) -> usize {
        self.orphanage_tracker
            .orphans_older_than(self.orphan_age_threshold)
    }

    fn lookup(&mut self, stream_id: i16) -> HandlerLookupResult {
        self.stream_set.free(stream_id);

        if self.orphanage_tracker.contains(stream_id) {
            self.orphanage_tracker.remove(stream_id);
            return HandlerLookupResult::Orphaned;
        }

        if let Some(handler) = self.handlers.remove(&stream_id) {
            // Drop the request mapping so a late orphan notification
            // cannot orphan a recycled stream id.
            self.request_to_stream.remove(&handler.request_id);
            HandlerLookupResult::Handler(handler)
        } else {
            HandlerLookupResult::Missing
        }
    }

    // Used after the connection breaks to fail all pending requests.
    fn into_handlers(self) -> HashMap<i16, ResponseHandler> {
        self.handlers
    }
}

struct StreamIdSet {
    used_bitmap: Box<[u64]>,
    max_streams: usize,
}

impl StreamIdSet {
    fn new(max_streams: usize) -> Self {
        let words = max_streams.div_ceil(64);
        Self {
            used_bitmap: vec![0; words].into_boxed_slice(),
            max_streams,
        }
    }

    fn allocate(&mut self) -> Option<i16> {
        for (block_id, block) in self.used_bitmap.iter_mut().enumerate() {
            if *block != !0 {
                let off = block.trailing_ones();
                let stream_id = off as usize + block_id * 64;
                if stream_id >= self.max_streams {
                    return None;
                }
                *block |= 1u64 << off;
                return Some(stream_id as i16);
            }
        }
        None
    }

    fn free(&mut self, stream_id: i16) {
        let block_id = stream_id as usize / 64;
        let off = stream_id as usize % 64;
        self.used_bitmap[block_id] &= !(1 << off);
    }
}

/// A keyspace name the driver verified it can safely interpolate into a
/// `USE` statement.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) struct VerifiedKeyspaceName {
    name: Arc<String>,
    pub(crate) is_case_sensitive: bool,
}

impl VerifiedKeyspaceName {
    pub(crate) fn new(
        keyspace_name: String,
        case_sensitive: bool,
    ) -> Result<Self, BadKeyspaceName> {
        Self::verify(&keyspace_name)?;
        Ok(VerifiedKeyspaceName {
            name: Arc::new(keyspace_name),
            is_case_sensitive: case_sensitive,
        })
    }

    pub(crate) fn as_str(&self) -> &str {
        self.name.as_str()
    }

    // Up to 48 alphanumeric characters and underscores; servers also
    // accept a leading underscore.
    fn verify(keyspace_name: &str) -> Result<(), BadKeyspaceName> {
        if keyspace_name.is_empty() {
            return Err(BadKeyspaceName::Empty);
        }

        let length = keyspace_name.chars().count();
        if length > 48 {
            return Err(BadKeyspaceName::TooLong(keyspace_name.to_owned(), length));
        }

        for character in keyspace_name.chars() {
            if !character.is_ascii_alphanumeric() && character != '_' {
                return Err(BadKeyspaceName::IllegalCharacter(
                    keyspace_name.to_owned(),
                    character,
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use assert_matches::assert_matches;
    use crate::test_utils::setup_tracing;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;
    use typhon_cql::frame::types;

    #[test]
    fn stream_id_set_allocates_and_frees() {
        let mut set = StreamIdSet::new(128);
        let first = set.allocate().unwrap();
        let second = set.allocate().unwrap();
        assert_ne!(first, second);

        set.free(first);
        assert_eq!(set.allocate().unwrap(), first);
    }

    #[test]
    fn stream_id_set_respects_version_limit() {
        let mut set = StreamIdSet::new(ProtocolVersion::V2.max_streams());
        let mut allocated = 0;
        while set.allocate().is_some() {
            allocated += 1;
        }
        // v1/v2 connections multiplex at most 128 client streams.
        assert_eq!(allocated, 128);
    }

    #[test]
    fn orphanage_tracker_counts_old_orphans() {
        let mut tracker = OrphanageTracker::new();
        tracker.insert(1);
        tracker.insert(2);
        assert!(tracker.contains(1));
        // Freshly orphaned ids are not "old" yet.
        assert_eq!(tracker.orphans_older_than(Duration::from_secs(3600)), 0);

        tracker.remove(1);
        assert!(!tracker.contains(1));
        assert!(tracker.contains(2));
    }

    #[test]
    fn keyspace_name_validation() {
        assert!(VerifiedKeyspaceName::new("valid_ks_123".to_owned(), false).is_ok());
        assert_matches!(
            VerifiedKeyspaceName::new("".to_owned(), false),
            Err(BadKeyspaceName::Empty)
        );
        assert_matches!(
            VerifiedKeyspaceName::new("x".repeat(49), false),
            Err(BadKeyspaceName::TooLong(_, 49))
        );
        assert_matches!(
            VerifiedKeyspaceName::new("bad-name".to_owned(), false),
            Err(BadKeyspaceName::IllegalCharacter(_, '-'))
        );
    }

    /// A scripted single-connection server: replies to OPTIONS with
    /// SUPPORTED, STARTUP with READY, and any QUERY with a Void RESULT.
    async fn run_mock_server(listener: TcpListener) {
        let (mut socket, _) = listener.accept().await.unwrap();
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
                    // OPTIONS -> SUPPORTED with an empty option multimap
                    let mut body = Vec::new();
                    types::write_short(0, &mut body);
                    (0x06, body)
                }
                0x01 => (0x02, Vec::new()), // STARTUP -> READY
                0x07 => {
                    // QUERY: a USE statement gets a SetKeyspace naming
                    // the keyspace this mock always lives in; anything
                    // else gets a Void RESULT.
                    let text_len = u32::from_be_bytes(body[0..4].try_into().unwrap()) as usize;
                    let text = std::str::from_utf8(&body[4..4 + text_len]).unwrap();
                    let mut body = Vec::new();
                    if text.starts_with("USE ") {
                        types::write_int(0x0003, &mut body);
                        types::write_string("mock_ks", &mut body).unwrap();
                    } else {
                        types::write_int(0x0001, &mut body);
                    }
                    (0x08, body)
                }
                0x09 => {
                    // PREPARE -> RESULT/Prepared with a fixed id and no
                    // bind markers.
                    let mut body = Vec::new();
                    types::write_int(0x0004, &mut body);
                    types::write_short_bytes(&[0xaa; 4], &mut body).unwrap();
                    types::write_int(0, &mut body); // prepared flags
                    types::write_int(0, &mut body); // col count
                    types::write_int(0, &mut body); // pk count
                    types::write_int(0, &mut body); // result flags
                    types::write_int(0, &mut body); // result col count
                    (0x08, body)
                }
                other => panic!("mock server got unexpected opcode {other:#04x}"),
            };

            let mut frame = vec![0x84, 0x00];
            frame.extend_from_slice(&stream.to_be_bytes());
            frame.push(response_opcode);
            frame.extend_from_slice(&(response_body.len() as u32).to_be_bytes());
            frame.extend_from_slice(&response_body);
            socket.write_all(&frame).await.unwrap();
        }
    }

    #[tokio::test]
    async fn handshake_and_query_against_mock_server() {
        setup_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_mock_server(listener));

        let config = HostConnectionConfig {
            protocol_version: ProtocolVersion::V4,
            keepalive_interval: None,
            ..Default::default()
        };
        let (connection, _error_receiver) =
            open_connection(addr, None, &config).await.unwrap();

        assert!(connection.features().shard_info.is_none());
        assert_eq!(connection.in_flight(), 0);

        let response = connection
            .query_raw(
                "CREATE KEYSPACE ks WITH replication = \
                 {'class': 'SimpleStrategy', 'replication_factor': 1}",
                query::QueryParameters::default(),
                false,
            )
            .await
            .unwrap();
        assert_matches!(
            response.response,
            Response::Result(CqlResult::Void)
        );
        assert_eq!(connection.in_flight(), 0);
    }

    #[tokio::test]
    async fn use_keyspace_verifies_the_returned_name() {
        setup_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_mock_server(listener));

        let config = HostConnectionConfig {
            protocol_version: ProtocolVersion::V4,
            keepalive_interval: None,
            ..Default::default()
        };
        let (connection, _error_receiver) =
            open_connection(addr, None, &config).await.unwrap();

        // The server switches to the requested keyspace; name comparison
        // ignores case.
        let matching = VerifiedKeyspaceName::new("MOCK_KS".to_owned(), false).unwrap();
        connection.use_keyspace(&matching).await.unwrap();

        // The server ended up somewhere else than requested.
        let other = VerifiedKeyspaceName::new("other_ks".to_owned(), false).unwrap();
        let err = connection.use_keyspace(&other).await.unwrap_err();
        assert_matches!(
            err,
            UseKeyspaceError::KeyspaceNameMismatch { expected, received }
                if expected == "other_ks" && received == "mock_ks"
        );
    }

    #[tokio::test]
    async fn reprepare_verifies_the_statement_id() {
        setup_tracing();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(run_mock_server(listener));

        let config = HostConnectionConfig {
            protocol_version: ProtocolVersion::V4,
            keepalive_interval: None,
            ..Default::default()
        };
        let (connection, _error_receiver) =
            open_connection(addr, None, &config).await.unwrap();

        // Matching id: repreparation succeeds.
        let cached_id = Bytes::from_static(&[0xaa; 4]);
        connection
            .reprepare("SELECT a FROM ks.t WHERE pk = ?", None, &cached_id)
            .await
            .unwrap();

        // The server knows the statement under a different id than the
        // cache: fail fast instead of executing the wrong statement.
        let stale_id = Bytes::from_static(&[0xbb; 4]);
        let err = connection
            .reprepare("SELECT a FROM ks.t WHERE pk = ?", None, &stale_id)
            .await
            .unwrap_err();
        match err {
            RequestAttemptError::RepreparedIdChanged {
                expected_id,
                reprepared_id,
                ..
            } => {
                assert_eq!(expected_id, stale_id);
                assert_eq!(reprepared_id, cached_id);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
