//! The driver's error taxonomy.
//!
//! Errors are layered the same way the driver is: connection-level faults
//! ([`ConnectionError`], [`BrokenConnectionError`]) feed pool-level errors
//! ([`ConnectionPoolError`]), which feed per-attempt errors
//! ([`RequestAttemptError`]) and finally the caller-visible
//! [`ExecutionError`]. Codec-level failures are deterministic programmer
//! errors and are never retried.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

pub use typhon_cql::deserialize::DeserializeError;
pub use typhon_cql::frame::response::error::{DbError, WriteType};
pub use typhon_cql::serialize::SerializeError;
use typhon_cql::frame::frame_errors::{
    FrameError, RequestSerializationError, ResponseParseError,
};

/// An error that prevented a session from being created.
#[derive(Error, Debug)]
pub enum NewSessionError {
    #[error("No contact points were provided")]
    EmptyKnownNodesList,
    #[error("Failed to resolve contact point {0}")]
    FailedToResolveAddress(String),
    #[error("Could not connect to any contact point; last error: {0}")]
    FailedToConnect(#[from] ConnectionError),
    #[error(transparent)]
    UseKeyspace(#[from] UseKeyspaceError),
}

/// An error that occurred while opening a single connection.
#[derive(Error, Debug, Clone)]
pub enum ConnectionError {
    #[error("Connect timeout elapsed")]
    ConnectTimeout,
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("TLS error: {0}")]
    Tls(Arc<dyn std::error::Error + Send + Sync>),
    #[error("Connection setup failed: {0}")]
    Setup(#[from] ConnectionSetupError),
    #[error(transparent)]
    Broken(#[from] BrokenConnectionError),
    #[error("The server requires protocol version {server} which is below the driver's minimum")]
    UnsupportedProtocolVersion { server: u8 },
}

impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> Self {
        ConnectionError::Io(Arc::new(err))
    }
}

/// A failure of one of the handshake requests (OPTIONS, STARTUP,
/// AUTH_RESPONSE, REGISTER, USE).
#[derive(Error, Debug, Clone)]
pub enum ConnectionSetupError {
    #[error("Database returned an error: {0}, message: {1}")]
    Db(DbError, String),
    #[error("Received unexpected response during setup: {0}")]
    UnexpectedResponse(&'static str),
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Attempt(#[from] RequestAttemptError),
    #[error("Keyspace selection failed: {0}")]
    Keyspace(#[from] BadKeyspaceName),
    #[error("USE keyspace failed during setup: {0}")]
    UseKeyspace(#[from] UseKeyspaceError),
    #[error("Sharding info malformed: {0}")]
    Sharding(String),
}

/// SASL exchange failure.
#[derive(Error, Debug, Clone)]
pub enum AuthError {
    #[error("Authentication is required by the server, but no authenticator was configured")]
    MissingAuthenticator,
    #[error("The authenticator rejected the exchange: {0}")]
    Rejected(String),
}

/// The reason a previously working connection stopped working. Cloned
/// into every pending request when the connection breaks.
#[derive(Error, Debug, Clone)]
#[error("{0}")]
pub struct BrokenConnectionError(Arc<BrokenConnectionErrorKind>);

impl BrokenConnectionError {
    pub fn kind(&self) -> &BrokenConnectionErrorKind {
        &self.0
    }
}

impl From<BrokenConnectionErrorKind> for BrokenConnectionError {
    fn from(kind: BrokenConnectionErrorKind) -> Self {
        BrokenConnectionError(Arc::new(kind))
    }
}

#[derive(Error, Debug)]
pub enum BrokenConnectionErrorKind {
    #[error("Failed to deframe a response: {0}")]
    FrameHeaderParse(FrameError),
    #[error("Failed to write a request: {0}")]
    Write(std::io::Error),
    #[error("Keepalive request failed: {0}")]
    KeepaliveQuery(RequestAttemptError),
    #[error("Timed out waiting for a keepalive response")]
    KeepaliveTimeout,
    #[error("Too many orphaned stream ids: {0}")]
    TooManyOrphanedStreamIds(usize),
    #[error("Received a response with an unexpected stream id {0}")]
    UnexpectedStreamId(i16),
    #[error("Failed to handle a server event: {0}")]
    EventHandling(ResponseParseError),
    #[error("Internal channel closed; driver bug or runtime shutdown")]
    ChannelError,
}

/// An error of borrowing a connection from a host's pool.
#[derive(Error, Debug, Clone)]
pub enum ConnectionPoolError {
    /// Every connection to the target is at its in-flight cap. A
    /// configuration problem, not a connection fault.
    #[error(
        "The pool for {host} is busy: all {length} connections at the \
        {max_inflight} in-flight cap"
    )]
    Busy {
        host: SocketAddr,
        max_inflight: usize,
        length: usize,
    },
    #[error("The pool is still being initialized")]
    Initializing,
    #[error("The pool is broken; last connection error: {last_connection_error}")]
    Broken {
        last_connection_error: ConnectionError,
    },
    #[error("The pool was asked for shard {shard}, but only {nr_shards} shards exist")]
    ShardOutOfBounds { shard: u32, nr_shards: u16 },
    #[error("The pool is being shut down")]
    ShuttingDown,
}

/// An error of a single attempt: one request on one connection. The
/// request pipeline decides whether the next target is worth trying.
#[derive(Error, Debug, Clone)]
pub enum RequestAttemptError {
    #[error("Failed to serialize the request: {0}")]
    Serialization(Arc<RequestSerializationError>),
    #[error("Failed to serialize bound values: {0}")]
    Values(#[from] SerializeError),
    #[error("Database returned an error: {0}, message: {1}")]
    Db(DbError, String),
    #[error("Failed to parse the response: {0}")]
    ResponseParse(Arc<ResponseParseError>),
    #[error("Received unexpected response: {0}")]
    UnexpectedResponse(&'static str),
    #[error(transparent)]
    Broken(#[from] BrokenConnectionError),
    #[error("No free stream id on the connection")]
    UnableToAllocStreamId,
    #[error("Request dropped because the connection closed")]
    ConnectionClosed,
    #[error(
        "Repreparing returned a different statement id: expected {expected_id:?}, got {reprepared_id:?}"
    )]
    RepreparedIdChanged {
        statement: String,
        expected_id: Bytes,
        reprepared_id: Bytes,
    },
    #[error("The request timed out after {0:?}")]
    Timeout(Duration),
}

impl From<RequestSerializationError> for RequestAttemptError {
    fn from(err: RequestSerializationError) -> Self {
        RequestAttemptError::Serialization(Arc::new(err))
    }
}

impl From<ResponseParseError> for RequestAttemptError {
    fn from(err: ResponseParseError) -> Self {
        RequestAttemptError::ResponseParse(Arc::new(err))
    }
}

impl RequestAttemptError {
    /// Whether this attempt failed without the request possibly taking
    /// effect on the server, so retrying cannot double-apply it.
    pub fn is_safe_to_retry(&self) -> bool {
        match self {
            // The request never reached the wire.
            RequestAttemptError::Serialization(_)
            | RequestAttemptError::Values(_)
            | RequestAttemptError::UnableToAllocStreamId
            | RequestAttemptError::ConnectionClosed => true,
            RequestAttemptError::Db(db, _) => matches!(
                db,
                DbError::IsBootstrapping | DbError::Unprepared { .. } | DbError::TruncateError
            ),
            _ => false,
        }
    }
}

/// An error of preparing a statement.
#[derive(Error, Debug, Clone)]
pub enum PrepareError {
    #[error(transparent)]
    Attempt(#[from] RequestAttemptError),
    #[error(transparent)]
    Pool(#[from] ConnectionPoolError),
    #[error("No connection on which to prepare the statement")]
    NoConnections,
    #[error(
        "Reprepared statement id does not match the cached one: expected {expected_id:?}, got {reprepared_id:?}"
    )]
    IdMismatch {
        expected_id: Bytes,
        reprepared_id: Bytes,
    },
}

/// The caller-visible error of executing a statement.
#[derive(Error, Debug, Clone)]
pub enum ExecutionError {
    #[error(transparent)]
    Values(#[from] SerializeError),
    #[error(transparent)]
    Prepare(#[from] PrepareError),
    #[error(transparent)]
    Pool(#[from] ConnectionPoolError),
    /// A non-retryable error of the last attempt.
    #[error(transparent)]
    LastAttempt(#[from] RequestAttemptError),
    /// Every host in the query plan was tried and failed.
    #[error("No host available to serve the request; tried: {0:?}")]
    NoHostAvailable(TriedHosts),
    #[error("The query plan was empty: load balancing produced no targets")]
    EmptyPlan,
    #[error("Client-side timeout after {0:?}")]
    RequestTimeout(Duration),
    #[error(transparent)]
    UseKeyspace(#[from] UseKeyspaceError),
}

/// The error recorded for one host while walking a query plan.
#[derive(Error, Debug, Clone)]
pub enum TriedHostError {
    #[error(transparent)]
    Pool(#[from] ConnectionPoolError),
    #[error(transparent)]
    Attempt(#[from] RequestAttemptError),
}

/// Per-host errors accumulated while walking a query plan.
#[derive(Debug, Clone, Default)]
pub struct TriedHosts(pub HashMap<SocketAddr, TriedHostError>);

impl TriedHosts {
    pub fn record(&mut self, host: SocketAddr, error: impl Into<TriedHostError>) {
        self.0.insert(host, error.into());
    }
}

/// An error of a `USE keyspace` request.
#[derive(Error, Debug, Clone)]
pub enum UseKeyspaceError {
    #[error(transparent)]
    BadKeyspaceName(#[from] BadKeyspaceName),
    #[error(transparent)]
    Attempt(#[from] RequestAttemptError),
    /// The server's `SetKeyspace` response names a different keyspace
    /// than the one requested.
    #[error("USE keyspace returned unexpected keyspace name: expected {expected}, got {received}")]
    KeyspaceNameMismatch { expected: String, received: String },
    #[error("USE keyspace timed out")]
    Timeout,
}

/// A keyspace name the driver refuses to send.
#[derive(Error, Debug, Clone)]
pub enum BadKeyspaceName {
    #[error("Keyspace name is empty")]
    Empty,
    #[error("Keyspace name {0} is longer than 48 characters ({1})")]
    TooLong(String, usize),
    #[error("Keyspace name {0} contains illegal character {1:?}")]
    IllegalCharacter(String, char),
}

/// An error of fetching the next page in a paged result stream.
#[derive(Error, Debug, Clone)]
pub enum NextPageError {
    #[error(transparent)]
    Execution(#[from] ExecutionError),
    #[error("The pager worker vanished; runtime is shutting down")]
    WorkerGone,
}

/// An error of reading the next row from a paged result stream.
#[derive(Error, Debug, Clone)]
pub enum NextRowError {
    #[error(transparent)]
    NextPage(#[from] NextPageError),
}

/// An error of deriving a routing key from bound values.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionKeyError {
    #[error("Partition key column {index} is not bound or is null")]
    UnboundColumn { index: u16 },
    #[error("Partition key component exceeds the 16-bit length limit: {size} bytes")]
    ValueTooLong { size: usize },
}
