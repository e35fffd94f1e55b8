//! Session configuration and the fluent builder.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::lookup_host;

use crate::authentication::AuthenticatorProvider;
use crate::client::session::Session;
use crate::cluster::metadata::SchemaMetadataProvider;
use crate::errors::NewSessionError;
use crate::network::connection::{HostConnectionConfig, VerifiedKeyspaceName};
use crate::network::connection_pool::PoolSize;
use crate::observability::{NoopRequestListener, RequestListener};
use crate::policies::load_balancing::{LoadBalancingPolicy, RoundRobinPolicy};
use crate::policies::reconnection::{ExponentialReconnectionPolicy, ReconnectionPolicy};
use crate::policies::retry::{DefaultRetryPolicy, RetryPolicy};
use crate::policies::speculative_execution::SpeculativeExecutionPolicy;
use crate::routing::sharding::ShardAwarePortRange;
use crate::statement::PageSize;
use typhon_cql::{Compression, Consistency, ProtocolVersion, SerialConsistency};

/// Everything a [`Session`] can be configured with. Usually built
/// through [`SessionBuilder`].
#[derive(Clone)]
pub struct SessionConfig {
    /// Contact points, as `host:port` strings or bare hosts (the default
    /// port 9042 is appended).
    pub known_nodes: Vec<String>,

    /* Protocol */
    pub protocol_max_version: ProtocolVersion,
    pub compression: Option<Compression>,
    pub use_beta: bool,

    /* Socket */
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub defunct_read_timeout: Duration,
    pub tcp_nodelay: bool,
    pub tcp_keepalive_interval: Option<Duration>,

    /* Pooling */
    pub pool_size: PoolSize,
    pub max_pool_size: usize,
    pub max_requests_per_connection: usize,
    pub max_inflight_threshold: usize,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_timeout: Option<Duration>,
    pub disable_shard_awareness: bool,
    pub shard_aware_local_port_range: ShardAwarePortRange,

    /* Query defaults */
    pub default_consistency: Consistency,
    pub default_serial_consistency: Option<SerialConsistency>,
    pub default_page_size: PageSize,
    pub request_timeout: Option<Duration>,
    pub prepare_on_all_hosts: bool,
    pub reprepare_on_up: bool,

    /* Keyspace: (name, case sensitive) */
    pub keyspace: Option<(String, bool)>,

    /* Collaborators */
    pub authenticator: Option<Arc<dyn AuthenticatorProvider>>,
    /// Supplies table schemas for routing-key derivation on protocol
    /// versions that do not send partition-key indexes.
    pub schema_metadata: Option<Arc<dyn SchemaMetadataProvider>>,
    pub load_balancing: Arc<dyn LoadBalancingPolicy>,
    pub retry_policy: Arc<dyn RetryPolicy>,
    pub speculative_execution: Option<Arc<dyn SpeculativeExecutionPolicy>>,
    pub reconnection_policy: Arc<dyn ReconnectionPolicy>,
    pub listener: Arc<dyn RequestListener>,

    #[cfg(feature = "rustls-023")]
    pub tls: Option<(Arc<rustls::ClientConfig>, Option<rustls::pki_types::ServerName<'static>>)>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            known_nodes: Vec::new(),
            protocol_max_version: ProtocolVersion::LATEST,
            compression: None,
            use_beta: false,
            connect_timeout: Duration::from_secs(5),
            read_timeout: Duration::from_secs(5),
            defunct_read_timeout: Duration::from_secs(1),
            tcp_nodelay: true,
            tcp_keepalive_interval: None,
            pool_size: PoolSize::default(),
            max_pool_size: 16,
            max_requests_per_connection: 2048,
            max_inflight_threshold: 1024,
            keepalive_interval: Some(Duration::from_secs(30)),
            keepalive_timeout: Some(Duration::from_secs(30)),
            disable_shard_awareness: false,
            shard_aware_local_port_range: ShardAwarePortRange::EPHEMERAL_PORT_RANGE,
            default_consistency: Consistency::default(),
            default_serial_consistency: Some(SerialConsistency::LocalSerial),
            default_page_size: PageSize::default(),
            request_timeout: Some(Duration::from_secs(30)),
            prepare_on_all_hosts: true,
            reprepare_on_up: true,
            keyspace: None,
            authenticator: None,
            schema_metadata: None,
            load_balancing: Arc::new(RoundRobinPolicy::new()),
            retry_policy: Arc::new(DefaultRetryPolicy::new()),
            speculative_execution: None,
            reconnection_policy: Arc::new(ExponentialReconnectionPolicy::default()),
            listener: Arc::new(NoopRequestListener),
            #[cfg(feature = "rustls-023")]
            tls: None,
        }
    }
}

impl SessionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) async fn resolve_contact_points(
        &self,
    ) -> Result<Vec<SocketAddr>, NewSessionError> {
        let mut addresses = Vec::with_capacity(self.known_nodes.len());
        for node in &self.known_nodes {
            let with_port = if node.contains(':') {
                node.clone()
            } else {
                format!("{node}:9042")
            };
            let mut resolved = lookup_host(&with_port)
                .await
                .map_err(|_| NewSessionError::FailedToResolveAddress(node.clone()))?;
            match resolved.next() {
                Some(address) => addresses.push(address),
                None => return Err(NewSessionError::FailedToResolveAddress(node.clone())),
            }
        }
        Ok(addresses)
    }

    pub(crate) fn host_connection_config(
        &self,
        protocol_version: ProtocolVersion,
        keyspace: Option<VerifiedKeyspaceName>,
    ) -> HostConnectionConfig {
        HostConnectionConfig {
            protocol_version,
            compression: self.compression,
            use_beta: self.use_beta,
            tcp_nodelay: self.tcp_nodelay,
            tcp_keepalive_interval: self.tcp_keepalive_interval,
            connect_timeout: self.connect_timeout,
            keepalive_interval: self.keepalive_interval,
            keepalive_timeout: self.keepalive_timeout,
            defunct_read_timeout: self.defunct_read_timeout,
            event_sender: None,
            authenticator: self.authenticator.clone(),
            keyspace_to_use: keyspace,
            shard_aware_local_port_range: self.shard_aware_local_port_range.clone(),
            #[cfg(feature = "rustls-023")]
            tls_config: self
                .tls
                .as_ref()
                .map(|(config, server_name)| {
                    crate::network::tls::TlsConfig::new(config.clone(), server_name.clone())
                }),
        }
    }
}

/// Builds a [`Session`] step by step.
///
/// ```no_run
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// use typhon::client::SessionBuilder;
///
/// let session = SessionBuilder::new()
///     .known_node("127.0.0.1:9042")
///     .use_keyspace("library", false)
///     .build()
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct SessionBuilder {
    pub config: SessionConfig,
}

impl SessionBuilder {
    pub fn new() -> Self {
        Self {
            config: SessionConfig::default(),
        }
    }

    pub fn known_node(mut self, hostname: impl Into<String>) -> Self {
        self.config.known_nodes.push(hostname.into());
        self
    }

    pub fn known_nodes(mut self, hostnames: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.config
            .known_nodes
            .extend(hostnames.into_iter().map(Into::into));
        self
    }

    pub fn compression(mut self, compression: Option<Compression>) -> Self {
        self.config.compression = compression;
        self
    }

    pub fn protocol_max_version(mut self, version: ProtocolVersion) -> Self {
        self.config.protocol_max_version = version;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn request_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn tcp_nodelay(mut self, nodelay: bool) -> Self {
        self.config.tcp_nodelay = nodelay;
        self
    }

    pub fn tcp_keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.tcp_keepalive_interval = Some(interval);
        self
    }

    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.config.keepalive_interval = Some(interval);
        self
    }

    pub fn pool_size(mut self, size: PoolSize) -> Self {
        self.config.pool_size = size;
        self
    }

    pub fn disallow_shard_aware_port(mut self, disallow: bool) -> Self {
        self.config.disable_shard_awareness = disallow;
        self
    }

    pub fn default_consistency(mut self, consistency: Consistency) -> Self {
        self.config.default_consistency = consistency;
        self
    }

    pub fn default_page_size(mut self, page_size: PageSize) -> Self {
        self.config.default_page_size = page_size;
        self
    }

    pub fn use_keyspace(mut self, keyspace: impl Into<String>, case_sensitive: bool) -> Self {
        self.config.keyspace = Some((keyspace.into(), case_sensitive));
        self
    }

    /// Convenience for password authentication.
    pub fn user(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.config.authenticator = Some(Arc::new(
            crate::authentication::PlainTextAuthenticator::new(username, password),
        ));
        self
    }

    pub fn authenticator_provider(
        mut self,
        provider: Arc<dyn AuthenticatorProvider>,
    ) -> Self {
        self.config.authenticator = Some(provider);
        self
    }

    pub fn schema_metadata_provider(
        mut self,
        provider: Arc<dyn SchemaMetadataProvider>,
    ) -> Self {
        self.config.schema_metadata = Some(provider);
        self
    }

    pub fn load_balancing(mut self, policy: Arc<dyn LoadBalancingPolicy>) -> Self {
        self.config.load_balancing = policy;
        self
    }

    pub fn retry_policy(mut self, policy: Arc<dyn RetryPolicy>) -> Self {
        self.config.retry_policy = policy;
        self
    }

    pub fn speculative_execution(
        mut self,
        policy: Arc<dyn SpeculativeExecutionPolicy>,
    ) -> Self {
        self.config.speculative_execution = Some(policy);
        self
    }

    pub fn reconnection_policy(mut self, policy: Arc<dyn ReconnectionPolicy>) -> Self {
        self.config.reconnection_policy = policy;
        self
    }

    pub fn request_listener(mut self, listener: Arc<dyn RequestListener>) -> Self {
        self.config.listener = listener;
        self
    }

    pub fn prepare_on_all_hosts(mut self, prepare_on_all_hosts: bool) -> Self {
        self.config.prepare_on_all_hosts = prepare_on_all_hosts;
        self
    }

    #[cfg(feature = "rustls-023")]
    pub fn tls(
        mut self,
        config: Arc<rustls::ClientConfig>,
        server_name: Option<rustls::pki_types::ServerName<'static>>,
    ) -> Self {
        self.config.tls = Some((config, server_name));
        self
    }

    pub async fn build(self) -> Result<Session, NewSessionError> {
        Session::connect(self.config).await
    }
}

impl Default for SessionBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bare_hostnames_get_the_default_port() {
        let config = SessionConfig {
            known_nodes: vec!["127.0.0.1".to_owned(), "127.0.0.2:19042".to_owned()],
            ..Default::default()
        };
        let addresses = config.resolve_contact_points().await.unwrap();
        assert_eq!(addresses[0].port(), 9042);
        assert_eq!(addresses[1].port(), 19042);
    }

    #[test]
    fn builder_accumulates_nodes() {
        let builder = SessionBuilder::new()
            .known_node("a")
            .known_nodes(["b", "c"]);
        assert_eq!(builder.config.known_nodes, ["a", "b", "c"]);
    }
}
