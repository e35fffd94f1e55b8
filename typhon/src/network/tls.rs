//! TLS support via rustls.
//!
//! Certificate-chain and hostname validation are rustls's: the SAN
//! extension is parsed from DER and DNS names matched per RFC 6125, with
//! no platform-specific certificate parsing anywhere in the driver.

use std::net::IpAddr;
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

use crate::errors::ConnectionError;

/// TLS parameters of a single endpoint.
#[derive(Clone)]
pub(crate) struct TlsConfig {
    connector: TlsConnector,
    /// Overrides the SNI/validation name; defaults to the peer's IP.
    server_name: Option<ServerName<'static>>,
}

impl std::fmt::Debug for TlsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsConfig")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TlsConfig {
    /// Builds a config from a prepared rustls [`ClientConfig`]: root
    /// store, optional client certificate and hostname-validation mode
    /// are all decided there.
    pub(crate) fn new(config: Arc<ClientConfig>, server_name: Option<ServerName<'static>>) -> Self {
        Self {
            connector: TlsConnector::from(config),
            server_name,
        }
    }

    pub(crate) async fn connect(
        &self,
        node_address: IpAddr,
        stream: TcpStream,
    ) -> Result<TlsStream<TcpStream>, ConnectionError> {
        let server_name = self
            .server_name
            .clone()
            .unwrap_or_else(|| ServerName::IpAddress(node_address.into()));
        self.connector
            .connect(server_name, stream)
            .await
            .map_err(|err| ConnectionError::Tls(Arc::new(err)))
    }
}
