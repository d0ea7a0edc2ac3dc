//! Opening transports to servers
//!
//! The topology monitor and the client never dial sockets themselves; they
//! go through a `Connector`, so tests can substitute in-memory servers.

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use mongolink_common::{ClientConfig, NetworkError, Result};

use crate::address::ServerAddress;
use crate::connection::Connection;
use crate::tls;

#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection to `address`. No handshake is performed.
    async fn connect(&self, address: &ServerAddress) -> Result<Connection>;
}

/// Plain TCP, optionally wrapped in TLS
pub struct TcpConnector {
    connect_timeout: Duration,
    max_message_size: usize,
    tls: Option<TlsConnector>,
    tls_server_name: Option<String>,
}

impl TcpConnector {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let tls = if config.tls.enabled {
            Some(tls::build_connector(&config.tls)?)
        } else {
            None
        };
        Ok(Self {
            connect_timeout: config.connect_timeout(),
            max_message_size: config.max_message_size_bytes,
            tls,
            tls_server_name: config.tls.server_name.clone(),
        })
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &ServerAddress) -> Result<Connection> {
        let failed = |reason: String| NetworkError::ConnectionFailed {
            address: address.to_string(),
            reason,
        };

        let stream = tokio::time::timeout(
            self.connect_timeout,
            TcpStream::connect((address.host(), address.port())),
        )
        .await
        .map_err(|_| failed(format!("timed out after {:?}", self.connect_timeout)))?
        .map_err(|e| failed(e.to_string()))?;
        stream.set_nodelay(true)?;

        match &self.tls {
            None => Ok(Connection::from_stream(
                address.clone(),
                stream,
                self.max_message_size,
            )),
            Some(connector) => {
                let host = self.tls_server_name.as_deref().unwrap_or(address.host());
                let name = tls::server_name(host)?;
                let stream = connector
                    .connect(name, stream)
                    .await
                    .map_err(|e| NetworkError::TlsError(format!("handshake with {address} failed: {e}")))?;
                debug!(%address, "TLS established");
                Ok(Connection::from_stream(
                    address.clone(),
                    stream,
                    self.max_message_size,
                ))
            }
        }
    }
}
