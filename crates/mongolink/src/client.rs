//! Client facade tying selection, connections and cursors together

use std::sync::Arc;

use bson::Document;
use tracing::debug;

use mongolink_common::{ClientConfig, Result};

use crate::auth::{Authenticator, ScramAuthenticator};
use crate::command;
use crate::connection::Connection;
use crate::connector::{Connector, TcpConnector};
use crate::cursor::Cursor;
use crate::topology::{ServerSelector, TopologyMonitor};

/// Entry point for running commands against a deployment. Cloning is cheap
/// and clones share the same topology monitor and connections.
#[derive(Clone)]
pub struct Client {
    monitor: TopologyMonitor,
}

impl Client {
    /// Connect over TCP (and TLS if configured). Must be called inside a
    /// tokio runtime; monitoring starts immediately.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let connector = TcpConnector::new(&config)?;
        Self::with_connector(config, Arc::new(connector))
    }

    /// Like [`Client::new`] with a caller-supplied transport
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        let authenticator = config
            .credentials
            .clone()
            .map(|credentials| Arc::new(ScramAuthenticator::new(credentials)) as Arc<dyn Authenticator>);
        let monitor = TopologyMonitor::new(&config, connector, authenticator)?;
        monitor.start();
        Ok(Self { monitor })
    }

    pub fn topology(&self) -> &TopologyMonitor {
        &self.monitor
    }

    /// Run a command on a server matching `selector` and return the reply
    /// body once it passes the `ok` check. Failures are not retried.
    pub async fn run_command(&self, db: &str, command: Document, selector: &ServerSelector) -> Result<Document> {
        let connection = self.monitor.select_connection(selector).await?;
        let reply = self.observe(&connection, connection.command(db, command, None).await)?;
        command::check_ok(reply)
    }

    /// Run a cursor-producing command (`find`, `aggregate`, ...) and wrap
    /// the reply in a cursor pinned to the same connection.
    pub async fn run_cursor_command(&self, db: &str, command: Document, selector: &ServerSelector) -> Result<Cursor> {
        let connection = self.monitor.select_connection(selector).await?;
        let reply = self.observe(&connection, connection.command(db, command, None).await)?;
        let cursor = Cursor::from_reply(connection, &command::check_ok(reply)?)?
            .with_monitor(self.monitor.clone());
        debug!(cursor_id = cursor.id(), ns = %cursor.namespace(), "cursor opened");
        Ok(cursor)
    }

    /// Stop monitoring and close all connections
    pub fn shutdown(&self) {
        self.monitor.shutdown();
    }

    /// Network failures invalidate what we know about the server
    fn observe<T>(&self, connection: &Connection, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_network_error() {
                self.monitor.mark_server_unknown(connection.address(), e);
            }
        }
        result
    }
}
