//! mongolink - MongoDB driver core
//!
//! Provides:
//! - Multiplexed connections with request/reply correlation
//! - SCRAM-SHA-1 and SCRAM-SHA-256 authentication
//! - Topology discovery, monitoring and server selection
//! - Server-side cursors
//!
//! The wire codec lives in `mongolink-protocol`; configuration and errors in
//! `mongolink-common`.

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod address;
pub mod auth;
pub mod client;
pub mod command;
pub mod connection;
pub mod connector;
pub mod cursor;
pub mod handshake;
pub mod tls;
pub mod topology;

pub use address::ServerAddress;
pub use auth::{Authenticator, ScramAuthenticator};
pub use client::Client;
pub use command::Namespace;
pub use connection::Connection;
pub use connector::{Connector, TcpConnector};
pub use cursor::{Cursor, CursorBatch, CursorState};
pub use handshake::{ClientMetadata, HelloReply};
pub use topology::{
    ServerDescription, ServerRole, ServerSelector, TopologyDescription, TopologyEvent,
    TopologyMonitor, TopologyType,
};

pub use mongolink_common::{
    AuthMechanism, ClientConfig, Credentials, Error, Result, TlsConfig,
};
