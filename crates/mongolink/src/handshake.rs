//! Connection handshake and the hello reply
//!
//! The first command on every connection is a legacy `isMaster` over
//! OP_QUERY carrying client metadata, since the server's wire version is not
//! yet known. Later checks use OP_MSG, and `hello` once the server has
//! advertised `helloOk`.

use std::time::Duration;

use bson::{doc, Document};
use serde::Deserialize;

use mongolink_common::{Credentials, Error, Result};

use crate::command;
use crate::connection::Connection;

pub const DRIVER_NAME: &str = "mongolink";

/// First wire version that accepts OP_MSG
pub const OP_MSG_WIRE_VERSION: i32 = 6;

/// Metadata attached to the first handshake of each connection
#[derive(Debug, Clone, Default)]
pub struct ClientMetadata {
    pub app_name: Option<String>,
}

impl ClientMetadata {
    pub fn new(app_name: Option<String>) -> Self {
        Self { app_name }
    }

    pub fn to_document(&self) -> Document {
        let mut metadata = doc! {
            "driver": {
                "name": DRIVER_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
            "os": {
                "type": std::env::consts::OS,
                "architecture": std::env::consts::ARCH,
            },
            "platform": "rust/tokio",
        };
        if let Some(name) = &self.app_name {
            metadata.insert("application", doc! { "name": name });
        }
        metadata
    }
}

/// The parts of a hello/isMaster reply the core acts on
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloReply {
    pub is_writable_primary: Option<bool>,
    #[serde(rename = "ismaster")]
    pub is_master: Option<bool>,
    #[serde(default)]
    pub secondary: bool,
    #[serde(default)]
    pub arbiter_only: bool,
    #[serde(rename = "isreplicaset", default)]
    pub is_replica_set: bool,
    #[serde(default)]
    pub hidden: bool,
    pub msg: Option<String>,
    pub set_name: Option<String>,
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub passives: Vec<String>,
    #[serde(default)]
    pub arbiters: Vec<String>,
    pub primary: Option<String>,
    pub me: Option<String>,
    #[serde(default)]
    pub min_wire_version: i32,
    #[serde(default)]
    pub max_wire_version: i32,
    pub max_message_size_bytes: Option<i64>,
    pub sasl_supported_mechs: Option<Vec<String>>,
    #[serde(default)]
    pub hello_ok: bool,
}

impl HelloReply {
    /// Parse a reply that has already passed the `ok` check
    pub fn from_document(reply: Document) -> Result<Self> {
        bson::from_document(reply)
            .map_err(|e| Error::Serialization(format!("malformed hello reply: {e}")))
    }

    pub fn is_writable_primary(&self) -> bool {
        self.is_writable_primary.or(self.is_master).unwrap_or(false)
    }

    /// Every member this node reports, in reply order
    pub fn members(&self) -> impl Iterator<Item = &str> {
        self.hosts
            .iter()
            .chain(&self.passives)
            .chain(&self.arbiters)
            .map(String::as_str)
    }
}

/// Build the hello command. `legacy` selects the `isMaster` spelling.
pub fn hello_command(legacy: bool, metadata: Option<&ClientMetadata>, credentials: Option<&Credentials>) -> Document {
    let mut command = if legacy {
        doc! { "isMaster": 1, "helloOk": true }
    } else {
        doc! { "hello": 1 }
    };
    if let Some(metadata) = metadata {
        command.insert("client", metadata.to_document());
    }
    if let Some(credentials) = credentials {
        if credentials.mechanism.is_none() {
            command.insert(
                "saslSupportedMechs",
                format!("{}.{}", credentials.source, credentials.username),
            );
        }
    }
    command
}

/// The first command on a new connection. Records the server's wire version
/// on the connection.
pub async fn initial_handshake(
    connection: &Connection,
    metadata: &ClientMetadata,
    credentials: Option<&Credentials>,
    deadline: Option<Duration>,
) -> Result<HelloReply> {
    let command = hello_command(true, Some(metadata), credentials);
    let reply = connection.legacy_command("admin", command, deadline).await?;
    let hello = HelloReply::from_document(command::check_ok(reply)?)?;
    connection.set_max_wire_version(hello.max_wire_version);
    Ok(hello)
}

/// A follow-up check on an already handshaken connection
pub async fn check(connection: &Connection, hello_ok: bool, deadline: Option<Duration>) -> Result<HelloReply> {
    let reply = if connection.max_wire_version() >= OP_MSG_WIRE_VERSION {
        let command = hello_command(!hello_ok, None, None);
        connection.command("admin", command, deadline).await?
    } else {
        let command = hello_command(true, None, None);
        connection.legacy_command("admin", command, deadline).await?
    };
    let hello = HelloReply::from_document(command::check_ok(reply)?)?;
    connection.set_max_wire_version(hello.max_wire_version);
    Ok(hello)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongolink_common::AuthMechanism;

    #[test]
    fn test_parse_primary_reply() {
        let reply = HelloReply::from_document(doc! {
            "ismaster": true,
            "setName": "rs0",
            "hosts": ["a:27017", "b:27017"],
            "arbiters": ["c:27017"],
            "primary": "a:27017",
            "me": "a:27017",
            "maxWireVersion": 17,
            "minWireVersion": 0,
            "saslSupportedMechs": ["SCRAM-SHA-1", "SCRAM-SHA-256"],
            "helloOk": true,
            "ok": 1.0,
        })
        .unwrap();

        assert!(reply.is_writable_primary());
        assert_eq!(reply.set_name.as_deref(), Some("rs0"));
        assert_eq!(reply.members().collect::<Vec<_>>(), ["a:27017", "b:27017", "c:27017"]);
        assert_eq!(reply.max_wire_version, 17);
        assert!(reply.hello_ok);
        assert_eq!(reply.sasl_supported_mechs.unwrap().len(), 2);
    }

    #[test]
    fn test_writable_primary_prefers_new_field() {
        let reply = HelloReply::from_document(doc! {
            "isWritablePrimary": false,
            "ismaster": true,
        })
        .unwrap();
        assert!(!reply.is_writable_primary());
        assert!(!HelloReply::default().is_writable_primary());
    }

    #[test]
    fn test_hello_command_shapes() {
        let creds = Credentials::new("app", "pw").with_source("users");
        let legacy = hello_command(true, Some(&ClientMetadata::new(Some("reporter".into()))), Some(&creds));
        assert_eq!(legacy.keys().next().map(String::as_str), Some("isMaster"));
        assert!(legacy.get_bool("helloOk").unwrap());
        assert_eq!(legacy.get_str("saslSupportedMechs").unwrap(), "users.app");
        assert_eq!(
            legacy
                .get_document("client")
                .unwrap()
                .get_document("application")
                .unwrap()
                .get_str("name")
                .unwrap(),
            "reporter"
        );

        let modern = hello_command(false, None, Some(&creds.with_mechanism(AuthMechanism::ScramSha1)));
        assert_eq!(modern.keys().next().map(String::as_str), Some("hello"));
        assert!(!modern.contains_key("client"));
        assert!(!modern.contains_key("saslSupportedMechs"));
    }
}
