//! Authentication over established connections

pub mod scram;

use std::time::Duration;

use async_trait::async_trait;
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use tracing::{debug, warn};

use mongolink_common::{AuthError, AuthMechanism, Credentials, Error, Result};

use crate::command;
use crate::connection::Connection;
use crate::handshake::HelloReply;

pub use scram::{ScramSession, ScramStep};

/// Authenticates a connection that has completed its handshake
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, connection: &Connection, hello: &HelloReply) -> Result<()>;

    /// Credentials whose mechanisms should be negotiated in the handshake
    fn credentials(&self) -> Option<&Credentials> {
        None
    }
}

/// SCRAM over `saslStart`/`saslContinue`
pub struct ScramAuthenticator {
    credentials: Credentials,
    deadline: Option<Duration>,
}

impl ScramAuthenticator {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            deadline: None,
        }
    }

    #[must_use]
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Explicit choice wins; otherwise prefer SHA-256 when the server lists it
    pub fn select_mechanism(&self, hello: &HelloReply) -> AuthMechanism {
        if let Some(mechanism) = self.credentials.mechanism {
            return mechanism;
        }
        let offers_sha256 = hello.sasl_supported_mechs.as_ref().map_or(false, |mechs| {
            mechs
                .iter()
                .any(|m| m == AuthMechanism::ScramSha256.as_str())
        });
        if offers_sha256 {
            AuthMechanism::ScramSha256
        } else {
            AuthMechanism::ScramSha1
        }
    }

    async fn sasl(&self, connection: &Connection, command: Document) -> Result<Document> {
        let reply = connection
            .command(&self.credentials.source, command, self.deadline)
            .await?;
        if command::is_ok(&reply) {
            return Ok(reply);
        }
        let failure = command::command_error(&reply);
        Err(AuthError::Rejected {
            code: failure.code,
            message: failure.message,
        }
        .into())
    }
}

#[async_trait]
impl Authenticator for ScramAuthenticator {
    async fn authenticate(&self, connection: &Connection, hello: &HelloReply) -> Result<()> {
        let mechanism = self.select_mechanism(hello);
        if let Some(offered) = &hello.sasl_supported_mechs {
            if !offered.iter().any(|m| m == mechanism.as_str()) {
                warn!(
                    user = %self.credentials.username,
                    mechanism = mechanism.as_str(),
                    "server did not advertise mechanism; trying anyway"
                );
            }
        }

        let mut session = ScramSession::new(mechanism, &self.credentials);

        let start = self
            .sasl(
                connection,
                doc! {
                    "saslStart": 1,
                    "mechanism": mechanism.as_str(),
                    "payload": binary(session.client_first()?),
                    "autoAuthorize": 1,
                    "options": { "skipEmptyExchange": true },
                },
            )
            .await?;
        let conversation_id = start
            .get("conversationId")
            .cloned()
            .ok_or_else(|| AuthError::MalformedMessage("saslStart reply lacks conversationId".to_string()))?;

        let client_final = session.handle_server_first(&payload(&start)?)?;
        let reply = self
            .sasl(
                connection,
                continue_command(&conversation_id, client_final),
            )
            .await?;
        session.handle_server_final(&payload(&reply)?)?;

        // Servers that ignore skipEmptyExchange expect one more empty round
        if !is_done(&reply) {
            let reply = self
                .sasl(connection, continue_command(&conversation_id, String::new()))
                .await?;
            if !is_done(&reply) {
                return Err(AuthError::MalformedMessage(
                    "server did not finish the SASL conversation".to_string(),
                )
                .into());
            }
        }

        debug!(
            connection_id = connection.id(),
            user = %self.credentials.username,
            mechanism = mechanism.as_str(),
            "authenticated"
        );
        Ok(())
    }

    fn credentials(&self) -> Option<&Credentials> {
        Some(&self.credentials)
    }
}

fn binary(payload: String) -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes: payload.into_bytes(),
    }
}

fn continue_command(conversation_id: &Bson, payload: String) -> Document {
    doc! {
        "saslContinue": 1,
        "conversationId": conversation_id.clone(),
        "payload": binary(payload),
    }
}

fn payload(reply: &Document) -> Result<String> {
    let bytes = match reply.get("payload") {
        Some(Bson::Binary(binary)) => binary.bytes.clone(),
        Some(Bson::String(text)) => text.clone().into_bytes(),
        _ => {
            return Err(AuthError::MalformedMessage("SASL reply lacks payload".to_string()).into())
        }
    };
    String::from_utf8(bytes)
        .map_err(|_| Error::Auth(AuthError::MalformedMessage("SASL payload is not UTF-8".to_string())))
}

fn is_done(reply: &Document) -> bool {
    reply.get_bool("done").unwrap_or(false)
}
