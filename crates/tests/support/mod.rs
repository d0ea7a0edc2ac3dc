//! In-memory stand-ins for MongoDB servers
//!
//! Each fake connection is a `tokio::io::duplex` pair: the driver gets one
//! end, a `serve` task answers on the other using a handler closure.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use bson::spec::BinarySubtype;
use bson::{doc, Binary, Bson, Document};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use mongolink::{Connection, Connector, ServerAddress, TopologyDescription, TopologyMonitor};
use mongolink_common::{NetworkError, Result};
use mongolink_protocol::{MessageHeader, OpMsg, OpReply, WireMessage};

pub const MAX_MESSAGE_SIZE: usize = 48 * 1024 * 1024;

static NEXT_SERVER_REQUEST_ID: AtomicI32 = AtomicI32::new(1_000_000);

/// What a fake server does with one request
pub enum Reply {
    Document(Document),
    /// Swallow the request
    Ignore,
    /// Hang up the connection
    Close,
}

pub type Handler = Arc<dyn Fn(&Document) -> Reply + Send + Sync>;

pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Document) -> Reply + Send + Sync + 'static,
{
    Arc::new(f)
}

pub fn ok_handler() -> Handler {
    handler(|_| Reply::Document(doc! { "ok": 1.0 }))
}

/// Replies `{ok: 1, servedBy: <me>}` to anything
pub fn served_by(me: &str) -> Handler {
    let me = me.to_string();
    handler(move |_| Reply::Document(doc! { "ok": 1.0, "servedBy": me.as_str() }))
}

pub fn address() -> ServerAddress {
    ServerAddress::new("fake", 27017)
}

pub async fn read_message<R: AsyncRead + Unpin>(stream: &mut R) -> Option<WireMessage> {
    let mut header = [0u8; MessageHeader::LENGTH];
    stream.read_exact(&mut header).await.ok()?;
    let parsed = MessageHeader::parse(&header).ok()?;
    let mut body = vec![0u8; parsed.body_length()];
    stream.read_exact(&mut body).await.ok()?;
    WireMessage::decode(&parsed, &body).ok()
}

/// `(request id, arrived as OP_QUERY, command document)`
pub fn command_of(message: WireMessage) -> Option<(i32, bool, Document)> {
    match message {
        WireMessage::Query(query) => Some((query.request_id, true, query.query)),
        WireMessage::Message(msg) => Some((msg.request_id, false, msg.body)),
        _ => None,
    }
}

pub fn reply_message(response_to: i32, legacy: bool, body: Document) -> WireMessage {
    let request_id = NEXT_SERVER_REQUEST_ID.fetch_add(1, Ordering::Relaxed);
    if legacy {
        WireMessage::Reply(OpReply {
            request_id,
            response_to,
            response_flags: 0,
            cursor_id: 0,
            starting_from: 0,
            documents: vec![body],
        })
    } else {
        let mut msg = OpMsg::new(body);
        msg.request_id = request_id;
        msg.response_to = response_to;
        WireMessage::Message(msg)
    }
}

pub async fn write_reply<W: AsyncWrite + Unpin>(stream: &mut W, response_to: i32, legacy: bool, body: Document) {
    let frame = reply_message(response_to, legacy, body)
        .encode()
        .expect("encode reply");
    let _ = stream.write_all(&frame).await;
}

/// Answer requests on `stream` until the peer hangs up or the handler says
/// to close.
pub async fn serve<S>(mut stream: S, handler: Handler)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(message) = read_message(&mut stream).await {
        let Some((request_id, legacy, command)) = command_of(message) else {
            continue;
        };
        match handler(&command) {
            Reply::Document(body) => write_reply(&mut stream, request_id, legacy, body).await,
            Reply::Ignore => {}
            Reply::Close => return,
        }
    }
}

/// A connection whose peer is served by `handler`
pub fn connect_to(handler: Handler) -> Connection {
    let (client, server) = tokio::io::duplex(1 << 20);
    tokio::spawn(serve(server, handler));
    Connection::from_stream(address(), client, MAX_MESSAGE_SIZE)
}

pub fn is_hello(command: &Document) -> bool {
    ["hello", "isMaster", "ismaster"]
        .iter()
        .any(|k| command.contains_key(*k))
}

fn base_hello() -> Document {
    doc! {
        "maxWireVersion": 17,
        "minWireVersion": 0,
        "maxMessageSizeBytes": 48_000_000,
        "helloOk": true,
        "ok": 1.0,
    }
}

pub fn standalone_hello() -> Document {
    let mut hello = base_hello();
    hello.insert("ismaster", true);
    hello.insert("isWritablePrimary", true);
    hello
}

pub fn member_hello(me: &str, set: &str, hosts: &[&str], primary: bool) -> Document {
    let mut hello = base_hello();
    hello.insert("ismaster", primary);
    hello.insert("isWritablePrimary", primary);
    hello.insert("secondary", !primary);
    hello.insert("setName", set);
    hello.insert("hosts", hosts.to_vec());
    hello.insert("me", me);
    hello
}

/// One fake server reachable through a `FakeCluster`
pub struct FakeNode {
    hello: Mutex<Document>,
    app: Handler,
    up: AtomicBool,
    connections: AtomicUsize,
    commands: Mutex<Vec<Document>>,
}

impl FakeNode {
    pub fn set_hello(&self, hello: Document) {
        *self.hello.lock() = hello;
    }

    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::SeqCst);
    }

    pub fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Every non-hello command received so far
    pub fn commands(&self) -> Vec<Document> {
        self.commands.lock().clone()
    }

    pub fn commands_named(&self, name: &str) -> Vec<Document> {
        self.commands()
            .into_iter()
            .filter(|c| c.contains_key(name))
            .collect()
    }

    fn respond(&self, command: &Document) -> Reply {
        if is_hello(command) {
            let mut hello = self.hello.lock().clone();
            if command.contains_key("saslSupportedMechs") {
                hello.insert("saslSupportedMechs", vec!["SCRAM-SHA-256", "SCRAM-SHA-1"]);
            }
            return Reply::Document(hello);
        }
        self.commands.lock().push(command.clone());
        (self.app)(command)
    }
}

/// Address-keyed set of fake servers, usable as the driver's `Connector`
#[derive(Default)]
pub struct FakeCluster {
    nodes: Mutex<HashMap<ServerAddress, Arc<FakeNode>>>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, address: &str, hello: Document, app: Handler) -> Arc<FakeNode> {
        let node = Arc::new(FakeNode {
            hello: Mutex::new(hello),
            app,
            up: AtomicBool::new(true),
            connections: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
        });
        self.nodes.lock().insert(
            ServerAddress::parse(address).expect("valid address"),
            Arc::clone(&node),
        );
        node
    }

    pub fn node(&self, address: &str) -> Arc<FakeNode> {
        let address = ServerAddress::parse(address).expect("valid address");
        Arc::clone(self.nodes.lock().get(&address).expect("node exists"))
    }
}

#[async_trait]
impl Connector for FakeCluster {
    async fn connect(&self, address: &ServerAddress) -> Result<Connection> {
        let node = self.nodes.lock().get(address).cloned();
        let node = match node {
            Some(node) if node.up.load(Ordering::SeqCst) => node,
            _ => {
                return Err(NetworkError::ConnectionFailed {
                    address: address.to_string(),
                    reason: "connection refused".to_string(),
                }
                .into())
            }
        };
        node.connections.fetch_add(1, Ordering::SeqCst);

        let (client, server) = tokio::io::duplex(1 << 20);
        let responder = Arc::clone(&node);
        tokio::spawn(serve(
            server,
            Arc::new(move |command: &Document| responder.respond(command)),
        ));
        Ok(Connection::from_stream(address.clone(), client, MAX_MESSAGE_SIZE))
    }
}

/// Poll the monitor until `predicate` holds, nudging probes along
pub async fn wait_for<F>(monitor: &TopologyMonitor, what: &str, predicate: F)
where
    F: Fn(&TopologyDescription) -> bool,
{
    let outcome = tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            if predicate(&monitor.description()) {
                return;
            }
            monitor.request_immediate_check();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    assert!(outcome.is_ok(), "timed out waiting for {what}");
}

type HmacSha256 = Hmac<Sha256>;

struct Conversation {
    client_first_bare: String,
    server_first: String,
    server_nonce: String,
}

/// Server half of SCRAM-SHA-256, holding only derived keys
pub struct ScramServer {
    username: String,
    salt: Vec<u8>,
    iterations: u32,
    stored_key: Vec<u8>,
    server_key: Vec<u8>,
    extra_round: bool,
    conversation: Mutex<Option<Conversation>>,
}

impl ScramServer {
    pub fn new(username: &str, password: &str) -> Self {
        let salt = b"mongolink-test-salt".to_vec();
        let iterations = 4096;

        let mut salted = [0u8; 32];
        pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut salted);
        let client_key = hmac_sha256(&salted, b"Client Key");
        let stored_key = Sha256::digest(&client_key).to_vec();
        let server_key = hmac_sha256(&salted, b"Server Key");

        Self {
            username: username.to_string(),
            salt,
            iterations,
            stored_key,
            server_key,
            extra_round: false,
            conversation: Mutex::new(None),
        }
    }

    /// Report `done: false` after the server signature, as servers that
    /// ignore `skipEmptyExchange` do
    pub fn requiring_extra_round(mut self) -> Self {
        self.extra_round = true;
        self
    }

    /// Handle `saslStart`/`saslContinue`; `None` for anything else
    pub fn handle(&self, command: &Document) -> Option<Reply> {
        if command.contains_key("saslStart") {
            Some(self.start(command))
        } else if command.contains_key("saslContinue") {
            Some(self.resume(command))
        } else {
            None
        }
    }

    fn start(&self, command: &Document) -> Reply {
        if command.get_str("mechanism").ok() != Some("SCRAM-SHA-256") {
            return auth_failure();
        }
        let payload = payload_of(command);
        let Some(bare) = payload.strip_prefix("n,,") else {
            return auth_failure();
        };

        let mut username = "";
        let mut client_nonce = "";
        for part in bare.split(',') {
            if let Some(v) = part.strip_prefix("n=") {
                username = v;
            } else if let Some(v) = part.strip_prefix("r=") {
                client_nonce = v;
            }
        }
        if username != self.username || client_nonce.is_empty() {
            return auth_failure();
        }

        let server_nonce = format!("{client_nonce}c2VydmVyLW5vbmNl");
        let server_first = format!(
            "r={},s={},i={}",
            server_nonce,
            BASE64.encode(&self.salt),
            self.iterations
        );
        *self.conversation.lock() = Some(Conversation {
            client_first_bare: bare.to_string(),
            server_first: server_first.clone(),
            server_nonce,
        });

        Reply::Document(doc! {
            "conversationId": 1,
            "done": false,
            "payload": binary(&server_first),
            "ok": 1.0,
        })
    }

    fn resume(&self, command: &Document) -> Reply {
        let payload = payload_of(command);
        if payload.is_empty() {
            return Reply::Document(doc! {
                "conversationId": 1,
                "done": true,
                "payload": binary(""),
                "ok": 1.0,
            });
        }
        let Some(conversation) = self.conversation.lock().take() else {
            return auth_failure();
        };

        let mut channel_binding = "";
        let mut nonce = "";
        let mut proof = "";
        for part in payload.split(',') {
            if let Some(v) = part.strip_prefix("c=") {
                channel_binding = v;
            } else if let Some(v) = part.strip_prefix("r=") {
                nonce = v;
            } else if let Some(v) = part.strip_prefix("p=") {
                proof = v;
            }
        }
        if nonce != conversation.server_nonce {
            return auth_failure();
        }
        let Ok(proof) = BASE64.decode(proof) else {
            return auth_failure();
        };

        let auth_message = format!(
            "{},{},c={},r={}",
            conversation.client_first_bare, conversation.server_first, channel_binding, nonce
        );
        let client_signature = hmac_sha256(&self.stored_key, auth_message.as_bytes());
        let client_key: Vec<u8> = proof
            .iter()
            .zip(&client_signature)
            .map(|(a, b)| a ^ b)
            .collect();
        if Sha256::digest(&client_key).as_slice() != self.stored_key.as_slice() {
            return auth_failure();
        }

        let server_signature = hmac_sha256(&self.server_key, auth_message.as_bytes());
        Reply::Document(doc! {
            "conversationId": 1,
            "done": !self.extra_round,
            "payload": binary(&format!("v={}", BASE64.encode(server_signature))),
            "ok": 1.0,
        })
    }
}

fn auth_failure() -> Reply {
    Reply::Document(doc! {
        "ok": 0.0,
        "errmsg": "Authentication failed.",
        "code": 18,
        "codeName": "AuthenticationFailed",
    })
}

fn binary(payload: &str) -> Binary {
    Binary {
        subtype: BinarySubtype::Generic,
        bytes: payload.as_bytes().to_vec(),
    }
}

fn payload_of(command: &Document) -> String {
    match command.get("payload") {
        Some(Bson::Binary(b)) => String::from_utf8_lossy(&b.bytes).into_owned(),
        _ => String::new(),
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}
