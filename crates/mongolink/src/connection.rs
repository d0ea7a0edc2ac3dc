//! Multiplexed connection to a single server
//!
//! Many requests may be outstanding on one connection at once. Each request
//! gets a fresh request id and a pending slot; one reader task decodes
//! incoming frames and completes the slot whose id matches the reply's
//! `responseTo`. Writes go through one writer task so frames never
//! interleave, even when a caller abandons its request mid-write.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bson::Document;
use bytes::BytesMut;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use mongolink_common::{Error, FrameError, Result};
use mongolink_protocol::{FrameAssembler, OpMsg, OpQuery, WireMessage};

use crate::address::ServerAddress;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

const READ_BUFFER_SIZE: usize = 64 * 1024;
const OUTBOUND_QUEUE_DEPTH: usize = 1024;

type ReplySender = oneshot::Sender<Result<WireMessage>>;

/// A frame queued for the writer task
struct Outbound {
    frame: BytesMut,
    written: Option<oneshot::Sender<Result<()>>>,
}

#[derive(Default)]
struct PendingState {
    closed: bool,
    slots: HashMap<i32, ReplySender>,
}

/// Requests awaiting a reply, keyed by request id
#[derive(Default)]
struct PendingRequests {
    state: Mutex<PendingState>,
}

impl PendingRequests {
    /// `Ok(None)` when `request_id` still has a waiter
    fn register(&self, request_id: i32) -> Result<Option<oneshot::Receiver<Result<WireMessage>>>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(Error::ConnectionClosed);
        }
        if state.slots.contains_key(&request_id) {
            return Ok(None);
        }
        let (tx, rx) = oneshot::channel();
        state.slots.insert(request_id, tx);
        Ok(Some(rx))
    }

    /// Complete the slot for `response_to`. Returns false when nobody is waiting.
    fn resolve(&self, response_to: i32, reply: WireMessage) -> bool {
        let slot = self.state.lock().slots.remove(&response_to);
        match slot {
            // The receiver may have timed out between removal and send
            Some(tx) => {
                let _ = tx.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    fn retire(&self, request_id: i32) {
        self.state.lock().slots.remove(&request_id);
    }

    /// Mark closed and fail every outstanding request with the framing
    /// error that broke the stream, or `ConnectionClosed` without one
    fn fail_all(&self, cause: Option<&FrameError>) -> usize {
        let drained: Vec<ReplySender> = {
            let mut state = self.state.lock();
            state.closed = true;
            state.slots.drain().map(|(_, tx)| tx).collect()
        };
        let count = drained.len();
        for tx in drained {
            let error = cause.map_or(Error::ConnectionClosed, |e| Error::Frame(e.clone()));
            let _ = tx.send(Err(error));
        }
        count
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn len(&self) -> usize {
        self.state.lock().slots.len()
    }
}

/// Removes a pending slot when the waiting future finishes or is dropped
struct SlotGuard<'a> {
    pending: &'a PendingRequests,
    request_id: i32,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.pending.retire(self.request_id);
    }
}

pub struct Connection {
    id: u64,
    address: ServerAddress,
    outbound: mpsc::Sender<Outbound>,
    pending: Arc<PendingRequests>,
    next_request_id: AtomicI32,
    max_wire_version: AtomicI32,
    reader_task: JoinHandle<()>,
    writer_task: JoinHandle<()>,
}

impl Connection {
    /// Wrap an established byte stream. Spawns the reader and writer tasks,
    /// so this must run inside a tokio runtime.
    pub fn from_stream<S>(address: ServerAddress, stream: S, max_message_size: usize) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        let (read_half, write_half) = tokio::io::split(stream);
        let pending = Arc::new(PendingRequests::default());
        let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE_DEPTH);

        let reader_task = tokio::spawn(read_loop(
            id,
            read_half,
            Arc::clone(&pending),
            max_message_size,
        ));
        let writer_task = tokio::spawn(write_loop(id, write_half, queue, Arc::clone(&pending)));

        debug!(connection_id = id, %address, "connection established");

        Self {
            id,
            address,
            outbound,
            pending,
            next_request_id: AtomicI32::new(1),
            max_wire_version: AtomicI32::new(0),
            reader_task,
            writer_task,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    pub fn is_closed(&self) -> bool {
        self.pending.is_closed()
    }

    /// Number of requests still waiting for a reply
    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    pub fn max_wire_version(&self) -> i32 {
        self.max_wire_version.load(Ordering::Relaxed)
    }

    pub fn set_max_wire_version(&self, version: i32) {
        self.max_wire_version.store(version, Ordering::Relaxed);
    }

    /// Allocate the next request id: positive, never zero, wrapping
    fn next_request_id(&self) -> i32 {
        self.next_request_id
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |id| {
                Some(if id == i32::MAX { 1 } else { id + 1 })
            })
            .unwrap_or_else(|id| id)
    }

    /// Allocate an id and register its slot, skipping ids that are still
    /// waiting for a reply after the counter wrapped
    fn register_next(&self) -> Result<(i32, oneshot::Receiver<Result<WireMessage>>)> {
        loop {
            let request_id = self.next_request_id();
            if let Some(receiver) = self.pending.register(request_id)? {
                return Ok((request_id, receiver));
            }
            trace!(connection_id = self.id, request_id, "request id still in flight, skipping");
        }
    }

    /// Send a request and wait for the reply that answers it.
    ///
    /// With a `deadline`, the wait fails with [`Error::Timeout`] once it
    /// elapses. The request may still reach the server; a reply arriving
    /// afterwards is dropped.
    pub async fn send(&self, mut message: WireMessage, deadline: Option<Duration>) -> Result<WireMessage> {
        let (request_id, receiver) = self.register_next()?;
        let _guard = SlotGuard {
            pending: &self.pending,
            request_id,
        };
        message.set_request_id(request_id);
        let frame = message.encode()?;

        self.outbound
            .send(Outbound {
                frame,
                written: None,
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        trace!(connection_id = self.id, request_id, op = ?message.op_code(), "request queued");

        let outcome = match deadline {
            Some(limit) => match tokio::time::timeout(limit, receiver).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!(connection_id = self.id, request_id, ?limit, "request timed out");
                    return Err(Error::Timeout(limit));
                }
            },
            None => receiver.await,
        };

        outcome.map_err(|_| Error::ConnectionClosed)?
    }

    /// Write a message the server will not answer (legacy writes, or OP_MSG
    /// with `moreToCome`). Resolves once the frame is flushed.
    pub async fn send_no_reply(&self, mut message: WireMessage) -> Result<()> {
        if !message.expects_no_reply() {
            return Err(Error::Internal(format!(
                "{:?} expects a reply; use send",
                message.op_code()
            )));
        }
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        message.set_request_id(self.next_request_id());
        let frame = message.encode()?;

        let (written, flushed) = oneshot::channel();
        self.outbound
            .send(Outbound {
                frame,
                written: Some(written),
            })
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        flushed.await.map_err(|_| Error::ConnectionClosed)?
    }

    /// Run a command over OP_MSG and return the reply body as-is; callers
    /// check `ok` themselves.
    pub async fn command(&self, db: &str, mut body: Document, deadline: Option<Duration>) -> Result<Document> {
        body.insert("$db", db);
        let reply = self
            .send(WireMessage::Message(OpMsg::new(body)), deadline)
            .await?;
        reply_document(reply)
    }

    /// Run a command over legacy OP_QUERY against `<db>.$cmd`. Used for the
    /// first handshake, before the server's wire version is known.
    pub async fn legacy_command(&self, db: &str, body: Document, deadline: Option<Duration>) -> Result<Document> {
        let reply = self
            .send(WireMessage::Query(OpQuery::command(db, body)), deadline)
            .await?;
        reply_document(reply)
    }

    /// Close the connection, failing every outstanding request
    pub fn close(&self) {
        let failed = self.pending.fail_all(None);
        self.reader_task.abort();
        self.writer_task.abort();
        debug!(connection_id = self.id, address = %self.address, failed, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.pending.fail_all(None);
        self.reader_task.abort();
        self.writer_task.abort();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn reply_document(reply: WireMessage) -> Result<Document> {
    let op = reply.op_code();
    reply.into_reply_document().ok_or_else(|| {
        Error::Frame(FrameError::InvalidDocument(format!(
            "{op:?} reply carried no document"
        )))
    })
}

async fn read_loop<R>(connection_id: u64, mut reader: R, pending: Arc<PendingRequests>, max_message_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut assembler = FrameAssembler::new(max_message_size);
    let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

    let cause = loop {
        buffer.clear();
        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                debug!(connection_id, "peer closed the stream");
                break None;
            }
            Ok(_) => {
                let decoded = assembler.push(&buffer);
                for reply in decoded.frames {
                    let response_to = reply.response_to();
                    if !pending.resolve(response_to, reply) {
                        warn!(connection_id, response_to, "dropping reply with no pending request");
                    }
                }
                if let Some(e) = decoded.error {
                    error!(connection_id, error = %e, "framing error, closing connection");
                    break Some(e);
                }
            }
            Err(e) => {
                warn!(connection_id, error = %e, "read failed");
                break None;
            }
        }
    };

    let failed = pending.fail_all(cause.as_ref());
    debug!(connection_id, failed, "reader stopped");
}

async fn write_loop<W>(
    connection_id: u64,
    mut writer: W,
    mut queue: mpsc::Receiver<Outbound>,
    pending: Arc<PendingRequests>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(Outbound { frame, written }) = queue.recv().await {
        let result = async {
            writer.write_all(&frame).await?;
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                if let Some(tx) = written {
                    let _ = tx.send(Ok(()));
                }
            }
            Err(e) => {
                warn!(connection_id, error = %e, "write failed");
                if let Some(tx) = written {
                    let _ = tx.send(Err(Error::Io(e)));
                }
                break;
            }
        }
    }

    pending.fail_all(None);
    let _ = writer.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;
    use mongolink_protocol::{MessageHeader, OpInsert};

    const MAX: usize = 48 * 1024 * 1024;

    fn address() -> ServerAddress {
        ServerAddress::new("localhost", 27017)
    }

    async fn read_frame<R: AsyncRead + Unpin>(stream: &mut R) -> WireMessage {
        let mut header = [0u8; MessageHeader::LENGTH];
        stream.read_exact(&mut header).await.unwrap();
        let parsed = MessageHeader::parse(&header).unwrap();
        let mut body = vec![0u8; parsed.body_length()];
        stream.read_exact(&mut body).await.unwrap();
        WireMessage::decode(&parsed, &body).unwrap()
    }

    fn reply_to(request_id: i32, body: Document) -> Vec<u8> {
        let mut msg = OpMsg::new(body);
        msg.response_to = request_id;
        msg.request_id = 9000 + request_id;
        WireMessage::Message(msg).encode().unwrap().to_vec()
    }

    #[test]
    fn test_register_after_close_fails() {
        let pending = PendingRequests::default();
        assert_eq!(pending.fail_all(None), 0);
        assert!(pending.register(1).is_err());
    }

    #[test]
    fn test_register_refuses_busy_id() {
        let pending = PendingRequests::default();
        let _first = pending.register(5).unwrap().unwrap();
        assert!(pending.register(5).unwrap().is_none());
        assert_eq!(pending.len(), 1);
    }

    #[tokio::test]
    async fn test_wrapped_counter_skips_in_flight_id() {
        let (client, _server) = tokio::io::duplex(1024);
        let conn = Connection::from_stream(address(), client, MAX);
        let _waiting = conn.pending.register(1).unwrap().unwrap();

        conn.next_request_id.store(1, Ordering::Relaxed);
        let (request_id, _receiver) = conn.register_next().unwrap();
        assert_eq!(request_id, 2);
        assert_eq!(conn.pending_requests(), 2);
    }

    #[tokio::test]
    async fn test_request_id_allocation_wraps() {
        let (client, _server) = tokio::io::duplex(1024);
        let conn = Connection::from_stream(address(), client, MAX);
        conn.next_request_id.store(i32::MAX, Ordering::Relaxed);
        assert_eq!(conn.next_request_id(), i32::MAX);
        assert_eq!(conn.next_request_id(), 1);
        assert_eq!(conn.next_request_id(), 2);
    }

    #[tokio::test]
    async fn test_command_round_trip() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let conn = Connection::from_stream(address(), client, MAX);

        let server_task = tokio::spawn(async move {
            let request = read_frame(&mut server).await;
            let WireMessage::Message(msg) = &request else {
                panic!("expected OP_MSG, got {request:?}");
            };
            assert_eq!(msg.body.get_str("$db").unwrap(), "admin");
            server
                .write_all(&reply_to(request.request_id(), doc! { "ok": 1.0, "pong": true }))
                .await
                .unwrap();
            server
        });

        let reply = conn
            .command("admin", doc! { "ping": 1 }, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(reply.get_bool("pong").unwrap());
        assert_eq!(conn.pending_requests(), 0);
        drop(server_task.await.unwrap());
    }

    #[tokio::test]
    async fn test_timeout_retires_slot() {
        let (client, _server) = tokio::io::duplex(64 * 1024);
        let conn = Connection::from_stream(address(), client, MAX);

        let err = conn
            .command("admin", doc! { "ping": 1 }, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert_eq!(conn.pending_requests(), 0);
        assert!(!conn.is_closed());
    }

    #[tokio::test]
    async fn test_peer_close_fails_outstanding_requests() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let conn = Arc::new(Connection::from_stream(address(), client, MAX));

        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.command("admin", doc! { "ping": 1 }, None).await })
        };
        read_frame(&mut server).await;
        drop(server);

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.command("admin", doc! { "ping": 1 }, None).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_malformed_frame_closes_connection() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let conn = Arc::new(Connection::from_stream(address(), client, MAX));

        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.command("admin", doc! { "ping": 1 }, None).await })
        };
        read_frame(&mut server).await;
        // Declared length below the header size
        server.write_all(&8i32.to_le_bytes()).await.unwrap();

        assert!(matches!(
            waiter.await.unwrap(),
            Err(Error::Frame(FrameError::InvalidLength { declared: 8, .. }))
        ));
        assert!(conn.is_closed());
        assert!(matches!(
            conn.command("admin", doc! { "ping": 1 }, None).await,
            Err(Error::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_reply_ahead_of_bad_frame_is_delivered() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let conn = Arc::new(Connection::from_stream(address(), client, MAX));

        let waiter = {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move { conn.command("admin", doc! { "ping": 1 }, None).await })
        };
        let request = read_frame(&mut server).await;
        let mut bytes = reply_to(request.request_id(), doc! { "ok": 1.0 });
        bytes.extend_from_slice(&8i32.to_le_bytes());
        server.write_all(&bytes).await.unwrap();

        let reply = waiter.await.unwrap().unwrap();
        assert_eq!(reply.get_f64("ok").unwrap(), 1.0);
        tokio::time::timeout(Duration::from_secs(5), async {
            while !conn.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_send_no_reply_flushes() {
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        let conn = Connection::from_stream(address(), client, MAX);

        conn.send_no_reply(WireMessage::Insert(OpInsert {
            request_id: 0,
            flags: 0,
            full_collection_name: "app.events".to_string(),
            documents: vec![doc! { "n": 1 }],
        }))
        .await
        .unwrap();

        let received = read_frame(&mut server).await;
        assert!(matches!(received, WireMessage::Insert(ref m) if m.documents.len() == 1));
        assert!(received.request_id() > 0);
    }

    #[tokio::test]
    async fn test_send_no_reply_rejects_commands() {
        let (client, _server) = tokio::io::duplex(1024);
        let conn = Connection::from_stream(address(), client, MAX);
        let result = conn
            .send_no_reply(WireMessage::Message(OpMsg::new(doc! { "ping": 1 })))
            .await;
        assert!(matches!(result, Err(Error::Internal(_))));
    }

    #[tokio::test]
    async fn test_close_is_observable() {
        let (client, _server) = tokio::io::duplex(1024);
        let conn = Connection::from_stream(address(), client, MAX);
        assert!(!conn.is_closed());
        conn.close();
        assert!(conn.is_closed());
        assert!(matches!(
            conn.command("admin", doc! { "ping": 1 }, None).await,
            Err(Error::ConnectionClosed)
        ));
    }
}
