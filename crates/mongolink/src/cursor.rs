//! Server-side cursors
//!
//! A cursor is pinned to the connection that opened it: every `getMore` and
//! the final `killCursors` go to that same server. A cursor still open on
//! the server when dropped is killed in the background. With a monitor
//! attached, network failures on the pinned connection mark its server
//! unknown.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use bson::{Bson, Document};
use futures::stream::{self, Stream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use mongolink_common::{Error, Result};

use crate::command::{self, Namespace};
use crate::connection::Connection;
use crate::topology::TopologyMonitor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// More batches may be fetched
    Active,
    /// The server reported cursor id 0
    Exhausted,
    /// Stopped by `kill` or cancellation
    Killed,
    /// A `getMore` failed
    Failed,
}

/// The `cursor` sub-document of a find/aggregate/getMore reply
#[derive(Debug, Clone, PartialEq)]
pub struct CursorBatch {
    pub id: i64,
    pub namespace: Namespace,
    pub documents: Vec<Document>,
}

impl CursorBatch {
    /// Parse `{cursor: {id, ns, firstBatch | nextBatch}}`
    pub fn from_reply(reply: &Document) -> Result<Self> {
        let cursor = reply
            .get_document("cursor")
            .map_err(|_| Error::Serialization("reply has no cursor document".to_string()))?;
        let id = command::cursor_id(cursor)?;
        let namespace = Namespace::parse(
            cursor
                .get_str("ns")
                .map_err(|_| Error::Serialization("cursor has no namespace".to_string()))?,
        )?;
        let batch = cursor
            .get_array("firstBatch")
            .or_else(|_| cursor.get_array("nextBatch"))
            .map_err(|_| Error::Serialization("cursor has no batch".to_string()))?;
        let documents = batch
            .iter()
            .map(|item| match item {
                Bson::Document(doc) => Ok(doc.clone()),
                other => Err(Error::Serialization(format!(
                    "batch entry is not a document: {other:?}"
                ))),
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            id,
            namespace,
            documents,
        })
    }
}

pub struct Cursor {
    id: i64,
    namespace: Namespace,
    connection: Arc<Connection>,
    buffer: VecDeque<Document>,
    state: CursorState,
    batch_size: Option<i32>,
    max_await_time: Option<Duration>,
    timeout: Option<Duration>,
    cancel: CancellationToken,
    cleanup_sent: bool,
    monitor: Option<TopologyMonitor>,
}

impl Cursor {
    pub fn new(connection: Arc<Connection>, batch: CursorBatch) -> Self {
        let state = if batch.id == 0 {
            CursorState::Exhausted
        } else {
            CursorState::Active
        };
        Self {
            id: batch.id,
            namespace: batch.namespace,
            connection,
            buffer: batch.documents.into(),
            state,
            batch_size: None,
            max_await_time: None,
            timeout: None,
            cancel: CancellationToken::new(),
            cleanup_sent: false,
            monitor: None,
        }
    }

    /// Build a cursor from the reply of the command that opened it
    pub fn from_reply(connection: Arc<Connection>, reply: &Document) -> Result<Self> {
        Ok(Self::new(connection, CursorBatch::from_reply(reply)?))
    }

    #[must_use]
    pub fn with_batch_size(mut self, batch_size: i32) -> Self {
        self.batch_size = Some(batch_size);
        self
    }

    /// Server-side wait for new data on tailable await cursors
    #[must_use]
    pub fn with_max_await_time(mut self, wait: Duration) -> Self {
        self.max_await_time = Some(wait);
        self
    }

    /// Client-side deadline for each `getMore`
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Report network failures on this cursor's connection to `monitor`
    #[must_use]
    pub fn with_monitor(mut self, monitor: TopologyMonitor) -> Self {
        self.monitor = Some(monitor);
        self
    }

    #[must_use]
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn namespace(&self) -> &Namespace {
        &self.namespace
    }

    pub fn state(&self) -> CursorState {
        self.state
    }

    pub fn is_exhausted(&self) -> bool {
        self.state == CursorState::Exhausted
    }

    /// Documents received but not yet returned
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Token that stops this cursor after its buffered documents
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Next document, fetching another batch when the buffer runs dry.
    /// `Ok(None)` once the cursor is exhausted, killed or cancelled.
    pub async fn next(&mut self) -> Result<Option<Document>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Ok(Some(doc));
            }
            if self.state != CursorState::Active {
                return Ok(None);
            }
            if self.cancel.is_cancelled() {
                debug!(cursor_id = self.id, "cursor cancelled");
                self.state = CursorState::Killed;
                self.spawn_kill();
                return Ok(None);
            }
            self.get_more().await?;
        }
    }

    async fn get_more(&mut self) -> Result<()> {
        let request = command::get_more(&self.namespace, self.id, self.batch_size, self.max_await_time);
        let outcome = self
            .connection
            .command(&self.namespace.db, request, self.timeout)
            .await
            .and_then(command::check_ok)
            .and_then(|reply| CursorBatch::from_reply(&reply));

        let batch = match outcome {
            Ok(batch) => batch,
            Err(e) => {
                warn!(cursor_id = self.id, error = %e, "getMore failed");
                report_failure(self.monitor.as_ref(), &self.connection, &e);
                self.state = CursorState::Failed;
                return Err(e);
            }
        };

        self.id = batch.id;
        self.buffer.extend(batch.documents);
        if batch.id == 0 {
            self.state = CursorState::Exhausted;
        }
        Ok(())
    }

    /// Kill the server-side cursor now and wait for the acknowledgement
    pub async fn kill(mut self) -> Result<()> {
        if !self.needs_cleanup() {
            return Ok(());
        }
        self.cleanup_sent = true;
        self.state = CursorState::Killed;
        let result = kill_cursor(&self.connection, &self.namespace, self.id, self.timeout).await;
        if let Err(e) = &result {
            report_failure(self.monitor.as_ref(), &self.connection, e);
        }
        result
    }

    /// Adapt into a `Stream` of documents
    pub fn into_stream(self) -> impl Stream<Item = Result<Document>> + Send {
        stream::try_unfold(self, |mut cursor| async move {
            let next = cursor.next().await?;
            Ok::<_, Error>(next.map(|doc| (doc, cursor)))
        })
    }

    fn needs_cleanup(&self) -> bool {
        self.id != 0 && self.state != CursorState::Exhausted && !self.cleanup_sent
    }

    fn spawn_kill(&mut self) {
        if !self.needs_cleanup() {
            return;
        }
        self.cleanup_sent = true;

        let connection = Arc::clone(&self.connection);
        let namespace = self.namespace.clone();
        let id = self.id;
        let timeout = self.timeout;
        let monitor = self.monitor.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = kill_cursor(&connection, &namespace, id, timeout).await {
                        warn!(cursor_id = id, error = %e, "killCursors failed; server will expire the cursor");
                        report_failure(monitor.as_ref(), &connection, &e);
                    }
                });
            }
            Err(_) => warn!(cursor_id = id, "no runtime to kill cursor; server will expire it"),
        }
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        self.spawn_kill();
    }
}

impl std::fmt::Debug for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cursor")
            .field("id", &self.id)
            .field("namespace", &self.namespace)
            .field("state", &self.state)
            .field("buffered", &self.buffer.len())
            .finish_non_exhaustive()
    }
}

fn report_failure(monitor: Option<&TopologyMonitor>, connection: &Connection, error: &Error) {
    if let Some(monitor) = monitor {
        if error.is_network_error() {
            monitor.mark_server_unknown(connection.address(), error);
        }
    }
}

async fn kill_cursor(connection: &Connection, namespace: &Namespace, id: i64, timeout: Option<Duration>) -> Result<()> {
    let reply = connection
        .command(&namespace.db, command::kill_cursors(namespace, &[id]), timeout)
        .await?;
    command::check_ok(reply)?;
    debug!(cursor_id = id, ns = %namespace, "cursor killed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_batch_from_first_reply() {
        let batch = CursorBatch::from_reply(&doc! {
            "cursor": {
                "id": 42_i64,
                "ns": "app.events",
                "firstBatch": [{ "n": 1 }, { "n": 2 }],
            },
            "ok": 1.0,
        })
        .unwrap();
        assert_eq!(batch.id, 42);
        assert_eq!(batch.namespace, Namespace::new("app", "events"));
        assert_eq!(batch.documents.len(), 2);
    }

    #[test]
    fn test_batch_from_next_reply() {
        let batch = CursorBatch::from_reply(&doc! {
            "cursor": { "id": 0_i64, "ns": "app.events", "nextBatch": [] },
            "ok": 1.0,
        })
        .unwrap();
        assert_eq!(batch.id, 0);
        assert!(batch.documents.is_empty());
    }

    #[test]
    fn test_batch_rejects_bad_shapes() {
        assert!(CursorBatch::from_reply(&doc! { "ok": 1.0 }).is_err());
        assert!(CursorBatch::from_reply(&doc! {
            "cursor": { "id": 1_i64, "ns": "app.events", "firstBatch": [1, 2] },
        })
        .is_err());
    }
}
