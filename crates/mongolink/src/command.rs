//! Command reply checking and cursor command builders

use std::fmt;
use std::time::Duration;

use bson::{doc, Bson, Document};

use mongolink_common::{CommandError, Error, Result};

/// `db.collection`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

impl Namespace {
    pub fn new(db: impl Into<String>, coll: impl Into<String>) -> Self {
        Self {
            db: db.into(),
            coll: coll.into(),
        }
    }

    /// Split on the first dot; collection names may contain more
    pub fn parse(ns: &str) -> Result<Self> {
        match ns.split_once('.') {
            Some((db, coll)) if !db.is_empty() && !coll.is_empty() => Ok(Self::new(db, coll)),
            _ => Err(Error::Serialization(format!("invalid namespace {ns:?}"))),
        }
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.db, self.coll)
    }
}

/// True when the reply's `ok` field signals success. Servers send it as a
/// double, but older ones and proxies use ints or bools.
pub fn is_ok(reply: &Document) -> bool {
    match reply.get("ok") {
        Some(Bson::Double(v)) => *v == 1.0,
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Boolean(v)) => *v,
        _ => false,
    }
}

/// Turn a failed reply into [`Error::ServerReported`]
pub fn check_ok(reply: Document) -> Result<Document> {
    if is_ok(&reply) {
        return Ok(reply);
    }
    Err(Error::ServerReported(command_error(&reply)))
}

pub fn command_error(reply: &Document) -> CommandError {
    let code = match reply.get("code") {
        Some(Bson::Int32(code)) => *code,
        Some(Bson::Int64(code)) => i32::try_from(*code).unwrap_or(i32::MAX),
        Some(Bson::Double(code)) => *code as i32,
        _ => 0,
    };
    CommandError {
        code,
        code_name: reply.get_str("codeName").ok().map(str::to_string),
        message: reply
            .get_str("errmsg")
            .unwrap_or("command failed without errmsg")
            .to_string(),
    }
}

/// Read a cursor id, which servers send as int64 but some proxies as int32
pub fn cursor_id(cursor: &Document) -> Result<i64> {
    match cursor.get("id") {
        Some(Bson::Int64(id)) => Ok(*id),
        Some(Bson::Int32(id)) => Ok(i64::from(*id)),
        other => Err(Error::Serialization(format!(
            "cursor id missing or not an integer: {other:?}"
        ))),
    }
}

pub fn get_more(
    namespace: &Namespace,
    cursor_id: i64,
    batch_size: Option<i32>,
    max_await_time: Option<Duration>,
) -> Document {
    let mut command = doc! {
        "getMore": cursor_id,
        "collection": namespace.coll.as_str(),
    };
    if let Some(size) = batch_size {
        command.insert("batchSize", size);
    }
    if let Some(wait) = max_await_time {
        command.insert("maxTimeMS", i64::try_from(wait.as_millis()).unwrap_or(i64::MAX));
    }
    command
}

pub fn kill_cursors(namespace: &Namespace, cursor_ids: &[i64]) -> Document {
    doc! {
        "killCursors": namespace.coll.as_str(),
        "cursors": cursor_ids.iter().map(|id| Bson::Int64(*id)).collect::<Vec<_>>(),
    }
}
