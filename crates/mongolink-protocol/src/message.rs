//! Wire messages and their encode/decode
//!
//! Legacy bodies are positional; fields are written and read in the exact
//! order below. Update, Delete, GetMore and KillCursors start with a reserved
//! zero `i32`; the header carries the only length.

use bson::Document;
use bytes::{BufMut, BytesMut};

use mongolink_common::{Error, FrameError, Result};

use crate::document;
use crate::header::MessageHeader;
use crate::op_msg::{MsgFlags, OpMsg};
use crate::opcode::OpCode;
use crate::reader::WireReader;

/// Legacy query
#[derive(Debug, Clone, PartialEq)]
pub struct OpQuery {
    pub request_id: i32,
    pub flags: i32,
    pub full_collection_name: String,
    pub number_to_skip: i32,
    pub number_to_return: i32,
    pub query: Document,
    pub return_fields_selector: Option<Document>,
}

impl OpQuery {
    pub const SECONDARY_OK: i32 = 1 << 2;
    pub const NO_CURSOR_TIMEOUT: i32 = 1 << 4;

    /// A single-batch command query against `<db>.$cmd`
    pub fn command(db: &str, command: Document) -> Self {
        Self {
            request_id: 0,
            flags: 0,
            full_collection_name: format!("{db}.$cmd"),
            number_to_skip: 0,
            number_to_return: -1,
            query: command,
            return_fields_selector: None,
        }
    }
}

/// Legacy reply
#[derive(Debug, Clone, PartialEq)]
pub struct OpReply {
    pub request_id: i32,
    pub response_to: i32,
    pub response_flags: i32,
    pub cursor_id: i64,
    pub starting_from: i32,
    pub documents: Vec<Document>,
}

impl OpReply {
    pub const CURSOR_NOT_FOUND: i32 = 1;
    pub const QUERY_FAILURE: i32 = 1 << 1;
    pub const AWAIT_CAPABLE: i32 = 1 << 3;
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpInsert {
    pub request_id: i32,
    pub flags: i32,
    pub full_collection_name: String,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpUpdate {
    pub request_id: i32,
    pub full_collection_name: String,
    pub flags: i32,
    pub selector: Document,
    pub update: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpDelete {
    pub request_id: i32,
    pub full_collection_name: String,
    pub flags: i32,
    pub selector: Document,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpGetMore {
    pub request_id: i32,
    pub full_collection_name: String,
    pub number_to_return: i32,
    pub cursor_id: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpKillCursors {
    pub request_id: i32,
    pub cursor_ids: Vec<i64>,
}

/// Any message the codec can frame
#[derive(Debug, Clone, PartialEq)]
pub enum WireMessage {
    Query(OpQuery),
    Reply(OpReply),
    Insert(OpInsert),
    Update(OpUpdate),
    Delete(OpDelete),
    GetMore(OpGetMore),
    KillCursors(OpKillCursors),
    Message(OpMsg),
}

impl WireMessage {
    pub fn op_code(&self) -> OpCode {
        match self {
            WireMessage::Query(_) => OpCode::Query,
            WireMessage::Reply(_) => OpCode::Reply,
            WireMessage::Insert(_) => OpCode::Insert,
            WireMessage::Update(_) => OpCode::Update,
            WireMessage::Delete(_) => OpCode::Delete,
            WireMessage::GetMore(_) => OpCode::GetMore,
            WireMessage::KillCursors(_) => OpCode::KillCursors,
            WireMessage::Message(_) => OpCode::Msg,
        }
    }

    pub fn request_id(&self) -> i32 {
        match self {
            WireMessage::Query(m) => m.request_id,
            WireMessage::Reply(m) => m.request_id,
            WireMessage::Insert(m) => m.request_id,
            WireMessage::Update(m) => m.request_id,
            WireMessage::Delete(m) => m.request_id,
            WireMessage::GetMore(m) => m.request_id,
            WireMessage::KillCursors(m) => m.request_id,
            WireMessage::Message(m) => m.request_id,
        }
    }

    pub fn set_request_id(&mut self, request_id: i32) {
        let slot = match self {
            WireMessage::Query(m) => &mut m.request_id,
            WireMessage::Reply(m) => &mut m.request_id,
            WireMessage::Insert(m) => &mut m.request_id,
            WireMessage::Update(m) => &mut m.request_id,
            WireMessage::Delete(m) => &mut m.request_id,
            WireMessage::GetMore(m) => &mut m.request_id,
            WireMessage::KillCursors(m) => &mut m.request_id,
            WireMessage::Message(m) => &mut m.request_id,
        };
        *slot = request_id;
    }

    /// Id of the request this message answers; 0 for requests
    pub fn response_to(&self) -> i32 {
        match self {
            WireMessage::Reply(m) => m.response_to,
            WireMessage::Message(m) => m.response_to,
            _ => 0,
        }
    }

    /// True when the peer must not send a reply
    pub fn expects_no_reply(&self) -> bool {
        match self {
            WireMessage::Insert(_)
            | WireMessage::Update(_)
            | WireMessage::Delete(_)
            | WireMessage::KillCursors(_) => true,
            WireMessage::Message(m) => m.flags.contains(MsgFlags::MORE_TO_COME),
            _ => false,
        }
    }

    /// The command reply document: the OP_MSG body or the first OP_REPLY document
    pub fn into_reply_document(self) -> Option<Document> {
        match self {
            WireMessage::Message(m) => Some(m.body),
            WireMessage::Reply(m) => m.documents.into_iter().next(),
            _ => None,
        }
    }

    /// Encode header and body into a single frame
    pub fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::with_capacity(256);
        let header = MessageHeader {
            message_length: 0,
            request_id: self.request_id(),
            response_to: self.response_to(),
            op_code: self.op_code(),
        };
        header.write_to(&mut buf);

        match self {
            WireMessage::Query(m) => {
                buf.put_i32_le(m.flags);
                put_cstring(&mut buf, &m.full_collection_name)?;
                buf.put_i32_le(m.number_to_skip);
                buf.put_i32_le(m.number_to_return);
                document::encode_into(&mut buf, &m.query)?;
                if let Some(selector) = &m.return_fields_selector {
                    document::encode_into(&mut buf, selector)?;
                }
            }
            WireMessage::Reply(m) => {
                buf.put_i32_le(m.response_flags);
                buf.put_i64_le(m.cursor_id);
                buf.put_i32_le(m.starting_from);
                buf.put_i32_le(len_i32(m.documents.len())?);
                for doc in &m.documents {
                    document::encode_into(&mut buf, doc)?;
                }
            }
            WireMessage::Insert(m) => {
                buf.put_i32_le(m.flags);
                put_cstring(&mut buf, &m.full_collection_name)?;
                for doc in &m.documents {
                    document::encode_into(&mut buf, doc)?;
                }
            }
            WireMessage::Update(m) => {
                buf.put_i32_le(0);
                put_cstring(&mut buf, &m.full_collection_name)?;
                buf.put_i32_le(m.flags);
                document::encode_into(&mut buf, &m.selector)?;
                document::encode_into(&mut buf, &m.update)?;
            }
            WireMessage::Delete(m) => {
                buf.put_i32_le(0);
                put_cstring(&mut buf, &m.full_collection_name)?;
                buf.put_i32_le(m.flags);
                document::encode_into(&mut buf, &m.selector)?;
            }
            WireMessage::GetMore(m) => {
                buf.put_i32_le(0);
                put_cstring(&mut buf, &m.full_collection_name)?;
                buf.put_i32_le(m.number_to_return);
                buf.put_i64_le(m.cursor_id);
            }
            WireMessage::KillCursors(m) => {
                buf.put_i32_le(0);
                buf.put_i32_le(len_i32(m.cursor_ids.len())?);
                for id in &m.cursor_ids {
                    buf.put_i64_le(*id);
                }
            }
            WireMessage::Message(m) => m.encode_body(&mut buf)?,
        }

        let checksum = matches!(self, WireMessage::Message(m) if m.flags.contains(MsgFlags::CHECKSUM_PRESENT));
        let total = buf.len() + if checksum { 4 } else { 0 };
        let length = len_i32(total)?;
        buf[..4].copy_from_slice(&length.to_le_bytes());

        if checksum {
            let crc = crc32c::crc32c(&buf);
            buf.put_u32_le(crc);
        }
        Ok(buf)
    }

    /// Decode a body whose header has already been parsed
    pub fn decode(header: &MessageHeader, body: &[u8]) -> std::result::Result<Self, FrameError> {
        let declared = i64::from(header.message_length);
        let actual = MessageHeader::LENGTH + body.len();
        if usize::try_from(declared).ok() != Some(actual) {
            return Err(FrameError::InvalidLength { declared, actual });
        }

        let mut reader = WireReader::new(body);
        let message = match header.op_code {
            OpCode::Query => {
                let flags = reader.read_i32_le()?;
                let full_collection_name = reader.read_cstring()?;
                let number_to_skip = reader.read_i32_le()?;
                let number_to_return = reader.read_i32_le()?;
                let query = reader.read_document()?;
                let return_fields_selector = if reader.is_empty() {
                    None
                } else {
                    Some(reader.read_document()?)
                };
                WireMessage::Query(OpQuery {
                    request_id: header.request_id,
                    flags,
                    full_collection_name,
                    number_to_skip,
                    number_to_return,
                    query,
                    return_fields_selector,
                })
            }
            OpCode::Reply => {
                let response_flags = reader.read_i32_le()?;
                let cursor_id = reader.read_i64_le()?;
                let starting_from = reader.read_i32_le()?;
                let number_returned = reader.read_i32_le()?;
                let mut documents = Vec::new();
                while !reader.is_empty() {
                    documents.push(reader.read_document()?);
                }
                if usize::try_from(number_returned).ok() != Some(documents.len()) {
                    return Err(FrameError::InvalidDocument(format!(
                        "reply declares {number_returned} documents but carries {}",
                        documents.len()
                    )));
                }
                WireMessage::Reply(OpReply {
                    request_id: header.request_id,
                    response_to: header.response_to,
                    response_flags,
                    cursor_id,
                    starting_from,
                    documents,
                })
            }
            OpCode::Insert => {
                let flags = reader.read_i32_le()?;
                let full_collection_name = reader.read_cstring()?;
                let mut documents = Vec::new();
                while !reader.is_empty() {
                    documents.push(reader.read_document()?);
                }
                WireMessage::Insert(OpInsert {
                    request_id: header.request_id,
                    flags,
                    full_collection_name,
                    documents,
                })
            }
            OpCode::Update => {
                let _zero = reader.read_i32_le()?;
                let full_collection_name = reader.read_cstring()?;
                let flags = reader.read_i32_le()?;
                let selector = reader.read_document()?;
                let update = reader.read_document()?;
                WireMessage::Update(OpUpdate {
                    request_id: header.request_id,
                    full_collection_name,
                    flags,
                    selector,
                    update,
                })
            }
            OpCode::Delete => {
                let _zero = reader.read_i32_le()?;
                let full_collection_name = reader.read_cstring()?;
                let flags = reader.read_i32_le()?;
                let selector = reader.read_document()?;
                WireMessage::Delete(OpDelete {
                    request_id: header.request_id,
                    full_collection_name,
                    flags,
                    selector,
                })
            }
            OpCode::GetMore => {
                let _zero = reader.read_i32_le()?;
                let full_collection_name = reader.read_cstring()?;
                let number_to_return = reader.read_i32_le()?;
                let cursor_id = reader.read_i64_le()?;
                WireMessage::GetMore(OpGetMore {
                    request_id: header.request_id,
                    full_collection_name,
                    number_to_return,
                    cursor_id,
                })
            }
            OpCode::KillCursors => {
                let _zero = reader.read_i32_le()?;
                let count = reader.read_i32_le()?;
                let count = usize::try_from(count).map_err(|_| FrameError::InvalidLength {
                    declared: i64::from(count),
                    actual: reader.remaining(),
                })?;
                let mut cursor_ids = Vec::with_capacity(count.min(reader.remaining() / 8));
                for _ in 0..count {
                    cursor_ids.push(reader.read_i64_le()?);
                }
                WireMessage::KillCursors(OpKillCursors {
                    request_id: header.request_id,
                    cursor_ids,
                })
            }
            OpCode::Msg => {
                let mut header_bytes = BytesMut::with_capacity(MessageHeader::LENGTH);
                header.write_to(&mut header_bytes);
                let msg =
                    OpMsg::decode_body(header.request_id, header.response_to, &header_bytes, body)?;
                return Ok(WireMessage::Message(msg));
            }
        };

        reader.finish()?;
        Ok(message)
    }

    /// Decode a complete frame, header included
    pub fn decode_frame(frame: &[u8]) -> std::result::Result<Self, FrameError> {
        let header = MessageHeader::parse(frame)?;
        Self::decode(&header, &frame[MessageHeader::LENGTH..])
    }
}

pub(crate) fn put_cstring(buf: &mut BytesMut, value: &str) -> Result<()> {
    if value.as_bytes().contains(&0) {
        return Err(Error::Serialization(format!(
            "string {value:?} contains an interior NUL"
        )));
    }
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
    Ok(())
}

fn len_i32(len: usize) -> Result<i32> {
    i32::try_from(len).map_err(|_| Error::Serialization(format!("length {len} exceeds i32")))
}
