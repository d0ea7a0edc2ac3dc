//! MongoDB wire protocol codec
//!
//! Pure encode/decode of wire frames with no I/O:
//! - 16-byte little-endian header
//! - legacy opcodes (OP_QUERY, OP_REPLY, OP_INSERT, OP_UPDATE, OP_DELETE,
//!   OP_GET_MORE, OP_KILL_CURSORS)
//! - OP_MSG with body and document-sequence sections and optional CRC-32C
//! - streaming reassembly of frames from arbitrary byte chunks

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod document;
pub mod framing;
pub mod header;
pub mod message;
pub mod op_msg;
pub mod opcode;
pub mod reader;

pub use framing::{Decoded, FrameAssembler};
pub use header::MessageHeader;
pub use message::{
    OpDelete, OpGetMore, OpInsert, OpKillCursors, OpQuery, OpReply, OpUpdate, WireMessage,
};
pub use op_msg::{DocumentSequence, MsgFlags, OpMsg, SectionKind};
pub use opcode::OpCode;
