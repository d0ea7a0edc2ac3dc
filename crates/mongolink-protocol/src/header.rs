//! Message header (first 16 bytes of every frame)

use bytes::{BufMut, BytesMut};

use mongolink_common::FrameError;

use crate::opcode::OpCode;
use crate::reader::WireReader;

/// Standard message header. All fields are little-endian on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    /// Total frame length including these 16 bytes
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    pub const LENGTH: usize = 16;

    /// Parse a header from the first 16 bytes of `data`
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        let mut reader = WireReader::new(data);
        let message_length = reader.read_i32_le()?;
        let request_id = reader.read_i32_le()?;
        let response_to = reader.read_i32_le()?;
        let op_code = OpCode::try_from(reader.read_i32_le()?)?;

        if message_length < Self::LENGTH as i32 {
            return Err(FrameError::InvalidLength {
                declared: i64::from(message_length),
                actual: data.len(),
            });
        }

        Ok(Self {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }

    /// Serialize the header
    pub fn write_to(&self, buf: &mut BytesMut) {
        buf.put_i32_le(self.message_length);
        buf.put_i32_le(self.request_id);
        buf.put_i32_le(self.response_to);
        buf.put_i32_le(self.op_code.as_i32());
    }

    /// Number of body bytes following the header
    pub fn body_length(&self) -> usize {
        self.message_length as usize - Self::LENGTH
    }
}
