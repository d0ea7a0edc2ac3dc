//! Boundary with the BSON document codec

use bson::Document;
use bytes::{BufMut, BytesMut};

use mongolink_common::{Error, FrameError, Result};

/// Smallest valid document: length prefix plus terminator
const MIN_DOCUMENT_LENGTH: usize = 5;

/// Append the encoding of `doc` to `buf`
pub fn encode_into(buf: &mut BytesMut, doc: &Document) -> Result<()> {
    let mut writer = buf.writer();
    doc.to_writer(&mut writer)
        .map_err(|e| Error::Serialization(format!("failed to encode document: {e}")))
}

/// Encoded size of `doc` in bytes
pub fn byte_length(doc: &Document) -> Result<usize> {
    bson::to_vec(doc)
        .map(|bytes| bytes.len())
        .map_err(|e| Error::Serialization(format!("failed to encode document: {e}")))
}

/// Decode the first document in `bytes`, returning it with the number of bytes consumed
pub fn decode_one(bytes: &[u8]) -> std::result::Result<(Document, usize), FrameError> {
    if bytes.len() < MIN_DOCUMENT_LENGTH {
        return Err(FrameError::Truncated {
            needed: MIN_DOCUMENT_LENGTH,
            remaining: bytes.len(),
        });
    }
    let declared = i32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let length = usize::try_from(declared)
        .ok()
        .filter(|len| *len >= MIN_DOCUMENT_LENGTH)
        .ok_or_else(|| FrameError::InvalidDocument(format!("invalid document length {declared}")))?;
    if length > bytes.len() {
        return Err(FrameError::Truncated {
            needed: length,
            remaining: bytes.len(),
        });
    }

    let doc = Document::from_reader(&mut &bytes[..length])
        .map_err(|e| FrameError::InvalidDocument(e.to_string()))?;
    Ok((doc, length))
}
