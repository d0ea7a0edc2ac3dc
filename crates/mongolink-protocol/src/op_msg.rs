//! OP_MSG, the extensible message format

use bson::Document;
use bytes::{BufMut, BytesMut};

use mongolink_common::{Error, FrameError, Result};

use crate::document;
use crate::reader::WireReader;

/// OP_MSG flag bits
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MsgFlags(pub u32);

impl MsgFlags {
    pub const CHECKSUM_PRESENT: u32 = 1;
    pub const MORE_TO_COME: u32 = 1 << 1;
    pub const EXHAUST_ALLOWED: u32 = 1 << 16;

    /// Bits 0-15 must be understood by the receiver
    const REQUIRED_MASK: u32 = 0xFFFF;
    const KNOWN: u32 = Self::CHECKSUM_PRESENT | Self::MORE_TO_COME | Self::EXHAUST_ALLOWED;

    pub fn contains(self, bit: u32) -> bool {
        self.0 & bit != 0
    }

    #[must_use]
    pub fn with(self, bit: u32) -> Self {
        Self(self.0 | bit)
    }

    fn unknown_required_bits(self) -> u32 {
        self.0 & Self::REQUIRED_MASK & !Self::KNOWN
    }
}

/// OP_MSG section types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SectionKind {
    Body = 0,
    DocumentSequence = 1,
}

/// A named batch of documents carried next to the body (e.g. `documents` for inserts)
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentSequence {
    pub identifier: String,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OpMsg {
    pub request_id: i32,
    pub response_to: i32,
    pub flags: MsgFlags,
    pub body: Document,
    pub sequences: Vec<DocumentSequence>,
}

impl OpMsg {
    pub fn new(body: Document) -> Self {
        Self {
            request_id: 0,
            response_to: 0,
            flags: MsgFlags::default(),
            body,
            sequences: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_sequence(mut self, identifier: impl Into<String>, documents: Vec<Document>) -> Self {
        self.sequences.push(DocumentSequence {
            identifier: identifier.into(),
            documents,
        });
        self
    }

    #[must_use]
    pub fn with_flags(mut self, flags: MsgFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Flags and sections. The checksum trailer is appended by the framer
    /// because it covers the header too.
    pub(crate) fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u32_le(self.flags.0);

        buf.put_u8(SectionKind::Body as u8);
        document::encode_into(buf, &self.body)?;

        for sequence in &self.sequences {
            buf.put_u8(SectionKind::DocumentSequence as u8);
            let size_at = buf.len();
            buf.put_i32_le(0);
            crate::message::put_cstring(buf, &sequence.identifier)?;
            for doc in &sequence.documents {
                document::encode_into(buf, doc)?;
            }
            let size = i32::try_from(buf.len() - size_at)
                .map_err(|_| Error::Serialization("document sequence too large".to_string()))?;
            buf[size_at..size_at + 4].copy_from_slice(&size.to_le_bytes());
        }
        Ok(())
    }

    /// Decode flags and sections. `header_bytes` is needed to verify the checksum.
    pub(crate) fn decode_body(
        request_id: i32,
        response_to: i32,
        header_bytes: &[u8],
        body: &[u8],
    ) -> std::result::Result<Self, FrameError> {
        let mut reader = WireReader::new(body);
        let flags = MsgFlags(reader.read_u32_le()?);

        let unknown = flags.unknown_required_bits();
        if unknown != 0 {
            return Err(FrameError::UnsupportedFlags(unknown));
        }

        let sections = if flags.contains(MsgFlags::CHECKSUM_PRESENT) {
            if body.len() < 8 {
                return Err(FrameError::Truncated {
                    needed: 8,
                    remaining: body.len(),
                });
            }
            let (covered, trailer) = body.split_at(body.len() - 4);
            let expected = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
            let actual = crc32c::crc32c_append(crc32c::crc32c(header_bytes), covered);
            if expected != actual {
                return Err(FrameError::ChecksumMismatch { expected, actual });
            }
            &covered[4..]
        } else {
            reader.read_bytes(reader.remaining())?
        };

        let mut reader = WireReader::new(sections);
        let mut body_doc = None;
        let mut sequences = Vec::new();

        while !reader.is_empty() {
            match reader.read_u8()? {
                0 => {
                    if body_doc.is_some() {
                        return Err(FrameError::InvalidDocument(
                            "more than one body section".to_string(),
                        ));
                    }
                    body_doc = Some(reader.read_document()?);
                }
                1 => sequences.push(read_sequence(&mut reader)?),
                other => return Err(FrameError::InvalidSectionKind(other)),
            }
        }

        let body = body_doc
            .ok_or_else(|| FrameError::InvalidDocument("missing body section".to_string()))?;

        Ok(Self {
            request_id,
            response_to,
            flags,
            body,
            sequences,
        })
    }
}

fn read_sequence(reader: &mut WireReader<'_>) -> std::result::Result<DocumentSequence, FrameError> {
    let declared = reader.read_i32_le()?;
    let size = usize::try_from(declared)
        .ok()
        .filter(|size| *size >= 4)
        .ok_or(FrameError::InvalidLength {
            declared: i64::from(declared),
            actual: reader.remaining(),
        })?;

    let mut section = WireReader::new(reader.read_bytes(size - 4)?);
    let identifier = section.read_cstring()?;
    let mut documents = Vec::new();
    while !section.is_empty() {
        documents.push(section.read_document()?);
    }
    Ok(DocumentSequence {
        identifier,
        documents,
    })
}
