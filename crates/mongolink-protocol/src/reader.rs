//! Bounds-checked cursor over an owned frame body
//!
//! Every read checks the remaining length first and advances the cursor;
//! no offset is ever computed outside this type.

use bson::Document;

use mongolink_common::FrameError;

use crate::document;

pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Read `n` bytes and advance
    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], FrameError> {
        if self.remaining() < n {
            return Err(FrameError::Truncated {
                needed: n,
                remaining: self.remaining(),
            });
        }
        let bytes = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(bytes)
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], FrameError> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.read_bytes(N)?);
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, FrameError> {
        Ok(self.read_array::<1>()?[0])
    }

    pub fn read_i32_le(&mut self) -> Result<i32, FrameError> {
        self.read_array().map(i32::from_le_bytes)
    }

    pub fn read_u32_le(&mut self) -> Result<u32, FrameError> {
        self.read_array().map(u32::from_le_bytes)
    }

    pub fn read_i64_le(&mut self) -> Result<i64, FrameError> {
        self.read_array().map(i64::from_le_bytes)
    }

    /// Read a NUL-terminated UTF-8 string; the terminator must lie inside the body
    pub fn read_cstring(&mut self) -> Result<String, FrameError> {
        let rest = &self.data[self.pos..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or(FrameError::InvalidCString)?;
        let value = std::str::from_utf8(&rest[..end])
            .map_err(|_| FrameError::InvalidCString)?
            .to_string();
        self.pos += end + 1;
        Ok(value)
    }

    /// Read one length-prefixed BSON document
    pub fn read_document(&mut self) -> Result<Document, FrameError> {
        let (doc, consumed) = document::decode_one(&self.data[self.pos..])?;
        self.pos += consumed;
        Ok(doc)
    }

    /// Fail unless every byte has been consumed
    pub fn finish(&self) -> Result<(), FrameError> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(FrameError::InvalidLength {
                declared: self.pos as i64,
                actual: self.data.len(),
            })
        }
    }
}
