//! Streaming frame reconstruction
//!
//! Socket reads arrive in chunks of arbitrary size. `FrameAssembler` buffers
//! just enough to learn each frame's length, then just enough to hold the
//! whole frame, decodes it and starts over.

use bytes::BytesMut;
use tracing::trace;

use mongolink_common::FrameError;

use crate::header::MessageHeader;
use crate::message::WireMessage;

const LENGTH_PREFIX: usize = 4;

#[derive(Debug)]
enum FrameState {
    /// Fewer than four bytes of the next frame seen so far
    Length { partial: BytesMut },
    /// Length known; collecting the rest of the frame
    Body { awaited: usize, accumulated: BytesMut },
}

impl FrameState {
    fn empty() -> Self {
        FrameState::Length {
            partial: BytesMut::with_capacity(LENGTH_PREFIX),
        }
    }
}

#[derive(Debug)]
pub struct FrameAssembler {
    state: FrameState,
    max_message_size: usize,
}

impl FrameAssembler {
    pub fn new(max_message_size: usize) -> Self {
        Self {
            state: FrameState::empty(),
            max_message_size,
        }
    }

    /// True when no partial frame is buffered
    pub fn is_idle(&self) -> bool {
        matches!(&self.state, FrameState::Length { partial } if partial.is_empty())
    }

    /// Feed one chunk, returning every frame it completes in arrival order.
    ///
    /// Frames completed before a framing error are still returned. After an
    /// error the stream is unsynchronized; the caller must discard the
    /// connection rather than keep feeding.
    pub fn push(&mut self, chunk: &[u8]) -> Decoded {
        let mut frames = Vec::new();
        let error = self.feed(chunk, &mut frames).err();
        Decoded { frames, error }
    }

    fn feed(&mut self, mut chunk: &[u8], frames: &mut Vec<WireMessage>) -> Result<(), FrameError> {
        let max = self.max_message_size;

        while !chunk.is_empty() {
            let next = match &mut self.state {
                FrameState::Length { partial } => {
                    let take = (LENGTH_PREFIX - partial.len()).min(chunk.len());
                    partial.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if partial.len() < LENGTH_PREFIX {
                        None
                    } else {
                        let declared =
                            i32::from_le_bytes([partial[0], partial[1], partial[2], partial[3]]);
                        let awaited = validate_length(declared, max)?;
                        let mut accumulated = BytesMut::with_capacity(awaited);
                        accumulated.extend_from_slice(partial);
                        Some(FrameState::Body {
                            awaited,
                            accumulated,
                        })
                    }
                }
                FrameState::Body {
                    awaited,
                    accumulated,
                } => {
                    let take = (*awaited - accumulated.len()).min(chunk.len());
                    accumulated.extend_from_slice(&chunk[..take]);
                    chunk = &chunk[take..];

                    if accumulated.len() < *awaited {
                        None
                    } else {
                        let frame = std::mem::take(accumulated);
                        trace!(length = frame.len(), "frame complete");
                        frames.push(WireMessage::decode_frame(&frame)?);
                        Some(FrameState::empty())
                    }
                }
            };

            if let Some(state) = next {
                self.state = state;
            }
        }

        Ok(())
    }
}

/// Output of [`FrameAssembler::push`]
#[derive(Debug, Default, PartialEq)]
pub struct Decoded {
    pub frames: Vec<WireMessage>,
    /// Set when the stream broke after `frames`
    pub error: Option<FrameError>,
}

impl Decoded {
    pub fn into_result(self) -> Result<Vec<WireMessage>, FrameError> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.frames),
        }
    }
}

fn validate_length(declared: i32, max: usize) -> Result<usize, FrameError> {
    let length = usize::try_from(declared)
        .ok()
        .filter(|len| *len >= MessageHeader::LENGTH)
        .ok_or(FrameError::InvalidLength {
            declared: i64::from(declared),
            actual: LENGTH_PREFIX,
        })?;
    if length > max {
        return Err(FrameError::MessageTooLarge { length, max });
    }
    Ok(length)
}
