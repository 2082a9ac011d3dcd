// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Frame reassembly over a byte stream.
//!
//! TCP delivers bytes without message boundaries: a single read may carry a
//! fragment of a frame, several frames, or the tail of one frame plus the head
//! of the next. [`FrameReassembler`] accumulates reads and hands out complete
//! frames in arrival order, keeping any remainder for the next read.

use super::protocol::{Packet, ProtocolError, LENGTH_PREFIX_SIZE, MAX_FRAME_PAYLOAD};
use bytes::{Buf, Bytes, BytesMut};

/// Default initial buffer capacity.
const DEFAULT_CAPACITY: usize = 4096;

/// One complete frame, not yet interpreted.
///
/// The payload is the type byte followed by the body. A zero-length frame
/// has an empty payload and fails to decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub payload: Bytes,
}

impl RawFrame {
    pub fn type_byte(&self) -> Option<u8> {
        self.payload.first().copied()
    }

    pub fn body(&self) -> &[u8] {
        self.payload.get(1..).unwrap_or_default()
    }

    /// Decode the payload into a packet.
    pub fn decode(&self) -> Result<Packet, ProtocolError> {
        match self.payload.split_first() {
            Some((&type_byte, body)) => Packet::decode_raw(type_byte, body),
            None => Err(ProtocolError::Truncated {
                needed: 1,
                available: 0,
            }),
        }
    }
}

/// Accumulates stream bytes and extracts length-prefixed frames.
#[derive(Debug)]
pub struct FrameReassembler {
    buffer: BytesMut,
    max_frame_size: usize,
}

impl Default for FrameReassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameReassembler {
    /// Create a reassembler accepting any frame the length prefix can describe.
    pub fn new() -> Self {
        Self::with_max_frame_size(MAX_FRAME_PAYLOAD)
    }

    /// Create a reassembler rejecting frames whose declared length exceeds `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(DEFAULT_CAPACITY),
            max_frame_size: max_frame_size.min(MAX_FRAME_PAYLOAD),
        }
    }

    /// Append bytes received from the transport.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of buffered bytes not yet returned as frames.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Try to extract the next complete frame.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A short frame is never
    /// an error: the bytes stay buffered until the rest arrives.
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, FramingError> {
        if self.buffer.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let len = u16::from_be_bytes([self.buffer[0], self.buffer[1]]) as usize;

        // Checked before the body arrives so a bad prefix is caught early.
        if len > self.max_frame_size {
            return Err(FramingError::TooLarge {
                len,
                max: self.max_frame_size,
            });
        }

        if self.buffer.len() - LENGTH_PREFIX_SIZE < len {
            return Ok(None);
        }

        self.buffer.advance(LENGTH_PREFIX_SIZE);
        let payload = self.buffer.split_to(len).freeze();
        Ok(Some(RawFrame { payload }))
    }

    /// Lazily drain every complete frame currently buffered.
    ///
    /// The iterator stops at the first incomplete frame. After a framing
    /// error it yields nothing further; the stream cannot be realigned.
    pub fn frames(&mut self) -> Frames<'_> {
        Frames {
            reassembler: self,
            failed: false,
        }
    }

    /// Append `data` and collect every frame it completes.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<RawFrame>, FramingError> {
        self.extend(data);
        self.frames().collect()
    }
}

/// Iterator over the complete frames in a [`FrameReassembler`].
pub struct Frames<'a> {
    reassembler: &'a mut FrameReassembler,
    failed: bool,
}

impl Iterator for Frames<'_> {
    type Item = Result<RawFrame, FramingError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.reassembler.next_frame() {
            Ok(Some(frame)) => Some(Ok(frame)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}

/// Framing error types. All of them are fatal to the connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("Frame too large: {len} > {max}")]
    TooLarge { len: usize, max: usize },
}
