//! Incremental frame parser

use crate::codec::{Codec, PREFIX_LEN};
use crate::error::{ProtocolError, ProtocolResult};
use bytes::{Buf, BytesMut};
use serde::de::DeserializeOwned;
use tracing::{debug, trace};

/// Accumulates bytes from a stream and yields complete frames
pub struct FrameParser {
    buffer: BytesMut,
    codec: Codec,
}

impl FrameParser {
    pub fn new(codec: Codec) -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            codec,
        }
    }

    /// Add data to the parser buffer
    pub fn feed(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Bytes received but not yet consumed
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Try to decode one complete message from the buffer.
    ///
    /// Returns `Ok(None)` until a whole frame has arrived. A frame announcing a
    /// body larger than the configured maximum is an error.
    pub fn parse<T: DeserializeOwned>(&mut self) -> ProtocolResult<Option<T>> {
        if self.buffer.len() < PREFIX_LEN {
            return Ok(None);
        }

        let len = u32::from_be_bytes([
            self.buffer[0],
            self.buffer[1],
            self.buffer[2],
            self.buffer[3],
        ]) as usize;

        if len > self.codec.max_frame_size() {
            debug!(
                size = len,
                max = self.codec.max_frame_size(),
                buffered = self.buffer.len(),
                "Rejecting oversized frame"
            );
            return Err(ProtocolError::FrameTooLarge {
                size: len,
                max: self.codec.max_frame_size(),
            });
        }

        if self.buffer.len() < PREFIX_LEN + len {
            return Ok(None);
        }

        self.buffer.advance(PREFIX_LEN);
        let body = self.buffer.split_to(len);
        trace!(len, remaining = self.buffer.len(), "Frame complete");
        self.codec.decode(&body).map(Some)
    }
}
