//! Newline-delimited frame codec.
//!
//! A byte stream carries no message boundaries, so frames are terminated by
//! `\n` (an optional preceding `\r` is stripped). The decoder yields raw
//! bytes; UTF-8 validation belongs to [`crate::protocol`] so that a bad
//! frame can be dropped without tearing down the connection.
//!
//! A frame longer than `max_length` bytes is a hard error: the peer is
//! either misbehaving or trying to exhaust memory.

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

use crate::registry::OutboundFrame;

/// Default maximum frame length in bytes, terminator excluded.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4096;

/// Errors from reading or writing frames.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Frame exceeded the configured maximum
    #[error("frame exceeds {max} bytes")]
    FrameTooLong {
        /// Configured maximum
        max: usize,
    },

    /// Transport error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Line codec with a hard length limit.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_length: usize,
    /// Index up to which the buffer has already been searched for `\n`.
    next_index: usize,
}

impl FrameCodec {
    pub fn new(max_length: usize) -> Self {
        Self {
            max_length,
            next_index: 0,
        }
    }

    pub fn max_length(&self) -> usize {
        self.max_length
    }

    fn finish_frame(&self, mut frame: BytesMut) -> Result<BytesMut, CodecError> {
        if frame.last() == Some(&b'\r') {
            frame.truncate(frame.len() - 1);
        }
        if frame.len() > self.max_length {
            return Err(CodecError::FrameTooLong {
                max: self.max_length,
            });
        }
        Ok(frame)
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME_LENGTH)
    }
}

impl Decoder for FrameCodec {
    type Item = BytesMut;
    type Error = CodecError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
        let newline = buf[self.next_index..]
            .iter()
            .position(|b| *b == b'\n')
            .map(|offset| self.next_index + offset);

        match newline {
            Some(index) => {
                self.next_index = 0;
                let frame = buf.split_to(index);
                buf.advance(1);
                self.finish_frame(frame).map(Some)
            }
            None => {
                // One extra byte of slack for a trailing '\r'.
                if buf.len() > self.max_length + 1 {
                    return Err(CodecError::FrameTooLong {
                        max: self.max_length,
                    });
                }
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<BytesMut>, CodecError> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => {
                // Unterminated final frame.
                self.next_index = 0;
                let frame = buf.split_to(buf.len());
                self.finish_frame(frame).map(Some)
            }
        }
    }
}

impl Encoder<OutboundFrame> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, frame: OutboundFrame, dst: &mut BytesMut) -> Result<(), CodecError> {
        let text = frame.as_str();
        dst.reserve(text.len() + 1);
        dst.put_slice(text.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}
