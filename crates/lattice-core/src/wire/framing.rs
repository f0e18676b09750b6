//! Length-prefixed frame codec for the peer dispatch protocol.
//!
//! Each frame is a 4-byte big-endian length followed by the payload:
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! Frame length is validated before any allocation; frames larger than the
//! configured maximum are rejected. Empty frames are valid.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame's payload.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame of {length} bytes exceeds the maximum of {max} bytes")]
    FrameTooLarge { length: usize, max: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec for [`tokio_util::codec::Framed`] over a peer connection.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self { max_frame_size: MAX_FRAME_SIZE }
    }

    /// A codec with a tighter frame bound, for tests and constrained
    /// deployments. Values above [`MAX_FRAME_SIZE`] are clamped.
    #[must_use]
    pub fn with_max_size(max_frame_size: usize) -> Self {
        Self { max_frame_size: max_frame_size.min(MAX_FRAME_SIZE) }
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&src[..HEADER_LEN]);
        let length = u32::from_be_bytes(header) as usize;

        if length > self.max_frame_size {
            return Err(FrameError::FrameTooLarge { length, max: self.max_frame_size });
        }

        if src.len() < HEADER_LEN + length {
            src.reserve(HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), FrameError> {
        if payload.len() > self.max_frame_size {
            return Err(FrameError::FrameTooLarge {
                length: payload.len(),
                max: self.max_frame_size,
            });
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
