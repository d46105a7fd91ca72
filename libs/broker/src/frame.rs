//! Producer ingress framing.
//!
//! ```text
//! u32 BE frame_len | u16 BE key_len | key | value
//! ```
//!
//! `frame_len` covers everything after itself.

use thiserror::Error;

const LEN_BYTES: usize = 4;
const KEY_LEN_BYTES: usize = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("frame of {frame_len} bytes cannot hold key of {key_len} bytes")]
    KeyOverrun { frame_len: usize, key_len: usize },

    #[error("key too long: {0} bytes")]
    KeyTooLong(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerFrame {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    /// Largest frame body, length prefix excluded (0 = unlimited).
    max_frame: usize,
}

impl FrameCodec {
    pub fn new(max_frame: usize) -> Self {
        Self { max_frame }
    }

    /// Decode one frame from the head of `buf`.
    ///
    /// Returns `Ok(None)` while the buffer holds an incomplete frame, and the
    /// number of consumed bytes otherwise.
    pub fn decode(&self, buf: &[u8]) -> Result<Option<(ProducerFrame, usize)>, FrameError> {
        if buf.len() < LEN_BYTES {
            return Ok(None);
        }
        let frame_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if self.max_frame > 0 && frame_len > self.max_frame {
            return Err(FrameError::TooLarge { size: frame_len, max: self.max_frame });
        }
        if frame_len < KEY_LEN_BYTES {
            return Err(FrameError::KeyOverrun { frame_len, key_len: 0 });
        }

        let total = LEN_BYTES + frame_len;
        if buf.len() < total {
            return Ok(None);
        }

        let body = &buf[LEN_BYTES..total];
        let key_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        if KEY_LEN_BYTES + key_len > frame_len {
            return Err(FrameError::KeyOverrun { frame_len, key_len });
        }
        let (key, value) = body[KEY_LEN_BYTES..].split_at(key_len);

        Ok(Some((ProducerFrame { key: key.to_vec(), value: value.to_vec() }, total)))
    }

    pub fn encode(&self, frame: &ProducerFrame, buf: &mut Vec<u8>) -> Result<(), FrameError> {
        if frame.key.len() > u16::MAX as usize {
            return Err(FrameError::KeyTooLong(frame.key.len()));
        }
        let frame_len = KEY_LEN_BYTES + frame.key.len() + frame.value.len();
        if (self.max_frame > 0 && frame_len > self.max_frame) || frame_len > u32::MAX as usize {
            return Err(FrameError::TooLarge { size: frame_len, max: self.max_frame });
        }

        buf.reserve(LEN_BYTES + frame_len);
        buf.extend_from_slice(&(frame_len as u32).to_be_bytes());
        buf.extend_from_slice(&(frame.key.len() as u16).to_be_bytes());
        buf.extend_from_slice(&frame.key);
        buf.extend_from_slice(&frame.value);
        Ok(())
    }
}
