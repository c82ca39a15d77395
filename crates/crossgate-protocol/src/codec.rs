use bytes::{Buf, BufMut, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (64 KB). Rendezvous frames are tiny; anything larger
/// is a protocol violation.
const MAX_FRAME_SIZE: usize = 64 * 1024;

/// Errors that can occur during encoding/decoding
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Length-delimited JSON codec for data-plane rendezvous messages
///
/// Wire format:
/// ```text
/// +----------------+------------------+
/// | Length (4 bytes| JSON payload     |
/// | big-endian u32)| (variable)       |
/// +----------------+------------------+
/// ```
pub struct FrameCodec<T> {
    _phantom: std::marker::PhantomData<T>,
}

impl<T> FrameCodec<T> {
    pub fn new() -> Self {
        Self {
            _phantom: std::marker::PhantomData,
        }
    }
}

impl<T> Default for FrameCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for FrameCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 4 bytes for length prefix
        if src.len() < 4 {
            return Ok(None);
        }

        // Peek at the length without consuming
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(length));
        }

        // Check if we have the full frame
        let total_len = 4 + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(4);
        let payload = src.split_to(length);

        let message = serde_json::from_slice(&payload)?;
        Ok(Some(message))
    }
}

impl<T: Serialize> Encoder<T> for FrameCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;

        if json.len() > MAX_FRAME_SIZE {
            return Err(CodecError::FrameTooLarge(json.len()));
        }

        dst.reserve(4 + json.len());
        dst.put_u32(json.len() as u32);
        dst.put_slice(&json);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::DataPlaneMessage;

    #[test]
    fn roundtrip_attach() {
        let mut codec = FrameCodec::<DataPlaneMessage>::new();
        let msg = DataPlaneMessage::Attach {
            endpoint: "front:back-a1b2".to_string(),
        };

        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut codec = FrameCodec::<DataPlaneMessage>::new();
        let msg = DataPlaneMessage::Attached;

        let mut buf = BytesMut::new();
        codec.encode(msg, &mut buf).unwrap();

        let full_len = buf.len();
        let mut partial = buf.split_to(full_len / 2);

        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let decoded = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(decoded, DataPlaneMessage::Attached);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut codec = FrameCodec::<DataPlaneMessage>::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_slice(b"xxxx");

        assert!(matches!(
            codec.decode(&mut buf),
            Err(CodecError::FrameTooLarge(_))
        ));
    }
}
