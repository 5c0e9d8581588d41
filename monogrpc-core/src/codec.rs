//! gRPC length-prefixed message framing.
//!
//! Every message on an RPC stream is prefixed by a 5 byte header: one byte
//! compressed flag followed by the payload length as a big-endian `u32`.
//! DATA frames of the transport do not align with message boundaries, so the
//! decoder works on an accumulating buffer and yields a message only once its
//! payload is complete.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use monoio_codec::{Decoded, Decoder, Encoder};
use thiserror::Error;

pub const HEADER_LEN: usize = 5;
// gRPC default limit: 4 MiB
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;
// the length prefix is a u32
const MAX_LENGTH_PREFIX: usize = u32::MAX as usize;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("message of {len} bytes exceeds limit of {max} bytes")]
    MessageTooLarge { len: usize, max: usize },
    #[error("compressed messages are not supported")]
    CompressionUnsupported,
    #[error("invalid compressed flag {0}")]
    InvalidFlag(u8),
    #[error("stream ended inside a message ({0} bytes pending)")]
    Truncated(usize),
    #[error("invalid utf-8 payload: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("json payload: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GrpcCodec {
    max_message_size: usize,
}

impl Default for GrpcCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl GrpcCodec {
    /// Limits above what the length prefix can carry are lowered to `u32::MAX`.
    pub const fn new(max_message_size: usize) -> Self {
        let max_message_size = if max_message_size > MAX_LENGTH_PREFIX {
            MAX_LENGTH_PREFIX
        } else {
            max_message_size
        };
        Self { max_message_size }
    }

    pub const fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    fn check_len(&self, len: usize) -> Result<(), CodecError> {
        if len > self.max_message_size {
            return Err(CodecError::MessageTooLarge {
                len,
                max: self.max_message_size,
            });
        }
        Ok(())
    }
}

impl Decoder for GrpcCodec {
    type Item = Bytes;
    type Error = CodecError;

    /// Splits one complete message payload off the front of `src`.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Decoded<Bytes>, CodecError> {
        if src.len() < HEADER_LEN {
            return Ok(Decoded::Insufficient);
        }
        match src[0] {
            0 => {}
            1 => return Err(CodecError::CompressionUnsupported),
            flag => return Err(CodecError::InvalidFlag(flag)),
        }
        let len = (&src[1..HEADER_LEN]).get_u32() as usize;
        self.check_len(len)?;
        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(Decoded::InsufficientAtLeast(HEADER_LEN + len));
        }
        src.advance(HEADER_LEN);
        Ok(Decoded::Some(src.split_to(len).freeze()))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Decoded<Bytes>, CodecError> {
        match self.decode(src)? {
            Decoded::Some(message) => Ok(Decoded::Some(message)),
            insufficient if src.is_empty() => Ok(insufficient),
            _ => Err(CodecError::Truncated(src.len())),
        }
    }
}

impl Encoder<Bytes> for GrpcCodec {
    type Error = CodecError;

    fn encode(&mut self, payload: Bytes, dst: &mut BytesMut) -> Result<(), CodecError> {
        self.check_len(payload.len())?;
        dst.reserve(HEADER_LEN + payload.len());
        dst.put_u8(0);
        // check_len bounds the length by u32::MAX
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_waits_for_whole_message() {
        let mut codec = GrpcCodec::default();
        let mut wire = BytesMut::new();
        codec.encode(Bytes::from_static(b"hello"), &mut wire).unwrap();
        codec.encode(Bytes::new(), &mut wire).unwrap();
        assert_eq!(&wire[..HEADER_LEN], &[0, 0, 0, 0, 5]);

        // feed the first frame byte by byte
        let mut buf = BytesMut::new();
        for byte in &wire[..HEADER_LEN - 1] {
            buf.put_u8(*byte);
            assert_eq!(codec.decode(&mut buf).unwrap(), Decoded::Insufficient);
        }
        for byte in &wire[HEADER_LEN - 1..HEADER_LEN + 4] {
            buf.put_u8(*byte);
            assert_eq!(
                codec.decode(&mut buf).unwrap(),
                Decoded::InsufficientAtLeast(HEADER_LEN + 5)
            );
        }
        buf.put_slice(&wire[HEADER_LEN + 4..]);
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "hello");
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap(), "");
        assert!(buf.is_empty());
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), Decoded::Insufficient);
    }

    #[test]
    fn test_decode_rejects_bad_frames() {
        let mut codec = GrpcCodec::new(8);

        let mut compressed = BytesMut::from(&[1u8, 0, 0, 0, 1, 42][..]);
        assert!(matches!(
            codec.decode(&mut compressed),
            Err(CodecError::CompressionUnsupported)
        ));

        let mut too_large = BytesMut::from(&[0u8, 0, 0, 0, 9][..]);
        assert!(matches!(
            codec.decode(&mut too_large),
            Err(CodecError::MessageTooLarge { len: 9, max: 8 })
        ));

        let mut truncated = BytesMut::from(&[0u8, 0, 0, 0, 3, 1][..]);
        assert!(matches!(
            codec.decode_eof(&mut truncated),
            Err(CodecError::Truncated(6))
        ));

        assert!(codec
            .encode(Bytes::from_static(&[0u8; 9]), &mut BytesMut::new())
            .is_err());
    }

    #[test]
    fn test_limit_never_exceeds_length_prefix() {
        assert_eq!(GrpcCodec::new(usize::MAX).max_message_size(), u32::MAX as usize);
        assert_eq!(GrpcCodec::new(1024).max_message_size(), 1024);
    }
}
