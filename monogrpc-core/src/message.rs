//! Typed RPC payloads.
//!
//! A [`Message`] knows how to turn itself into the payload of one length-prefixed
//! frame and back. Request and reply types are fixed per method at compile time,
//! so a stream can only ever carry the types its method declared.

use bytes::{BufMut, Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};

use crate::codec::CodecError;

pub trait Message: Sized {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError>;

    fn decode(src: Bytes) -> Result<Self, CodecError>;
}

impl Message for Bytes {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.put_slice(self);
        Ok(())
    }

    fn decode(src: Bytes) -> Result<Self, CodecError> {
        Ok(src)
    }
}

impl Message for Vec<u8> {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.put_slice(self);
        Ok(())
    }

    fn decode(src: Bytes) -> Result<Self, CodecError> {
        Ok(src.to_vec())
    }
}

impl Message for String {
    fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.put_slice(self.as_bytes());
        Ok(())
    }

    fn decode(src: Bytes) -> Result<Self, CodecError> {
        String::from_utf8(src.to_vec()).map_err(Into::into)
    }
}

/// Carries any serde type as a JSON payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T> Json<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

impl<T> Message for Json<T>
where
    T: Serialize + DeserializeOwned,
{
    fn encode(&self, dst: &mut BytesMut) -> Result<(), CodecError> {
        serde_json::to_writer(dst.writer(), &self.0).map_err(Into::into)
    }

    fn decode(src: Bytes) -> Result<Self, CodecError> {
        serde_json::from_slice(&src).map(Json).map_err(Into::into)
    }
}
