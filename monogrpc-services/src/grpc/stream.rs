use std::marker::PhantomData;

use bytes::BytesMut;
use monoio::io::stream::Stream;
use monoio_codec::{Decoded, Decoder, Encoder};
use monogrpc_core::{
    codec::{CodecError, GrpcCodec},
    headers::Headers,
    message::Message,
    transport::{StreamId, TransportStream},
    TransportError,
};

#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("stream already ended")]
    AlreadyEnded,
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
}

/// One RPC exchange on top of one transport stream.
///
/// `Req` is what the peer sends, `Resp` is what the method replies with. The
/// stream owns its transport stream until the RPC finishes or is cancelled.
pub struct RpcStream<Req, Resp> {
    transport: Box<dyn TransportStream>,
    codec: GrpcCodec,
    recv_buf: BytesMut,
    recv_eof: bool,
    iter_done: bool,

    headers: Headers,
    trailers: Headers,
    headers_sent: bool,
    ended: bool,

    _types: PhantomData<fn(Req) -> Resp>,
}

impl<Req, Resp> RpcStream<Req, Resp> {
    pub fn new(
        transport: Box<dyn TransportStream>,
        codec: GrpcCodec,
        headers: Headers,
        trailers: Headers,
    ) -> Self {
        Self {
            transport,
            codec,
            recv_buf: BytesMut::new(),
            recv_eof: false,
            iter_done: false,
            headers,
            trailers,
            headers_sent: false,
            ended: false,
            _types: PhantomData,
        }
    }

    pub fn id(&self) -> StreamId {
        self.transport.id()
    }

    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    async fn send_headers_once(&mut self) -> Result<(), StreamError> {
        if !self.headers_sent {
            self.headers_sent = true;
            self.transport
                .send_headers(self.headers.clone(), false)
                .await?;
        }
        Ok(())
    }

    /// Terminates the stream with `trailers`, or with the success trailers
    /// when `None`. Ending twice is an error.
    pub async fn end(&mut self, trailers: Option<Headers>) -> Result<(), StreamError> {
        if self.ended {
            return Err(StreamError::AlreadyEnded);
        }
        self.send_headers_once().await?;
        let trailers = trailers.unwrap_or_else(|| self.trailers.clone());
        // A failed trailer write leaves the stream unusable, never retry it.
        self.ended = true;
        self.transport.send_headers(trailers, true).await?;
        Ok(())
    }

    /// Like [`end`](Self::end) but does nothing on an already ended stream.
    pub async fn maybe_end(&mut self, trailers: Option<Headers>) -> Result<(), StreamError> {
        if self.ended {
            return Ok(());
        }
        self.end(trailers).await
    }

    /// Aborts the stream. No trailers follow a reset.
    pub async fn reset(&mut self) -> Result<(), StreamError> {
        self.ended = true;
        // TODO: let callers pick the reset error code, the transport always uses CANCEL.
        self.transport.reset().await?;
        Ok(())
    }
}

impl<Req, Resp: Message> RpcStream<Req, Resp> {
    /// Sends one reply message, emitting the response headers first if they
    /// have not gone out yet. With `end` set the stream is ended right after.
    pub async fn send(&mut self, message: &Resp, end: bool) -> Result<(), StreamError> {
        if self.ended {
            return Err(StreamError::AlreadyEnded);
        }
        self.send_headers_once().await?;

        let mut payload = BytesMut::new();
        message.encode(&mut payload)?;
        let mut frame = BytesMut::new();
        self.codec.encode(payload.freeze(), &mut frame)?;
        self.transport.send_data(frame.freeze()).await?;

        if end {
            self.end(None).await?;
        }
        Ok(())
    }
}

impl<Req: Message, Resp> RpcStream<Req, Resp> {
    /// Next request message, `None` once the peer finished sending.
    pub async fn recv(&mut self) -> Result<Option<Req>, StreamError> {
        loop {
            if let Decoded::Some(payload) = self.codec.decode(&mut self.recv_buf)? {
                return Ok(Some(Req::decode(payload)?));
            }
            if self.recv_eof {
                return match self.codec.decode_eof(&mut self.recv_buf)? {
                    Decoded::Some(payload) => Ok(Some(Req::decode(payload)?)),
                    _ => Ok(None),
                };
            }
            match self.transport.recv_data().await {
                Some(chunk) => self.recv_buf.extend_from_slice(&chunk?),
                None => self.recv_eof = true,
            }
        }
    }
}

impl<Req: Message, Resp> Stream for RpcStream<Req, Resp> {
    type Item = Result<Req, StreamError>;

    async fn next(&mut self) -> Option<Self::Item> {
        if self.iter_done {
            return None;
        }
        let item = self.recv().await.transpose();
        if !matches!(item, Some(Ok(_))) {
            self.iter_done = true;
        }
        item
    }
}
