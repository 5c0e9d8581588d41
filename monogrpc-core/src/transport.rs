//! Contracts between the RPC core and the multiplexed transport.
//!
//! The transport demultiplexes one connection into streams and reports stream
//! events to a [`StreamHandler`]. Each accepted stream is handed over as a
//! [`TransportStream`], which the RPC running on it owns exclusively until the
//! RPC finishes or is cancelled.

use std::{fmt, future::Future};

use bytes::Bytes;
use futures_util::future::LocalBoxFuture;

use crate::{headers::Headers, TransportError};

/// Identity of a stream within its connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StreamId(pub u32);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<u32> for StreamId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// Outbound and inbound primitives of one transport stream.
///
/// Futures are boxed so the trait stays object safe: an RPC stream holds a
/// `Box<dyn TransportStream>` and does not care which transport produced it.
pub trait TransportStream {
    fn id(&self) -> StreamId;

    /// Sends a header block. The first block carries the response headers,
    /// a later one with `end_stream` set carries the trailers.
    fn send_headers(
        &mut self,
        headers: Headers,
        end_stream: bool,
    ) -> LocalBoxFuture<'_, Result<(), TransportError>>;

    fn send_data(&mut self, data: Bytes) -> LocalBoxFuture<'_, Result<(), TransportError>>;

    /// Next chunk of request body, `None` once the peer ended its side.
    fn recv_data(&mut self) -> LocalBoxFuture<'_, Option<Result<Bytes, TransportError>>>;

    /// Aborts the stream.
    fn reset(&mut self) -> LocalBoxFuture<'_, Result<(), TransportError>>;
}

/// Stream events a transport delivers for one connection.
pub trait StreamHandler {
    type Stream;
    type Error;

    /// A peer opened a stream. Must not block.
    fn accept(&self, stream: Self::Stream, headers: Headers);

    /// The peer reset the stream.
    fn cancel(&self, stream: StreamId) -> Result<(), Self::Error>;

    /// The connection is going away; abandon every stream.
    fn close(&self);

    /// Resolves once all abandoned work has stopped.
    fn wait_closed(&self) -> impl Future<Output = ()>;
}
