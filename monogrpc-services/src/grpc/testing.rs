//! In-memory transport recording every outbound frame.

use std::{
    cell::{Cell, RefCell},
    collections::VecDeque,
    rc::Rc,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use bytes::{Bytes, BytesMut};
use futures::future::{self, LocalBoxFuture};
use monoio_codec::Encoder;
use monogrpc_core::{
    codec::GrpcCodec,
    headers::{Headers, CONTENT_TYPE, METHOD, PATH},
    status::{self, RPC_METHOD},
    transport::{StreamId, TransportStream},
    TransportError,
};
use tracing::{subscriber::DefaultGuard, Event, Level, Subscriber};
use tracing_subscriber::{
    layer::{Context, SubscriberExt},
    Layer,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Frame {
    Headers(Headers, bool),
    Data(Bytes),
    Reset,
}

/// Shared record of the frames written by every stream made from it.
#[derive(Clone, Default)]
pub(crate) struct Wire {
    frames: Rc<RefCell<Vec<Frame>>>,
    dropped: Rc<Cell<usize>>,
}

impl Wire {
    /// A stream whose peer sends `inbound` and then ends its side.
    pub(crate) fn stream(&self, id: u32, inbound: Vec<Bytes>) -> MockStream {
        MockStream {
            id: StreamId(id),
            inbound: inbound.into(),
            hold_open: false,
            wire: self.clone(),
        }
    }

    /// A stream whose peer never sends anything nor ends its side.
    pub(crate) fn idle_stream(&self, id: u32) -> MockStream {
        MockStream {
            id: StreamId(id),
            inbound: VecDeque::new(),
            hold_open: true,
            wire: self.clone(),
        }
    }

    pub(crate) fn frames(&self) -> Vec<Frame> {
        self.frames.borrow().clone()
    }

    pub(crate) fn trailers(&self) -> Vec<Headers> {
        self.frames
            .borrow()
            .iter()
            .filter_map(|frame| match frame {
                Frame::Headers(headers, true) => Some(headers.clone()),
                _ => None,
            })
            .collect()
    }

    /// Streams made from this wire that have been dropped.
    pub(crate) fn dropped(&self) -> usize {
        self.dropped.get()
    }
}

pub(crate) struct MockStream {
    id: StreamId,
    inbound: VecDeque<Bytes>,
    hold_open: bool,
    wire: Wire,
}

impl MockStream {
    fn record(&self, frame: Frame) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        self.wire.frames.borrow_mut().push(frame);
        Box::pin(future::ready(Ok(())))
    }
}

impl TransportStream for MockStream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn send_headers(
        &mut self,
        headers: Headers,
        end_stream: bool,
    ) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        self.record(Frame::Headers(headers, end_stream))
    }

    fn send_data(&mut self, data: Bytes) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        self.record(Frame::Data(data))
    }

    fn recv_data(&mut self) -> LocalBoxFuture<'_, Option<Result<Bytes, TransportError>>> {
        match self.inbound.pop_front() {
            Some(chunk) => Box::pin(future::ready(Some(Ok(chunk)))),
            None if self.hold_open => Box::pin(future::pending()),
            None => Box::pin(future::ready(None)),
        }
    }

    fn reset(&mut self) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        self.record(Frame::Reset)
    }
}

impl Drop for MockStream {
    fn drop(&mut self) {
        self.wire.dropped.set(self.wire.dropped.get() + 1);
    }
}

/// Length-prefixed frame carrying `payload`.
pub(crate) fn data_frame(payload: &[u8]) -> Bytes {
    let mut frame = BytesMut::new();
    GrpcCodec::default()
        .encode(Bytes::copy_from_slice(payload), &mut frame)
        .expect("payload fits the default limit");
    frame.freeze()
}

/// Headers of a well formed request for `path`.
pub(crate) fn request_headers(path: &str) -> Headers {
    Headers::new()
        .with(METHOD, RPC_METHOD)
        .with(PATH, path)
        .with(CONTENT_TYPE, status::CONTENT_TYPES[0])
}

/// Counts `ERROR` events logged on the current thread while installed.
#[derive(Clone, Default)]
pub(crate) struct ErrorCounter(Arc<AtomicUsize>);

impl ErrorCounter {
    pub(crate) fn install(&self) -> DefaultGuard {
        tracing::subscriber::set_default(tracing_subscriber::registry().with(self.clone()))
    }

    pub(crate) fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl<S: Subscriber> Layer<S> for ErrorCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::ERROR {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}
