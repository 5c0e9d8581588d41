use std::{
    cell::RefCell,
    collections::HashMap,
    rc::{Rc, Weak},
};

use futures::future::{join_all, FutureExt, Shared};
use futures_channel::oneshot as notify;
use local_sync::oneshot;
use monoio::task::JoinHandle;
use monogrpc_core::{
    codec::GrpcCodec,
    headers::Headers,
    transport::{StreamHandler, StreamId, TransportStream},
};
use tracing::{debug, warn};

use super::{dispatch::request_handler, method::Mapping};

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerError {
    #[error("stream {0} has no running rpc")]
    UnknownStream(StreamId),
}

/// Per-connection dispatcher: one concurrent task per inbound stream.
///
/// Running tasks are keyed by stream so a peer reset cancels exactly one RPC.
/// Cancelled tasks are kept until [`wait_closed`](StreamHandler::wait_closed)
/// has seen them finish.
#[derive(Clone)]
pub struct Handler {
    inner: Rc<HandlerInner>,
}

struct HandlerInner {
    mapping: Rc<Mapping>,
    codec: GrpcCodec,
    state: RefCell<HandlerState>,
}

#[derive(Default)]
struct HandlerState {
    tasks: HashMap<StreamId, RpcTask>,
    next_seq: u64,
    cancelled: Vec<Shared<JoinHandle<()>>>,
    closed: bool,
    // dropped on close to wake every `closing` receiver
    close_notifiers: Vec<notify::Sender<()>>,
}

struct RpcTask {
    // tells a task apart from a later one on the same stream id
    seq: u64,
    cancel: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl RpcTask {
    fn cancel(self) -> Shared<JoinHandle<()>> {
        let _ = self.cancel.send(());
        self.handle.shared()
    }
}

impl Handler {
    pub fn new(mapping: Rc<Mapping>, codec: GrpcCodec) -> Self {
        Self {
            inner: Rc::new(HandlerInner {
                mapping,
                codec,
                state: Default::default(),
            }),
        }
    }

    /// Resolves once the handler is closed.
    pub fn closing(&self) -> notify::Receiver<()> {
        let (tx, rx) = notify::channel();
        let mut state = self.inner.state.borrow_mut();
        if !state.closed {
            state.close_notifiers.push(tx);
        }
        rx
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.borrow().closed
    }

    /// RPCs still running and not asked to stop.
    pub fn live_tasks(&self) -> usize {
        self.inner.state.borrow().tasks.len()
    }

    /// Cancelled RPCs not yet joined by `wait_closed`.
    pub fn cancelled_tasks(&self) -> usize {
        self.inner.state.borrow().cancelled.len()
    }
}

impl StreamHandler for Handler {
    type Stream = Box<dyn TransportStream>;
    type Error = HandlerError;

    fn accept(&self, stream: Self::Stream, headers: Headers) {
        let id = stream.id();
        if self.is_closed() {
            warn!(stream = %id, "handler closed, dropping new stream");
            return;
        }

        let (cancel, cancelled) = oneshot::channel::<()>();
        let seq = {
            let mut state = self.inner.state.borrow_mut();
            state.next_seq += 1;
            state.next_seq
        };
        let inner = Rc::downgrade(&self.inner);
        let mapping = self.inner.mapping.clone();
        let codec = self.inner.codec;
        let handle = monoio::spawn(async move {
            monoio::select! {
                _ = cancelled => debug!(stream = %id, "rpc cancelled"),
                _ = request_handler(&mapping, codec, stream, headers) => {},
            }
            forget_task(&inner, id, seq);
        });

        let replaced = self
            .inner
            .state
            .borrow_mut()
            .tasks
            .insert(id, RpcTask { seq, cancel, handle });
        if let Some(replaced) = replaced {
            warn!(stream = %id, "stream id reused while its rpc is running, cancelling the old one");
            let handle = replaced.cancel();
            self.inner.state.borrow_mut().cancelled.push(handle);
        }
    }

    fn cancel(&self, id: StreamId) -> Result<(), HandlerError> {
        let mut state = self.inner.state.borrow_mut();
        let task = state
            .tasks
            .remove(&id)
            .ok_or(HandlerError::UnknownStream(id))?;
        state.cancelled.push(task.cancel());
        debug!(stream = %id, "rpc cancellation requested");
        Ok(())
    }

    fn close(&self) {
        let mut state = self.inner.state.borrow_mut();
        let tasks: Vec<_> = state.tasks.drain().map(|(_, task)| task.cancel()).collect();
        if !tasks.is_empty() {
            debug!(count = tasks.len(), "cancelling rpcs of closed handler");
        }
        state.cancelled.extend(tasks);
        state.closed = true;
        state.close_notifiers.clear();
    }

    async fn wait_closed(&self) {
        let cancelled = self.inner.state.borrow().cancelled.clone();
        if cancelled.is_empty() {
            return;
        }
        join_all(cancelled).await;
        self.inner
            .state
            .borrow_mut()
            .cancelled
            .retain(|task| task.peek().is_none());
    }
}

// A finished rpc leaves the table on its own; cancelled ones already left it.
fn forget_task(inner: &Weak<HandlerInner>, id: StreamId, seq: u64) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    let mut state = inner.state.borrow_mut();
    if state.tasks.get(&id).is_some_and(|task| task.seq == seq) {
        state.tasks.remove(&id);
    }
}
