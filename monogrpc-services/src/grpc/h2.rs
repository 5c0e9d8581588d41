//! HTTP/2 connection adapter.
//!
//! Drives one `monoio_http::h2` server connection and feeds its streams to a
//! [`Handler`]: new requests become `accept` calls, peer resets become
//! `cancel` calls, and the end of the connection closes and joins the handler.

use std::{
    cell::RefCell,
    convert::Infallible,
    future::poll_fn,
    rc::Rc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::future::{self, LocalBoxFuture};
use http::{header::HeaderName, HeaderMap, HeaderValue, Response, StatusCode};
use local_sync::oneshot;
use monoio::io::{AsyncReadRent, AsyncWriteRent, Split};
use monoio_http::h2::{
    self,
    server::{Builder, SendResponse},
    Reason, RecvStream, SendStream,
};
use monogrpc_core::{
    config::H2Config,
    headers::{Headers, AUTHORITY, METHOD, PATH, SCHEME, STATUS},
    listener::AcceptedAddr,
    transport::{StreamHandler, StreamId, TransportStream},
    TransportError,
};
use service_async::Service;
use tracing::{debug, error, info, warn};

use super::handler::Handler;
use crate::server::HandlerRegistration;

// RFC 9113 bounds on SETTINGS_MAX_FRAME_SIZE
const MIN_FRAME_SIZE: u32 = 16_384;
const MAX_FRAME_SIZE: u32 = 16_777_215;

/// Serves one accepted connection.
pub struct H2Connection {
    handler: Handler,
    config: H2Config,
    // keeps the handler visible to the server until the connection is done
    _registration: Option<HandlerRegistration>,
}

impl H2Connection {
    pub fn new(handler: Handler, config: H2Config) -> Self {
        Self {
            handler,
            config,
            _registration: None,
        }
    }

    pub(crate) fn registered(mut self, registration: HandlerRegistration) -> Self {
        self._registration = Some(registration);
        self
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    async fn serve<S>(&self, io: S, peer: &AcceptedAddr)
    where
        S: Split + AsyncReadRent + AsyncWriteRent + Unpin + 'static,
    {
        let mut builder = Builder::new();
        builder
            .initial_window_size(self.config.initial_window_size)
            .max_concurrent_streams(self.config.max_concurrent_streams)
            .max_frame_size(
                self.config
                    .max_frame_size
                    .clamp(MIN_FRAME_SIZE, MAX_FRAME_SIZE),
            )
            .max_header_list_size(self.config.max_header_list_size);
        let handshake = builder.handshake::<S, Bytes>(io);
        let handshake = match self.config.handshake_timeout() {
            Some(timeout) => match monoio::time::timeout(timeout, handshake).await {
                Ok(handshake) => handshake,
                Err(_) => {
                    warn!(?peer, "h2 handshake timed out");
                    return;
                }
            },
            None => handshake.await,
        };
        let mut connection = match handshake {
            Ok(connection) => {
                debug!(?peer, "h2 handshake complete");
                connection
            }
            Err(e) => {
                error!(?peer, "h2 handshake failed: {e:?}");
                return;
            }
        };

        let mut closing = self.handler.closing();
        let mut shutting_down = false;
        loop {
            let accepted = if shutting_down {
                connection.accept().await
            } else {
                monoio::select! {
                    _ = &mut closing => {
                        info!(?peer, "handler closed, shutting down connection");
                        connection.graceful_shutdown();
                        shutting_down = true;
                        continue;
                    }
                    accepted = connection.accept() => accepted,
                }
            };
            match accepted {
                Some(Ok((request, respond))) => self.open_stream(request, respond),
                Some(Err(e)) => {
                    warn!(?peer, "h2 connection error: {e:?}");
                    break;
                }
                None => break,
            }
        }
    }

    fn open_stream(&self, request: http::Request<RecvStream>, respond: SendResponse<Bytes>) {
        let id = StreamId(respond.stream_id().as_u32());
        let (parts, body) = request.into_parts();
        let headers = request_headers(&parts);

        let responder = Rc::new(RefCell::new(Responder {
            respond,
            send: None,
            closed: false,
        }));
        let (release, released) = oneshot::channel::<()>();
        monoio::spawn(watch_reset(
            id,
            responder.clone(),
            released,
            self.handler.clone(),
        ));

        let stream = H2Stream {
            id,
            body,
            responder,
            _release: release,
        };
        self.handler.accept(Box::new(stream), headers);
    }
}

impl<S> Service<(S, AcceptedAddr)> for H2Connection
where
    S: Split + AsyncReadRent + AsyncWriteRent + Unpin + 'static,
{
    type Response = ();
    type Error = Infallible;

    async fn call(&self, (io, peer): (S, AcceptedAddr)) -> Result<Self::Response, Self::Error> {
        self.serve(io, &peer).await;
        self.handler.close();
        self.handler.wait_closed().await;
        debug!(?peer, "h2 connection finished");
        Ok(())
    }
}

// Cancels the rpc when the peer resets its stream, until the stream is released.
async fn watch_reset(
    id: StreamId,
    responder: Rc<RefCell<Responder>>,
    released: oneshot::Receiver<()>,
    handler: Handler,
) {
    let reset = poll_fn(|cx| responder.borrow_mut().poll_reset(cx));
    monoio::select! {
        _ = released => {}
        reason = reset => {
            match reason {
                Ok(Reason::NO_ERROR) => return,
                Ok(reason) => debug!(stream = %id, ?reason, "stream reset by peer"),
                Err(e) if e.is_io() || e.is_go_away() || e.is_reset() => {
                    debug!(stream = %id, "stream failed: {e:?}")
                }
                Err(e) => {
                    debug!(stream = %id, "stopped watching for reset: {e:?}");
                    return;
                }
            }
            if let Err(e) = handler.cancel(id) {
                debug!(stream = %id, "reset after rpc finished: {e}");
            }
        }
    }
}

struct Responder {
    respond: SendResponse<Bytes>,
    send: Option<SendStream<Bytes>>,
    closed: bool,
}

impl Responder {
    fn send_headers(&mut self, headers: Headers, end_stream: bool) -> Result<(), TransportError> {
        if self.closed {
            return Err(TransportError::Closed);
        }
        match self.send.as_mut() {
            None => {
                let send = self
                    .respond
                    .send_response(build_response(&headers)?, end_stream)
                    .map_err(transport_error)?;
                if end_stream {
                    self.closed = true;
                } else {
                    self.send = Some(send);
                }
            }
            Some(_) if !end_stream => return Err(TransportError::HeadersSent),
            Some(send) => {
                send.send_trailers(header_map(&headers)?)
                    .map_err(transport_error)?;
                self.closed = true;
            }
        }
        Ok(())
    }

    // Before the response headers the reset is awaited on the responder,
    // afterwards on the send stream.
    fn poll_reset(&mut self, cx: &mut Context<'_>) -> Poll<Result<Reason, h2::Error>> {
        if self.closed {
            // ended locally, nothing left to cancel
            return Poll::Pending;
        }
        match self.send.as_mut() {
            Some(send) => send.poll_reset(cx),
            None => self.respond.poll_reset(cx),
        }
    }

    fn send_data(&mut self, data: Bytes) -> Result<(), TransportError> {
        match self.send.as_mut() {
            Some(send) if !self.closed => send.send_data(data, false).map_err(transport_error),
            _ => Err(TransportError::Closed),
        }
    }

    fn reset(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match self.send.as_mut() {
            Some(send) => send.send_reset(Reason::CANCEL),
            None => self.respond.send_reset(Reason::CANCEL),
        }
    }
}

struct H2Stream {
    id: StreamId,
    body: RecvStream,
    responder: Rc<RefCell<Responder>>,
    // dropping it stops the reset watcher
    _release: oneshot::Sender<()>,
}

impl TransportStream for H2Stream {
    fn id(&self) -> StreamId {
        self.id
    }

    fn send_headers(
        &mut self,
        headers: Headers,
        end_stream: bool,
    ) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        let sent = self.responder.borrow_mut().send_headers(headers, end_stream);
        Box::pin(future::ready(sent))
    }

    fn send_data(&mut self, data: Bytes) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        let sent = self.responder.borrow_mut().send_data(data);
        Box::pin(future::ready(sent))
    }

    fn recv_data(&mut self) -> LocalBoxFuture<'_, Option<Result<Bytes, TransportError>>> {
        Box::pin(async move {
            let data = match self.body.data().await? {
                Ok(data) => data,
                Err(e) => return Some(Err(transport_error(e))),
            };
            if let Err(e) = self.body.flow_control().release_capacity(data.len()) {
                return Some(Err(transport_error(e)));
            }
            Some(Ok(data))
        })
    }

    fn reset(&mut self) -> LocalBoxFuture<'_, Result<(), TransportError>> {
        // TODO: take the reason from the caller once streams expose error codes.
        self.responder.borrow_mut().reset();
        Box::pin(future::ready(Ok(())))
    }
}

fn transport_error(e: h2::Error) -> TransportError {
    match e.reason() {
        Some(reason) => TransportError::Reset(reason.into()),
        None => TransportError::Protocol(e.to_string()),
    }
}

/// Header list of an inbound request, pseudo-headers first.
fn request_headers(parts: &http::request::Parts) -> Headers {
    let mut headers = Headers::new().with(METHOD, parts.method.as_str());
    if let Some(scheme) = parts.uri.scheme_str() {
        headers.push(SCHEME, scheme);
    }
    if let Some(authority) = parts.uri.authority() {
        headers.push(AUTHORITY, authority.as_str());
    }
    headers.push(PATH, parts.uri.path());
    for (name, value) in parts.headers.iter() {
        match value.to_str() {
            Ok(value) => headers.push(name.as_str(), value),
            Err(_) => debug!(header = %name, "skipping non-ascii header value"),
        }
    }
    headers
}

fn build_response(headers: &Headers) -> Result<Response<()>, TransportError> {
    let status = headers.get(STATUS).unwrap_or("200");
    let status = StatusCode::from_bytes(status.as_bytes()).map_err(|e| {
        TransportError::InvalidHeader {
            name: STATUS.to_string(),
            reason: e.to_string(),
        }
    })?;
    let mut response = Response::new(());
    *response.status_mut() = status;
    *response.headers_mut() = header_map(headers)?;
    Ok(response)
}

fn header_map(headers: &Headers) -> Result<HeaderMap, TransportError> {
    let invalid = |name: &str, reason: String| TransportError::InvalidHeader {
        name: name.to_string(),
        reason,
    };
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers.regular() {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(name, e.to_string()))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|e| invalid(name, e.to_string()))?;
        map.append(header_name, header_value);
    }
    Ok(map)
}
