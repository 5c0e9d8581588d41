use std::{any::Any, panic::AssertUnwindSafe};

use futures::FutureExt;
use monogrpc_core::{
    codec::GrpcCodec,
    headers::{Headers, CONTENT_TYPE, METHOD, PATH, STATUS},
    message::Message,
    status::{self, response_headers, Code, GRPC_MESSAGE, GRPC_STATUS, RPC_METHOD},
    transport::TransportStream,
};
use tracing::{error, warn};

use super::{
    method::{Mapping, MethodDescriptor, RpcFuture},
    stream::RpcStream,
};

/// Why a request was turned away before reaching any method.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    #[error("http method {0:?} is not allowed")]
    MethodNotAllowed(Option<String>),
    #[error("method {0:?} is not implemented")]
    Unimplemented(Option<String>),
    #[error("content type {0:?} is not supported")]
    UnsupportedContentType(Option<String>),
}

impl DispatchError {
    /// The trailers-only response that rejects the request.
    pub fn rejection(&self) -> Headers {
        match self {
            DispatchError::MethodNotAllowed(_) => Headers::new().with(STATUS, "405"),
            DispatchError::Unimplemented(path) => response_headers()
                .with(GRPC_STATUS, Code::Unimplemented.as_u8().to_string())
                .with(
                    GRPC_MESSAGE,
                    format!("Method not found: {}", path.as_deref().unwrap_or_default()),
                ),
            DispatchError::UnsupportedContentType(_) => Headers::new().with(STATUS, "415"),
        }
    }
}

/// Checks the request pseudo-headers and resolves its method.
pub fn resolve<'m>(
    mapping: &'m Mapping,
    headers: &Headers,
) -> Result<&'m MethodDescriptor, DispatchError> {
    let owned = |v: Option<&str>| v.map(str::to_owned);

    let method = headers.get(METHOD);
    if method != Some(RPC_METHOD) {
        return Err(DispatchError::MethodNotAllowed(owned(method)));
    }
    let path = headers.get(PATH);
    let descriptor = path
        .and_then(|path| mapping.get(path))
        .ok_or_else(|| DispatchError::Unimplemented(owned(path)))?;
    let content_type = headers.get(CONTENT_TYPE);
    if !content_type.is_some_and(status::is_accepted_content_type) {
        return Err(DispatchError::UnsupportedContentType(owned(content_type)));
    }
    Ok(descriptor)
}

/// Runs one inbound request to completion.
///
/// Malformed requests get a trailers-only rejection. Accepted ones run their
/// method, and whatever way the method exits the peer sees exactly one
/// trailer block, unless the task is cancelled first.
pub async fn request_handler(
    mapping: &Mapping,
    codec: GrpcCodec,
    mut transport: Box<dyn TransportStream>,
    headers: Headers,
) {
    let method = match resolve(mapping, &headers) {
        Ok(method) => method,
        Err(e) => {
            warn!(stream = %transport.id(), "rejecting rpc: {e}");
            if let Err(e) = transport.send_headers(e.rejection(), true).await {
                warn!(stream = %transport.id(), "failed to send rejection: {e}");
            }
            return;
        }
    };
    method.serve(codec, transport).await
}

pub(crate) async fn serve_rpc<Req, Resp, F>(
    func: &F,
    path: &str,
    codec: GrpcCodec,
    transport: Box<dyn TransportStream>,
) where
    F: for<'a> Fn(&'a mut RpcStream<Req, Resp>) -> RpcFuture<'a>,
    Req: Message,
    Resp: Message,
{
    let id = transport.id();
    let mut stream = RpcStream::new(transport, codec, response_headers(), Code::Ok.trailers());

    // The stream is only ended below, so a panic cannot leave it half updated.
    // Calling `func` inside the guarded future also covers panics raised
    // before the method returns its future.
    let guarded = AssertUnwindSafe(async { func(&mut stream).await });
    let trailers = match guarded.catch_unwind().await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => {
            error!(stream = %id, path, "rpc failed: {e:?}");
            Some(Code::Unknown.trailers())
        }
        Err(panic) => {
            error!(stream = %id, path, "rpc panicked: {}", panic_message(&*panic));
            Some(Code::Unknown.trailers())
        }
    };
    if let Err(e) = stream.maybe_end(trailers).await {
        warn!(stream = %id, path, "failed to end rpc stream: {e}");
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic payload"
    }
}

#[cfg(test)]
mod tests {
    use anyhow::anyhow;
    use bytes::Bytes;

    use super::*;
    use crate::grpc::testing::{data_frame, request_headers, ErrorCounter, Frame, Wire};

    fn echo_once<'a>(stream: &'a mut RpcStream<Bytes, Bytes>) -> RpcFuture<'a> {
        Box::pin(async move {
            if let Some(message) = stream.recv().await? {
                stream.send(&message, false).await?;
            }
            Ok(())
        })
    }

    fn fail<'a>(_: &'a mut RpcStream<Bytes, Bytes>) -> RpcFuture<'a> {
        Box::pin(async move { Err(anyhow!("boom")) })
    }

    fn panics<'a>(_: &'a mut RpcStream<Bytes, Bytes>) -> RpcFuture<'a> {
        Box::pin(async move {
            if true {
                panic!("handler bug");
            }
            Ok(())
        })
    }

    fn panics_before_future<'a>(_: &'a mut RpcStream<Bytes, Bytes>) -> RpcFuture<'a> {
        let limit: Option<usize> = None;
        let limit = limit.expect("limit configured");
        Box::pin(async move {
            tracing::debug!(limit, "unreachable");
            Ok(())
        })
    }

    fn ends_itself<'a>(stream: &'a mut RpcStream<Bytes, Bytes>) -> RpcFuture<'a> {
        Box::pin(async move {
            stream
                .send(&Bytes::from_static(b"done"), true)
                .await?;
            Ok(())
        })
    }

    fn mapping() -> Mapping {
        Mapping::new()
            .with(MethodDescriptor::new("/pkg.Service/Method", echo_once))
            .with(MethodDescriptor::new("/pkg.Service/Fail", fail))
            .with(MethodDescriptor::new("/pkg.Service/Panic", panics))
            .with(MethodDescriptor::new(
                "/pkg.Service/PanicEarly",
                panics_before_future,
            ))
            .with(MethodDescriptor::new("/pkg.Service/EndsItself", ends_itself))
    }

    async fn run(headers: Headers, inbound: Vec<Bytes>) -> Wire {
        let wire = Wire::default();
        let stream = wire.stream(1, inbound);
        request_handler(&mapping(), GrpcCodec::default(), Box::new(stream), headers).await;
        wire
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_echo_sends_headers_data_trailers() {
        let path = "/pkg.Service/Method";
        let wire = run(request_headers(path), vec![data_frame(b"ping")]).await;
        assert_eq!(
            wire.frames(),
            vec![
                Frame::Headers(response_headers(), false),
                Frame::Data(data_frame(b"ping")),
                Frame::Headers(Code::Ok.trailers(), true),
            ]
        );
        assert_eq!(wire.dropped(), 1);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_failure_maps_to_unknown_status() {
        let errors = ErrorCounter::default();
        let _guard = errors.install();
        for path in [
            "/pkg.Service/Fail",
            "/pkg.Service/Panic",
            "/pkg.Service/PanicEarly",
        ] {
            let logged = errors.count();
            let wire = run(request_headers(path), vec![]).await;
            assert_eq!(
                wire.frames(),
                vec![
                    Frame::Headers(response_headers(), false),
                    Frame::Headers(Code::Unknown.trailers(), true),
                ],
                "{path}"
            );
            assert_eq!(wire.dropped(), 1, "{path}");
            // one error event per failed rpc
            assert_eq!(errors.count() - logged, 1, "{path}");
        }
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_method_that_ended_stream_gets_no_extra_trailers() {
        let path = "/pkg.Service/EndsItself";
        let wire = run(request_headers(path), vec![]).await;
        assert_eq!(wire.trailers(), vec![Code::Ok.trailers()]);
        assert_eq!(wire.frames().len(), 3);
    }

    #[monoio::test(timer_enabled = true)]
    async fn test_malformed_requests_are_rejected() {
        let path = "/pkg.Service/Method";

        let get = Headers::new()
            .with(METHOD, "GET")
            .with(PATH, path)
            .with(CONTENT_TYPE, status::CONTENT_TYPE);
        let wire = run(get, vec![]).await;
        assert_eq!(
            wire.frames(),
            vec![Frame::Headers(Headers::new().with(STATUS, "405"), true)]
        );

        let missing = "/pkg.Service/Missing";
        let wire = run(request_headers(missing), vec![]).await;
        let frames = wire.frames();
        assert_eq!(frames.len(), 1);
        let Frame::Headers(headers, true) = &frames[0] else {
            panic!("expected trailers-only response, got {frames:?}");
        };
        assert_eq!(headers.get(STATUS), Some("200"));
        assert_eq!(Code::from_headers(headers), Some(Code::Unimplemented));
        assert!(headers.get(GRPC_MESSAGE).unwrap().contains(missing));

        let json = Headers::new()
            .with(METHOD, RPC_METHOD)
            .with(PATH, path)
            .with(CONTENT_TYPE, "application/json");
        let wire = run(json, vec![]).await;
        assert_eq!(
            wire.frames(),
            vec![Frame::Headers(Headers::new().with(STATUS, "415"), true)]
        );
    }

    #[test]
    fn test_resolve_checks_in_order() {
        let mapping = mapping();
        let no_method = Headers::new().with(PATH, "/nowhere");
        assert_eq!(
            resolve(&mapping, &no_method).unwrap_err(),
            DispatchError::MethodNotAllowed(None)
        );
        let unmapped = request_headers("/nowhere");
        assert_eq!(
            resolve(&mapping, &unmapped).unwrap_err(),
            DispatchError::Unimplemented(Some("/nowhere".to_string()))
        );
        assert_eq!(
            resolve(&mapping, &request_headers("/pkg.Service/Method"))
                .unwrap()
                .path(),
            "/pkg.Service/Method"
        );
    }
}
