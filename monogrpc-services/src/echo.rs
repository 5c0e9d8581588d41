use anyhow::{anyhow, bail};
use bytes::Bytes;
use monoio::io::stream::Stream;

use crate::grpc::{Mapping, MethodDescriptor, RpcFuture, RpcStream, ServiceGroup};

pub const UNARY: &str = "/monogrpc.Echo/Unary";
pub const STREAM: &str = "/monogrpc.Echo/Stream";
pub const FAIL: &str = "/monogrpc.Echo/Fail";

/// Demo service replying with whatever it receives.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoService;

impl ServiceGroup for EchoService {
    fn mapping(&self) -> Mapping {
        Mapping::new()
            .with(MethodDescriptor::new(UNARY, echo_unary))
            .with(MethodDescriptor::new(STREAM, echo_stream))
            .with(MethodDescriptor::new(FAIL, echo_fail))
    }
}

fn echo_unary<'a>(stream: &'a mut RpcStream<Bytes, Bytes>) -> RpcFuture<'a> {
    Box::pin(async move {
        let request = stream
            .recv()
            .await?
            .ok_or_else(|| anyhow!("missing request message"))?;
        stream.send(&request, false).await?;
        Ok(())
    })
}

fn echo_stream<'a>(stream: &'a mut RpcStream<Bytes, Bytes>) -> RpcFuture<'a> {
    Box::pin(async move {
        let mut count = 0usize;
        while let Some(message) = stream.next().await {
            stream.send(&message?, false).await?;
            count += 1;
        }
        tracing::debug!(stream = %stream.id(), count, "echo stream finished");
        Ok(())
    })
}

fn echo_fail<'a>(stream: &'a mut RpcStream<Bytes, Bytes>) -> RpcFuture<'a> {
    Box::pin(async move {
        let reason = stream.recv().await?.unwrap_or_default();
        bail!("failure requested: {}", String::from_utf8_lossy(&reason))
    })
}
