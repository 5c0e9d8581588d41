//! gRPC server runtime.
//!
//! A connection is served by an [`H2Connection`] feeding a per-connection
//! [`Handler`]. The handler runs every inbound stream as its own task through
//! [`request_handler`], which resolves the method in the shared [`Mapping`] and
//! hands it an [`RpcStream`] typed with the method's request and reply messages.

mod dispatch;
mod h2;
mod handler;
mod method;
mod stream;
#[cfg(test)]
pub(crate) mod testing;

pub use dispatch::{request_handler, resolve, DispatchError};
pub use h2::H2Connection;
pub use handler::{Handler, HandlerError};
pub use method::{Mapping, MethodDescriptor, RpcFuture, ServiceGroup};
pub use stream::{RpcStream, StreamError};
