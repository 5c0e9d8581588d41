pub mod echo;
pub mod grpc;
pub mod server;

pub use server::{serve, GrpcProtocolFactory, Server, ServerError};
