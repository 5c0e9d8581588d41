use thiserror::Error;

pub type AnyError = anyhow::Error;
pub type AnyResult<T> = std::result::Result<T, AnyError>;

/// Failure reported by the transport underneath a single RPC stream.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("stream reset by peer (code {0})")]
    Reset(u32),
    #[error("stream is already closed")]
    Closed,
    #[error("response headers already sent, only trailers may follow")]
    HeadersSent,
    #[error("invalid header {name}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("protocol error: {0}")]
    Protocol(String),
}
