mod error;
pub use error::{AnyError, AnyResult, TransportError};

pub mod codec;
pub mod config;
pub mod headers;
pub mod listener;
pub mod message;
pub mod runtime;
pub mod status;
pub mod transport;
