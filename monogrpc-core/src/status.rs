//! gRPC status codes and the header vocabulary that carries them.

use std::fmt;

use crate::headers::{Headers, CONTENT_TYPE as CONTENT_TYPE_HEADER, STATUS};

pub const GRPC_STATUS: &str = "grpc-status";
pub const GRPC_MESSAGE: &str = "grpc-message";

/// Content type sent on every response.
pub const CONTENT_TYPE: &str = "application/grpc+proto";
/// Content types accepted on requests.
pub const CONTENT_TYPES: [&str; 2] = ["application/grpc", "application/grpc+proto"];

/// The only verb that carries an RPC.
pub const RPC_METHOD: &str = "POST";

pub fn is_accepted_content_type(content_type: &str) -> bool {
    CONTENT_TYPES.contains(&content_type)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        let code = match value {
            0 => Code::Ok,
            1 => Code::Cancelled,
            2 => Code::Unknown,
            3 => Code::InvalidArgument,
            4 => Code::DeadlineExceeded,
            5 => Code::NotFound,
            6 => Code::AlreadyExists,
            7 => Code::PermissionDenied,
            8 => Code::ResourceExhausted,
            9 => Code::FailedPrecondition,
            10 => Code::Aborted,
            11 => Code::OutOfRange,
            12 => Code::Unimplemented,
            13 => Code::Internal,
            14 => Code::Unavailable,
            15 => Code::DataLoss,
            16 => Code::Unauthenticated,
            _ => return None,
        };
        Some(code)
    }

    /// Reads the `grpc-status` field of a trailer block.
    pub fn from_headers(headers: &Headers) -> Option<Self> {
        headers
            .get(GRPC_STATUS)
            .and_then(|v| v.parse::<u8>().ok())
            .and_then(Self::from_u8)
    }

    /// A trailer block carrying only this code.
    pub fn trailers(self) -> Headers {
        Headers::new().with(GRPC_STATUS, self.as_u8().to_string())
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_u8())
    }
}

/// Initial response headers of every accepted RPC.
pub fn response_headers() -> Headers {
    Headers::new()
        .with(STATUS, "200")
        .with(CONTENT_TYPE_HEADER, CONTENT_TYPE)
}
