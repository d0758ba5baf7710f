//! Protocol error types and error codes.

use std::fmt;
use thiserror::Error;

/// Protocol-level errors that can occur while encoding, decoding or framing
/// envelopes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("decode error: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("encode error: {0}")]
    Encode(#[from] prost::EncodeError),

    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("empty multipart message")]
    EmptyMessage,

    #[error("invalid multipart message: {0}")]
    InvalidMultipart(&'static str),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid response envelope: {0}")]
    InvalidResponse(&'static str),
}

/// Stable error codes carried in response envelopes.
///
/// The numeric values are the wire contract; names may change, values must
/// not.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum ErrorCode {
    NoError = 0,
    BadRequestData = 1,
    BadRequestProto = 2,
    ServiceNotFound = 3,
    MethodNotFound = 4,
    RpcError = 5,
    RpcFailed = 6,
    InvalidRequestProto = 7,
    BadResponseProto = 8,
    UnknownHost = 9,
    IoError = 10,
    ApplicationError = 11,
}

impl ErrorCode {
    /// Returns the wire value of this code.
    pub fn value(self) -> i32 {
        self as i32
    }

    /// Returns whether a call failing with this code may succeed if retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCode::RpcFailed | ErrorCode::IoError)
    }

    /// Returns the canonical upper-case name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::NoError => "NO_ERROR",
            ErrorCode::BadRequestData => "BAD_REQUEST_DATA",
            ErrorCode::BadRequestProto => "BAD_REQUEST_PROTO",
            ErrorCode::ServiceNotFound => "SERVICE_NOT_FOUND",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::RpcError => "RPC_ERROR",
            ErrorCode::RpcFailed => "RPC_FAILED",
            ErrorCode::InvalidRequestProto => "INVALID_REQUEST_PROTO",
            ErrorCode::BadResponseProto => "BAD_RESPONSE_PROTO",
            ErrorCode::UnknownHost => "UNKNOWN_HOST",
            ErrorCode::IoError => "IO_ERROR",
            ErrorCode::ApplicationError => "APPLICATION_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
