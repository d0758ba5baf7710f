//! Client error types.

use protorpc_protocol::{ErrorCode, Response};
use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection pool exhausted")]
    PoolExhausted,

    #[error("request timeout")]
    Timeout,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid request envelope: {0}")]
    InvalidRequestEnvelope(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("bad request payload: {0}")]
    BadRequestPayload(String),

    #[error("application error {application_error_code}: {message}")]
    Application {
        message: String,
        application_error_code: i32,
    },

    #[error("rpc error {code}: {message}")]
    Rpc {
        /// Raw wire value; may be a code this build does not know.
        code: i32,
        message: String,
        application_error_code: Option<i32>,
    },

    #[error("bad response: {0}")]
    BadResponse(String),

    #[error("operation not supported: {0}")]
    OperationNotSupported(String),

    #[error("protocol error: {0}")]
    Protocol(#[from] protorpc_protocol::ProtocolError),
}

impl ClientError {
    /// Maps an error response onto its client-side kind.
    ///
    /// Must only be called with responses whose code is not `NO_ERROR`.
    pub fn from_response(response: &Response) -> Self {
        let message = response.error_message.clone().unwrap_or_default();
        let application_error_code = response.application_error_code;

        match response.code() {
            Some(ErrorCode::InvalidRequestProto) => ClientError::InvalidRequestEnvelope(message),
            Some(ErrorCode::MethodNotFound) | Some(ErrorCode::ServiceNotFound) => {
                ClientError::MethodNotFound(message)
            }
            Some(ErrorCode::BadRequestProto) | Some(ErrorCode::BadRequestData) => {
                ClientError::BadRequestPayload(message)
            }
            Some(ErrorCode::ApplicationError) => match application_error_code {
                Some(code) => ClientError::Application {
                    message,
                    application_error_code: code,
                },
                None => ClientError::Rpc {
                    code: response.error_code,
                    message,
                    application_error_code,
                },
            },
            _ => ClientError::Rpc {
                code: response.error_code,
                message,
                application_error_code,
            },
        }
    }

    /// Returns the service-defined error code carried by this error, if any.
    pub fn application_error_code(&self) -> Option<i32> {
        match self {
            ClientError::Application {
                application_error_code,
                ..
            } => Some(*application_error_code),
            ClientError::Rpc {
                application_error_code,
                ..
            } => *application_error_code,
            _ => None,
        }
    }

    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::PoolExhausted => true,
            ClientError::Timeout => true,
            ClientError::Transport(_) => true,
            ClientError::Rpc { code, .. } => ErrorCode::try_from(*code)
                .map(|c| c.is_retryable())
                .unwrap_or(false),
            _ => false,
        }
    }
}
