//! Server error types.
//!
//! Per-call failures never surface here; the dispatcher turns them into
//! error envelopes. These errors stop a server.

use crate::config::ConfigError;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] protorpc_protocol::ProtocolError),

    #[error("socket error: {0}")]
    Socket(#[from] zeromq::ZmqError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("worker failed: {0}")]
    Worker(String),

    #[error("server socket not bound")]
    NotBound,

    #[error("server already running")]
    AlreadyRunning,
}

/// Service-side failure of one call, reported through a [`Callback`].
///
/// [`Callback`]: crate::service::Callback
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The method exists in the descriptor but has no implementation.
    #[error("method not implemented")]
    NotImplemented,

    /// The service failed while handling the call.
    #[error("{message}")]
    Failed { message: String },

    /// A domain failure identified by a service-defined code.
    #[error("application error {code}: {message}")]
    Application { message: String, code: i32 },
}

impl ServiceError {
    pub fn failed(message: impl Into<String>) -> Self {
        ServiceError::Failed {
            message: message.into(),
        }
    }

    pub fn application(code: i32, message: impl Into<String>) -> Self {
        ServiceError::Application {
            message: message.into(),
            code,
        }
    }
}
