//! RPC channel: envelope construction, one pooled exchange per call, and
//! response error mapping.

use crate::connection::{Connection, ConnectionConfig, Exchange};
use crate::error::ClientError;
use crate::pool::{ConnectionPool, LeaseOptions, DEFAULT_MAX_SIZE};
use bytes::Bytes;
use futures::FutureExt;
use protorpc_protocol::{
    Decoder, Encoder, ErrorCode, Headers, MethodDescriptor, Request, Response,
};
use std::sync::Arc;
use std::time::Duration;

/// Channel configuration.
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Settings for every pooled connection.
    pub connection: ConnectionConfig,
    /// Maximum number of pooled connections.
    pub pool_size: usize,
    /// How calls wait for a free connection.
    pub lease: LeaseOptions,
}

impl ChannelConfig {
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            pool_size: DEFAULT_MAX_SIZE,
            lease: LeaseOptions::default(),
        }
    }

    pub fn with_pool_size(mut self, size: usize) -> Self {
        self.pool_size = size;
        self
    }

    pub fn with_lease_options(mut self, lease: LeaseOptions) -> Self {
        self.lease = lease;
        self
    }

    pub fn recv_timeout(&self) -> Duration {
        self.connection.recv_timeout
    }
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Application error codes that yield `Ok(None)` instead of an error.
    pub allowed_error_codes: Vec<i32>,
    /// Headers to send. Defaults to the current process headers.
    pub headers: Option<Headers>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_allowed_error_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        self.allowed_error_codes.extend(codes);
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.headers = Some(self.take_headers().with_user_id(user_id));
        self
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.headers = Some(self.take_headers().with_referrer(referrer));
        self
    }

    pub fn with_origin_ip(mut self, origin_ip: impl Into<String>) -> Self {
        self.headers = Some(self.take_headers().with_origin_ip(origin_ip));
        self
    }

    fn take_headers(&mut self) -> Headers {
        self.headers.take().unwrap_or_else(Headers::current)
    }
}

/// Sends calls over a pool of connections.
pub struct RpcChannel<C: Exchange = Connection> {
    pool: Arc<ConnectionPool<C>>,
    lease: LeaseOptions,
    recv_timeout: Duration,
}

impl RpcChannel<Connection> {
    /// Creates a channel whose pool opens [`Connection`]s on demand.
    pub fn new(config: ChannelConfig) -> Self {
        let connection = config.connection.clone();
        let pool = ConnectionPool::new(
            move || Connection::connect(connection.clone()).boxed(),
            config.pool_size,
        );
        Self::with_pool(Arc::new(pool), &config)
    }
}

impl<C: Exchange> RpcChannel<C> {
    /// Creates a channel over an existing pool.
    pub fn with_pool(pool: Arc<ConnectionPool<C>>, config: &ChannelConfig) -> Self {
        Self {
            pool,
            lease: config.lease,
            recv_timeout: config.recv_timeout(),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<C>> {
        &self.pool
    }

    /// Performs one call.
    ///
    /// Returns `Ok(Some(payload))` on success and `Ok(None)` when the server
    /// failed with an application error code listed in
    /// `options.allowed_error_codes`. Transport failures poison the leased
    /// connection; the call is not retried.
    pub async fn call(
        &self,
        method: &MethodDescriptor,
        request_proto: Bytes,
        options: &CallOptions,
    ) -> Result<Option<Bytes>, ClientError> {
        let headers = options.headers.clone().unwrap_or_else(Headers::current);
        let request = Request::new(method.service_name(), method.name(), request_proto)
            .with_headers(headers)
            .with_allowed_error_codes(options.allowed_error_codes.iter().copied());
        let payload = Encoder::encode_request(&request)?;

        let mut lease = self.pool.lease(self.lease).await?;
        let result = lease.exchange(payload, self.recv_timeout).await;
        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Call {} failed, removing connection: {}", method, e);
                lease.remove();
                return Err(e);
            }
        };

        let response = match decode_reply(&request, &reply) {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!("Call {} got a bad response: {}", method, e);
                lease.remove();
                return Err(e);
            }
        };
        drop(lease);

        tracing::debug!(
            "Call {} id={} completed with {}",
            method,
            request.id,
            response.error_code
        );

        if response.is_ok() {
            return Ok(response.response_proto);
        }
        if let Some(code) = response.application_error_code {
            if request.allows(code) {
                return Ok(None);
            }
        }
        Err(ClientError::from_response(&response))
    }
}

fn decode_reply(request: &Request, reply: &[u8]) -> Result<Response, ClientError> {
    let response =
        Decoder::decode_response(reply).map_err(|e| ClientError::BadResponse(e.to_string()))?;
    response
        .validate()
        .map_err(|e| ClientError::BadResponse(e.to_string()))?;
    // The server cannot echo an id it failed to decode.
    let uncorrelated = response.request_id.is_empty()
        && response.code() == Some(ErrorCode::InvalidRequestProto);
    if response.request_id != request.id && !uncorrelated {
        return Err(ClientError::BadResponse(format!(
            "request id mismatch: sent {}, got {}",
            request.id, response.request_id
        )));
    }
    Ok(response)
}
