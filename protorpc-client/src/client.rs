//! Typed client stub.

use crate::channel::{CallOptions, ChannelConfig, RpcChannel};
use crate::connection::{Connection, Exchange};
use crate::error::ClientError;
use prost::Message;
use protorpc_protocol::{Encoder, ServiceDescriptor};
use std::sync::Arc;

/// Calls the methods of one service with typed request and response
/// messages.
pub struct Client<C: Exchange = Connection> {
    channel: Arc<RpcChannel<C>>,
    service: ServiceDescriptor,
}

impl Client<Connection> {
    /// Creates a client with its own channel and pool.
    pub fn new(service: ServiceDescriptor, config: ChannelConfig) -> Self {
        Self {
            channel: Arc::new(RpcChannel::new(config)),
            service,
        }
    }
}

impl<C: Exchange> Client<C> {
    /// Creates a client over a shared channel.
    pub fn with_channel(service: ServiceDescriptor, channel: Arc<RpcChannel<C>>) -> Self {
        Self { channel, service }
    }

    pub fn service(&self) -> &ServiceDescriptor {
        &self.service
    }

    pub fn channel(&self) -> &Arc<RpcChannel<C>> {
        &self.channel
    }

    /// Calls `method` with `request`.
    ///
    /// Unknown method names fail with `OperationNotSupported` before any I/O.
    /// Returns `Ok(None)` when the server reported an allowed application
    /// error.
    pub async fn call<Req, Resp>(
        &self,
        method: &str,
        request: &Req,
        options: &CallOptions,
    ) -> Result<Option<Resp>, ClientError>
    where
        Req: Message,
        Resp: Message + Default,
    {
        let descriptor = self.service.find_method_by_name(method).ok_or_else(|| {
            ClientError::OperationNotSupported(format!(
                "{} has no method {}",
                self.service.full_name(),
                method
            ))
        })?;

        let payload = Encoder::encode_message(request)?;
        match self.channel.call(descriptor, payload, options).await? {
            Some(bytes) => Resp::decode(bytes)
                .map(Some)
                .map_err(|e| ClientError::BadResponse(format!("response payload: {}", e))),
            None => Ok(None),
        }
    }
}

impl<C: Exchange> Clone for Client<C> {
    fn clone(&self) -> Self {
        Self {
            channel: self.channel.clone(),
            service: self.service.clone(),
        }
    }
}
