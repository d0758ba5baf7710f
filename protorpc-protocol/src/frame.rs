//! Multipart message framing.
//!
//! A request arriving on a ROUTER socket from a REQ peer looks like:
//!
//! ```text
//! +-------------------+-----------------+------------------+
//! | identity frame(s) | empty delimiter | envelope payload |
//! +-------------------+-----------------+------------------+
//! ```
//!
//! Everything before the last frame is opaque routing data. Replies must
//! carry the exact same routing frames followed by the response payload.

use crate::error::ProtocolError;
use crate::MAX_PAYLOAD_SIZE;
use bytes::Bytes;
use std::collections::VecDeque;
use zeromq::ZmqMessage;

/// A payload together with the routing frames it arrived with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedFrame {
    /// Identity and delimiter frames, in arrival order.
    pub routing: Vec<Bytes>,
    /// The final frame.
    pub payload: Bytes,
}

impl RoutedFrame {
    pub fn new(routing: Vec<Bytes>, payload: Bytes) -> Self {
        Self { routing, payload }
    }

    /// Splits a received multipart message into routing frames and payload.
    pub fn from_message(message: ZmqMessage) -> Result<Self, ProtocolError> {
        let mut frames = message.into_vec();
        let payload = frames.pop().ok_or(ProtocolError::EmptyMessage)?;
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(Self {
            routing: frames,
            payload,
        })
    }

    /// Builds the reply message: the same routing frames, then `payload`.
    pub fn reply(&self, payload: Bytes) -> Result<ZmqMessage, ProtocolError> {
        let mut frames: VecDeque<Bytes> = self.routing.iter().cloned().collect();
        frames.push_back(payload);
        ZmqMessage::try_from(frames)
            .map_err(|_| ProtocolError::InvalidMultipart("cannot build an empty message"))
    }

    /// Returns the peer identity (first routing frame), if any.
    pub fn identity(&self) -> Option<&Bytes> {
        self.routing.first()
    }
}

/// Endpoint transports accepted for bind and connect targets.
const SUPPORTED_SCHEMES: &[&str] = &["tcp", "ipc"];

/// Validates a `scheme://host:port` (or `ipc://path`) endpoint.
pub fn validate_endpoint(endpoint: &str) -> Result<(), ProtocolError> {
    let (scheme, rest) = endpoint
        .split_once("://")
        .ok_or_else(|| ProtocolError::InvalidEndpoint(endpoint.to_string()))?;
    if !SUPPORTED_SCHEMES.contains(&scheme) || rest.is_empty() {
        return Err(ProtocolError::InvalidEndpoint(endpoint.to_string()));
    }
    if scheme == "tcp" {
        let (host, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| ProtocolError::InvalidEndpoint(endpoint.to_string()))?;
        if host.is_empty() || port.parse::<u16>().is_err() {
            return Err(ProtocolError::InvalidEndpoint(endpoint.to_string()));
        }
    }
    Ok(())
}

/// Formats a TCP endpoint from a host and port.
pub fn tcp_endpoint(host: &str, port: u16) -> String {
    format!("tcp://{}:{}", host, port)
}
