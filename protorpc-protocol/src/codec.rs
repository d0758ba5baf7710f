//! Encoder and decoder for envelopes and inner messages.

use crate::error::ProtocolError;
use crate::message::{Request, Response};
use crate::MAX_PAYLOAD_SIZE;
use bytes::{Bytes, BytesMut};
use prost::Message;

/// Encodes envelopes and inner messages into wire bytes.
pub struct Encoder;

impl Encoder {
    /// Encodes a request envelope.
    pub fn encode_request(request: &Request) -> Result<Bytes, ProtocolError> {
        Self::encode_message(request)
    }

    /// Encodes a response envelope.
    pub fn encode_response(response: &Response) -> Result<Bytes, ProtocolError> {
        Self::encode_message(response)
    }

    /// Encodes any protobuf message, enforcing the payload size limit.
    pub fn encode_message<M: Message>(message: &M) -> Result<Bytes, ProtocolError> {
        let len = message.encoded_len();
        if len > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: len,
                max: MAX_PAYLOAD_SIZE,
            });
        }
        let mut buf = BytesMut::with_capacity(len);
        message.encode(&mut buf)?;
        Ok(buf.freeze())
    }
}

/// Decodes wire bytes into envelopes and inner messages.
pub struct Decoder;

impl Decoder {
    /// Decodes a request envelope.
    pub fn decode_request(bytes: &[u8]) -> Result<Request, ProtocolError> {
        Self::decode_message(bytes)
    }

    /// Decodes a response envelope.
    pub fn decode_response(bytes: &[u8]) -> Result<Response, ProtocolError> {
        Self::decode_message(bytes)
    }

    /// Decodes any protobuf message.
    pub fn decode_message<M: Message + Default>(bytes: &[u8]) -> Result<M, ProtocolError> {
        if bytes.len() > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: bytes.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }
        Ok(M::decode(bytes)?)
    }
}

/// Maximum number of characters kept by [`summarize`].
const SUMMARY_LIMIT: usize = 64;

/// Renders a short, log-safe summary of a payload: its length and a
/// truncated debug rendering of the leading bytes.
pub fn summarize(bytes: &[u8]) -> String {
    let shown = &bytes[..bytes.len().min(SUMMARY_LIMIT)];
    let text = String::from_utf8_lossy(shown);
    let mut rendered: String = text.escape_debug().collect();
    if bytes.len() > SUMMARY_LIMIT {
        rendered.push_str("...");
    }
    format!("{} bytes \"{}\"", bytes.len(), rendered)
}
