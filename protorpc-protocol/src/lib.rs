//! # protorpc-protocol
//!
//! Wire protocol implementation for protorpc.
//!
//! This crate provides:
//! - Protobuf request/response envelope types
//! - Stable error codes
//! - Service and method descriptors
//! - Multipart routing-frame handling for ROUTER/REQ sockets

pub mod codec;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod message;

pub use codec::{Decoder, Encoder};
pub use descriptor::{MethodDescriptor, ServiceDescriptor};
pub use error::{ErrorCode, ProtocolError};
pub use frame::{validate_endpoint, RoutedFrame};
pub use message::{Headers, Request, Response};

/// Default port for protorpc servers.
pub const DEFAULT_PORT: u16 = 12345;

/// Maximum envelope payload size (16 MiB).
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;
