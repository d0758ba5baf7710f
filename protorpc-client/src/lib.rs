//! # protorpc-client
//!
//! Client library for protorpc.
//!
//! This crate provides:
//! - REQ-socket connections with lazy age/idle expiry
//! - A bounded, FIFO-rotating connection pool with scoped leases
//! - An RPC channel that maps response error codes to typed errors
//! - A typed client stub over a service descriptor

pub mod channel;
pub mod client;
pub mod connection;
pub mod error;
pub mod pool;

pub use channel::{CallOptions, ChannelConfig, RpcChannel};
pub use client::Client;
pub use connection::{Connection, ConnectionConfig, Exchange, PoolableConnection};
pub use error::ClientError;
pub use pool::{ConnectionPool, Lease, LeaseOptions, PoolStats};
