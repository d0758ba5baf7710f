//! Diagnostics service hosted by the demo server.

use protorpc_server::{BuiltService, ServiceBuilder, ServiceError};

pub const SERVICE_NAME: &str = "protorpc.Diagnostics";

/// Largest payload `Echo` will return.
const MAX_ECHO_BYTES: usize = 1024 * 1024;

/// Application error code for an oversized echo.
pub const ECHO_TOO_LARGE: i32 = 1;

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoRequest {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: Vec<u8>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct PingResponse {
    /// Server wall clock in milliseconds since the Unix epoch.
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(string, tag = "2")]
    pub version: String,
}

pub fn service() -> BuiltService {
    ServiceBuilder::new(SERVICE_NAME)
        .method::<EchoRequest, _>("Echo", |req, done| {
            if req.payload.len() > MAX_ECHO_BYTES {
                done.fail(ServiceError::application(
                    ECHO_TOO_LARGE,
                    format!("echo payload of {} bytes is too large", req.payload.len()),
                ));
            } else {
                done.run(&req);
            }
        })
        .method::<PingRequest, _>("Ping", |_, done| {
            done.run(&PingResponse {
                timestamp: chrono::Utc::now().timestamp_millis(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
        })
        .build()
}
