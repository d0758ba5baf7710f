//! Request dispatch: raw request bytes in, raw response bytes out.
//!
//! Stages:
//! 1. Decode the request envelope (`INVALID_REQUEST_PROTO`, empty id)
//! 2. Resolve the service and method (`SERVICE_NOT_FOUND`, `METHOD_NOT_FOUND`)
//! 3. Decode the inner request (`BAD_REQUEST_PROTO`)
//! 4. Invoke the method and await its callback (`RPC_ERROR`,
//!    `METHOD_NOT_FOUND`, `APPLICATION_ERROR`)
//! 5. Encode the response (`NO_ERROR`)

use crate::error::ServiceError;
use crate::metrics::Metrics;
use crate::service::{Callback, Service};
use bytes::Bytes;
use protorpc_protocol::codec::summarize;
use protorpc_protocol::{Decoder, Encoder, ErrorCode, Request, Response};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Routes calls to one service. Holds no per-call state and may be shared
/// across tasks and threads.
pub struct Dispatcher {
    service: Arc<dyn Service>,
    metrics: Option<Arc<Metrics>>,
}

impl Dispatcher {
    pub fn new(service: Arc<dyn Service>) -> Self {
        Self {
            service,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn service(&self) -> &Arc<dyn Service> {
        &self.service
    }

    pub fn metrics(&self) -> Option<&Arc<Metrics>> {
        self.metrics.as_ref()
    }

    /// Handles one raw request and returns the encoded response.
    pub async fn handle(&self, payload: &[u8]) -> Bytes {
        let start = Instant::now();
        if let Some(ref metrics) = self.metrics {
            metrics.inflight_requests.inc();
        }

        let (request, response) = match Decoder::decode_request(payload) {
            Ok(request) => {
                let response = self.dispatch(&request).await;
                (Some(request), response)
            }
            Err(e) => (
                None,
                Response::error(
                    "",
                    ErrorCode::InvalidRequestProto,
                    format!("invalid request envelope: {}", e),
                ),
            ),
        };

        let elapsed = start.elapsed();
        let code = response.code().unwrap_or(ErrorCode::RpcError);
        let method = request.as_ref().map(|r| r.method_name.as_str()).unwrap_or("");

        tracing::info!(
            service = request.as_ref().map(|r| r.service_name.as_str()).unwrap_or(""),
            method,
            request = %summarize(request.as_ref().map(|r| &r.request_proto[..]).unwrap_or(payload)),
            latency_us = elapsed.as_micros() as u64,
            code = %code,
            "call"
        );

        if let Some(ref metrics) = self.metrics {
            metrics.inflight_requests.dec();
            metrics.record_call(method, code, elapsed);
        }

        encode_or_fallback(&response)
    }

    async fn dispatch(&self, request: &Request) -> Response {
        let id = request.id.as_str();
        let descriptor = self.service.descriptor();

        if !request.service_name.is_empty() && request.service_name != descriptor.full_name() {
            return Response::error(
                id,
                ErrorCode::ServiceNotFound,
                format!("unknown service {}", request.service_name),
            );
        }

        let method = match descriptor.find_method_by_name(&request.method_name) {
            Some(method) => method.clone(),
            None => {
                return Response::error(
                    id,
                    ErrorCode::MethodNotFound,
                    format!(
                        "{} has no method {}",
                        descriptor.full_name(),
                        request.method_name
                    ),
                )
            }
        };

        let inner = match self.service.parse_request(&method, &request.request_proto) {
            Ok(inner) => inner,
            Err(e) => {
                return Response::error(
                    id,
                    ErrorCode::BadRequestProto,
                    format!("invalid request for {}: {}", method, e),
                )
            }
        };

        let (done, rx) = Callback::channel();
        if catch_unwind(AssertUnwindSafe(|| {
            self.service.call_method(&method, inner, done)
        }))
        .is_err()
        {
            tracing::error!("Method {} panicked", method);
            return Response::error(id, ErrorCode::RpcError, format!("{} panicked", method));
        }

        match rx.await {
            Ok(Ok(payload)) => Response::ok(id, payload),
            Ok(Err(ServiceError::NotImplemented)) => Response::error(
                id,
                ErrorCode::MethodNotFound,
                format!("{} is not implemented", method),
            ),
            Ok(Err(ServiceError::Failed { message })) => {
                Response::error(id, ErrorCode::RpcError, message)
            }
            Ok(Err(ServiceError::Application { message, code })) => {
                Response::error(id, ErrorCode::ApplicationError, message)
                    .with_application_error_code(code)
            }
            Err(_) => Response::error(
                id,
                ErrorCode::RpcError,
                format!("{} did not complete", method),
            ),
        }
    }
}

/// Encodes `response`; a response too large to encode is replaced by an
/// `RPC_ERROR` carrying the same request id.
fn encode_or_fallback(response: &Response) -> Bytes {
    match Encoder::encode_response(response) {
        Ok(bytes) => bytes,
        Err(e) => {
            tracing::error!("Failed to encode response: {}", e);
            let fallback = Response::error(
                response.request_id.clone(),
                ErrorCode::RpcError,
                format!("failed to encode response: {}", e),
            );
            match Encoder::encode_response(&fallback) {
                Ok(bytes) => bytes,
                Err(_) => Bytes::new(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::ServiceBuilder;
    use prost::Message;

    #[derive(Clone, PartialEq, prost::Message)]
    struct Text {
        #[prost(string, tag = "1")]
        value: String,
    }

    fn dispatcher() -> Dispatcher {
        let service = ServiceBuilder::new("test.TextService")
            .method::<Text, _>("Echo", |req, done| done.run(&req))
            .method::<Text, _>("Fail", |_, done| done.fail(ServiceError::failed("boom")))
            .method::<Text, _>("Deny", |_, done| {
                done.fail(ServiceError::application(7, "denied"))
            })
            .method::<Text, _>("Drop", |_, done| drop(done))
            .method::<Text, _>("Panic", |_, _done| panic!("handler bug"))
            .unimplemented::<Text>("Later")
            .build();
        Dispatcher::new(Arc::new(service))
    }

    fn request(method: &str, inner: Bytes) -> Request {
        Request::new("test.TextService", method, inner).with_id("req-1")
    }

    fn text(value: &str) -> Bytes {
        Bytes::from(
            Text {
                value: value.to_string(),
            }
            .encode_to_vec(),
        )
    }

    async fn call(dispatcher: &Dispatcher, request: &Request) -> Response {
        let raw = Encoder::encode_request(request).unwrap();
        let reply = dispatcher.handle(&raw).await;
        let response = Decoder::decode_response(&reply).unwrap();
        response.validate().unwrap();
        response
    }

    #[tokio::test]
    async fn test_success_echoes_payload_and_id() {
        let dispatcher = dispatcher();
        let response = call(&dispatcher, &request("Echo", text("hello"))).await;
        assert_eq!(response.code(), Some(ErrorCode::NoError));
        assert_eq!(response.request_id, "req-1");
        assert_eq!(response.response_proto, Some(text("hello")));
    }

    #[tokio::test]
    async fn test_invalid_envelope() {
        let dispatcher = dispatcher();
        let reply = dispatcher.handle(b"\xff\xff\xff\xff").await;
        let response = Decoder::decode_response(&reply).unwrap();
        assert_eq!(response.code(), Some(ErrorCode::InvalidRequestProto));
        assert_eq!(response.request_id, "");
        assert!(response.error_message.is_some());
    }

    #[tokio::test]
    async fn test_unknown_method() {
        let dispatcher = dispatcher();
        let response = call(&dispatcher, &request("Missing", Bytes::new())).await;
        assert_eq!(response.code(), Some(ErrorCode::MethodNotFound));
        assert_eq!(response.request_id, "req-1");
        assert!(response.error_message.unwrap().contains("Missing"));
    }

    #[tokio::test]
    async fn test_unknown_service() {
        let dispatcher = dispatcher();
        let req = Request::new("other.Service", "Echo", text("x")).with_id("req-2");
        let response = call(&dispatcher, &req).await;
        assert_eq!(response.code(), Some(ErrorCode::ServiceNotFound));
        assert_eq!(response.request_id, "req-2");
    }

    #[tokio::test]
    async fn test_bad_inner_payload() {
        let dispatcher = dispatcher();
        let response = call(
            &dispatcher,
            &request("Echo", Bytes::from_static(b"\xff\xff\xff")),
        )
        .await;
        assert_eq!(response.code(), Some(ErrorCode::BadRequestProto));
        assert_eq!(response.request_id, "req-1");
    }

    #[tokio::test]
    async fn test_service_failures() {
        let dispatcher = dispatcher();

        let response = call(&dispatcher, &request("Fail", text(""))).await;
        assert_eq!(response.code(), Some(ErrorCode::RpcError));
        assert_eq!(response.error_message.as_deref(), Some("boom"));

        let response = call(&dispatcher, &request("Deny", text(""))).await;
        assert_eq!(response.code(), Some(ErrorCode::ApplicationError));
        assert_eq!(response.application_error_code, Some(7));

        let response = call(&dispatcher, &request("Later", text(""))).await;
        assert_eq!(response.code(), Some(ErrorCode::MethodNotFound));
    }

    #[tokio::test]
    async fn test_abandoned_and_panicking_handlers() {
        let dispatcher = dispatcher();

        let response = call(&dispatcher, &request("Drop", text(""))).await;
        assert_eq!(response.code(), Some(ErrorCode::RpcError));

        let response = call(&dispatcher, &request("Panic", text(""))).await;
        assert_eq!(response.code(), Some(ErrorCode::RpcError));
        assert_eq!(response.request_id, "req-1");
    }

    #[tokio::test]
    async fn test_allowed_codes_do_not_change_server_response() {
        let dispatcher = dispatcher();
        let req = request("Deny", text("")).with_allowed_error_codes([7]);
        let response = call(&dispatcher, &req).await;
        assert_eq!(response.code(), Some(ErrorCode::ApplicationError));
        assert_eq!(response.application_error_code, Some(7));
    }

    #[tokio::test]
    async fn test_metrics_recorded() {
        let metrics = Arc::new(Metrics::new().unwrap());
        let dispatcher = dispatcher().with_metrics(metrics.clone());

        call(&dispatcher, &request("Echo", text("a"))).await;
        call(&dispatcher, &request("Missing", Bytes::new())).await;

        assert_eq!(metrics.requests_total.with_label_values(&["Echo"]).get(), 1.0);
        assert_eq!(
            metrics
                .errors_total
                .with_label_values(&["METHOD_NOT_FOUND"])
                .get(),
            1.0
        );
        assert_eq!(metrics.inflight_requests.get(), 0.0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dispatch_is_correlated() {
        let dispatcher = Arc::new(dispatcher());
        let mut handles = Vec::new();
        for i in 0..50 {
            let dispatcher = dispatcher.clone();
            handles.push(tokio::spawn(async move {
                let req = Request::new("test.TextService", "Echo", text(&i.to_string()))
                    .with_id(format!("id-{}", i));
                let raw = Encoder::encode_request(&req).unwrap();
                let reply = dispatcher.handle(&raw).await;
                let response = Decoder::decode_response(&reply).unwrap();
                (i, response)
            }));
        }
        for handle in handles {
            let (i, response) = handle.await.unwrap();
            assert_eq!(response.request_id, format!("id-{}", i));
            assert_eq!(response.response_proto, Some(text(&i.to_string())));
        }
    }
}
