//! Protobuf envelope types for requests and responses.
//!
//! The envelopes are declared with `prost` derives instead of generated code;
//! field tags are part of the wire contract.

use crate::error::{ErrorCode, ProtocolError};
use bytes::Bytes;
use std::sync::OnceLock;

/// Caller metadata stamped on every request.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Headers {
    /// Milliseconds since the Unix epoch at the time the request was built.
    #[prost(int64, tag = "1")]
    pub timestamp: i64,

    #[prost(string, tag = "2")]
    pub hostname: String,

    #[prost(string, tag = "3")]
    pub procname: String,

    #[prost(uint32, tag = "4")]
    pub pid: u32,

    #[prost(string, optional, tag = "5")]
    pub user_id: Option<String>,

    #[prost(string, optional, tag = "6")]
    pub referrer: Option<String>,

    #[prost(string, optional, tag = "7")]
    pub origin_ip: Option<String>,
}

struct HostInfo {
    hostname: String,
    procname: String,
    pid: u32,
}

fn host_info() -> &'static HostInfo {
    static INFO: OnceLock<HostInfo> = OnceLock::new();
    INFO.get_or_init(|| HostInfo {
        hostname: sysinfo::System::host_name().unwrap_or_else(|| "unknown".to_string()),
        procname: std::env::current_exe()
            .ok()
            .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_else(|| "unknown".to_string()),
        pid: std::process::id(),
    })
}

impl Headers {
    /// Builds headers for the current process, timestamped now.
    pub fn current() -> Self {
        let info = host_info();
        Self {
            timestamp: chrono::Utc::now().timestamp_millis(),
            hostname: info.hostname.clone(),
            procname: info.procname.clone(),
            pid: info.pid,
            user_id: None,
            referrer: None,
            origin_ip: None,
        }
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_origin_ip(mut self, origin_ip: impl Into<String>) -> Self {
        self.origin_ip = Some(origin_ip.into());
        self
    }
}

/// Request envelope.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Request {
    /// Fully-qualified service name.
    #[prost(string, tag = "1")]
    pub service_name: String,

    #[prost(string, tag = "2")]
    pub method_name: String,

    /// Serialized inner request message.
    #[prost(bytes = "bytes", tag = "3")]
    pub request_proto: Bytes,

    /// Correlation token echoed back as `Response::request_id`.
    #[prost(string, tag = "4")]
    pub id: String,

    #[prost(message, optional, tag = "5")]
    pub headers: Option<Headers>,

    /// Application error codes the caller treats as non-fatal.
    #[prost(int32, repeated, tag = "6")]
    pub allowed_error_codes: Vec<i32>,
}

impl Request {
    /// Creates a request with a fresh correlation id and current headers.
    pub fn new(
        service_name: impl Into<String>,
        method_name: impl Into<String>,
        request_proto: Bytes,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            method_name: method_name.into(),
            request_proto,
            id: uuid::Uuid::new_v4().to_string(),
            headers: Some(Headers::current()),
            allowed_error_codes: Vec::new(),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = Some(headers);
        self
    }

    /// Adds allowed application error codes, keeping insertion order and
    /// skipping duplicates.
    pub fn with_allowed_error_codes(mut self, codes: impl IntoIterator<Item = i32>) -> Self {
        for code in codes {
            if !self.allowed_error_codes.contains(&code) {
                self.allowed_error_codes.push(code);
            }
        }
        self
    }

    /// Returns whether `code` is in the allowed set.
    pub fn allows(&self, code: i32) -> bool {
        self.allowed_error_codes.contains(&code)
    }
}

/// Response envelope.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Response {
    /// Serialized inner response, present only on success.
    #[prost(bytes = "bytes", optional, tag = "1")]
    pub response_proto: Option<Bytes>,

    #[prost(enumeration = "ErrorCode", tag = "2")]
    pub error_code: i32,

    /// Present only on error.
    #[prost(string, optional, tag = "3")]
    pub error_message: Option<String>,

    /// Service-defined error code.
    #[prost(int32, optional, tag = "4")]
    pub application_error_code: Option<i32>,

    #[prost(string, tag = "5")]
    pub request_id: String,
}

impl Response {
    /// Builds a successful response.
    pub fn ok(request_id: impl Into<String>, response_proto: Bytes) -> Self {
        Self {
            response_proto: Some(response_proto),
            error_code: ErrorCode::NoError as i32,
            error_message: None,
            application_error_code: None,
            request_id: request_id.into(),
        }
    }

    /// Builds an error response. `code` must not be `NoError`; it is coerced
    /// to `RpcError` so that the envelope invariants always hold.
    pub fn error(
        request_id: impl Into<String>,
        code: ErrorCode,
        message: impl Into<String>,
    ) -> Self {
        let code = if code == ErrorCode::NoError {
            ErrorCode::RpcError
        } else {
            code
        };
        Self {
            response_proto: None,
            error_code: code as i32,
            error_message: Some(message.into()),
            application_error_code: None,
            request_id: request_id.into(),
        }
    }

    pub fn with_application_error_code(mut self, code: i32) -> Self {
        self.application_error_code = Some(code);
        self
    }

    /// Returns the decoded error code, or `None` for values this build does
    /// not know.
    pub fn code(&self) -> Option<ErrorCode> {
        ErrorCode::try_from(self.error_code).ok()
    }

    pub fn is_ok(&self) -> bool {
        self.error_code == ErrorCode::NoError as i32
    }

    pub fn is_error(&self) -> bool {
        !self.is_ok()
    }

    /// Checks the envelope invariants: exactly one of payload and error
    /// message, and a payload iff the code is `NoError`.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match (self.response_proto.is_some(), self.error_message.is_some()) {
            (true, true) => Err(ProtocolError::InvalidResponse(
                "both payload and error message are set",
            )),
            (false, false) => Err(ProtocolError::InvalidResponse(
                "neither payload nor error message is set",
            )),
            (true, false) if !self.is_ok() => Err(ProtocolError::InvalidResponse(
                "payload present on an error response",
            )),
            (false, true) if self.is_ok() => Err(ProtocolError::InvalidResponse(
                "error message present on a successful response",
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_allowed_error_codes_keep_first_occurrence(codes in prop::collection::vec(-5i32..20, 0..40)) {
            let req = Request::new("s", "m", Bytes::new()).with_allowed_error_codes(codes.clone());

            let mut expected = Vec::new();
            for code in &codes {
                if !expected.contains(code) {
                    expected.push(*code);
                }
            }
            prop_assert_eq!(&req.allowed_error_codes, &expected);
            for code in codes {
                prop_assert!(req.allows(code));
            }
        }

        #[test]
        fn prop_error_responses_always_validate(code in 0i32..12, message in ".{0,40}") {
            let code = ErrorCode::try_from(code).unwrap_or(ErrorCode::RpcError);
            let resp = Response::error("r", code, message);
            prop_assert!(resp.is_error());
            prop_assert!(resp.validate().is_ok());
        }
    }

    #[test]
    fn test_request_new_stamps_headers_and_id() {
        let req = Request::new("test.Echo", "Echo", Bytes::from_static(b"hi"));
        assert_eq!(req.service_name, "test.Echo");
        assert_eq!(req.method_name, "Echo");
        assert_eq!(uuid::Uuid::parse_str(&req.id).unwrap().get_version_num(), 4);

        let headers = req.headers.expect("headers");
        assert!(headers.timestamp > 0);
        assert_eq!(headers.pid, std::process::id());
        assert!(!headers.hostname.is_empty());
        assert!(headers.user_id.is_none());
    }

    #[test]
    fn test_request_ids_are_unique() {
        let a = Request::new("s", "m", Bytes::new());
        let b = Request::new("s", "m", Bytes::new());
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_allowed_error_codes_are_ordered_and_deduplicated() {
        let req = Request::new("s", "m", Bytes::new())
            .with_allowed_error_codes([7, 3, 7])
            .with_allowed_error_codes([3, 9]);
        assert_eq!(req.allowed_error_codes, vec![7, 3, 9]);
        assert!(req.allows(9));
        assert!(!req.allows(1));
    }

    #[test]
    fn test_tracing_headers() {
        let headers = Headers::current()
            .with_user_id("u-1")
            .with_referrer("https://example.com")
            .with_origin_ip("10.0.0.1");
        assert_eq!(headers.user_id.as_deref(), Some("u-1"));
        assert_eq!(headers.referrer.as_deref(), Some("https://example.com"));
        assert_eq!(headers.origin_ip.as_deref(), Some("10.0.0.1"));
    }

    #[test]
    fn test_response_ok_invariants() {
        let resp = Response::ok("r-1", Bytes::from_static(b"payload"));
        assert!(resp.is_ok());
        assert_eq!(resp.code(), Some(ErrorCode::NoError));
        assert!(resp.error_message.is_none());
        resp.validate().unwrap();
    }

    #[test]
    fn test_response_error_invariants() {
        let resp = Response::error("r-1", ErrorCode::MethodNotFound, "no such method")
            .with_application_error_code(7);
        assert!(resp.is_error());
        assert_eq!(resp.code(), Some(ErrorCode::MethodNotFound));
        assert!(resp.response_proto.is_none());
        assert_eq!(resp.application_error_code, Some(7));
        resp.validate().unwrap();
    }

    #[test]
    fn test_response_error_never_carries_no_error() {
        let resp = Response::error("r-1", ErrorCode::NoError, "oops");
        assert_eq!(resp.code(), Some(ErrorCode::RpcError));
    }

    #[test]
    fn test_validate_rejects_broken_envelopes() {
        let mut resp = Response::ok("r", Bytes::new());
        resp.error_message = Some("x".into());
        assert!(resp.validate().is_err());

        let mut resp = Response::ok("r", Bytes::new());
        resp.response_proto = None;
        assert!(resp.validate().is_err());

        let mut resp = Response::ok("r", Bytes::new());
        resp.error_code = ErrorCode::RpcError as i32;
        assert!(resp.validate().is_err());

        let mut resp = Response::error("r", ErrorCode::RpcError, "x");
        resp.error_code = ErrorCode::NoError as i32;
        assert!(resp.validate().is_err());
    }

    #[test]
    fn test_unknown_error_code_value() {
        let mut resp = Response::error("r", ErrorCode::RpcError, "x");
        resp.error_code = 99;
        assert_eq!(resp.code(), None);
        assert!(resp.is_error());
    }
}
