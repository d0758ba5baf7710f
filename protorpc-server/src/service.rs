//! Service registry: the contract between the dispatcher and service
//! implementations, plus a builder for typed services.

use crate::error::ServiceError;
use bytes::Bytes;
use prost::Message;
use protorpc_protocol::{Encoder, MethodDescriptor, ServiceDescriptor};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use tokio::sync::oneshot;

/// A decoded inner request, typed by the method that parsed it.
pub type MethodRequest = Box<dyn Any + Send>;

/// Outcome of one call as reported by a service.
pub type CallResult = Result<Bytes, ServiceError>;

/// Completion handle for one call.
///
/// A service completes a call by consuming its callback. Dropping the
/// callback without completing it fails the call.
#[derive(Debug)]
pub struct Callback {
    tx: oneshot::Sender<CallResult>,
}

impl Callback {
    pub(crate) fn channel() -> (Self, oneshot::Receiver<CallResult>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Completes the call with a response message.
    pub fn run<M: Message>(self, response: &M) {
        let result = Encoder::encode_message(response)
            .map_err(|e| ServiceError::failed(format!("failed to encode response: {}", e)));
        self.complete(result);
    }

    /// Fails the call.
    pub fn fail(self, error: ServiceError) {
        self.complete(Err(error));
    }

    /// Completes the call with an already encoded result.
    pub fn complete(self, result: CallResult) {
        // The dispatcher may have given up on the call; nothing to do then.
        let _ = self.tx.send(result);
    }
}

/// A service the dispatcher can route calls to.
pub trait Service: Send + Sync + 'static {
    fn descriptor(&self) -> &ServiceDescriptor;

    /// Decodes the inner request for `method`.
    fn parse_request(
        &self,
        method: &MethodDescriptor,
        payload: &[u8],
    ) -> Result<MethodRequest, prost::DecodeError>;

    /// Invokes `method`. The implementation must eventually consume `done`,
    /// from any thread or task.
    fn call_method(&self, method: &MethodDescriptor, request: MethodRequest, done: Callback);
}

type ParseFn = Box<dyn Fn(&[u8]) -> Result<MethodRequest, prost::DecodeError> + Send + Sync>;
type InvokeFn = Box<dyn Fn(MethodRequest, Callback) + Send + Sync>;

struct MethodEntry {
    parse: ParseFn,
    invoke: InvokeFn,
}

fn parse_as<Req: Message + Default + Send + 'static>(
    payload: &[u8],
) -> Result<MethodRequest, prost::DecodeError> {
    Ok(Box::new(Req::decode(payload)?))
}

/// Builds a [`Service`] from typed method handlers.
pub struct ServiceBuilder {
    descriptor: ServiceDescriptor,
    methods: HashMap<String, MethodEntry>,
}

impl ServiceBuilder {
    pub fn new(full_name: impl Into<String>) -> Self {
        Self {
            descriptor: ServiceDescriptor::new(full_name.into()),
            methods: HashMap::new(),
        }
    }

    /// Registers a callback-style handler for `name`.
    pub fn method<Req, F>(mut self, name: &str, handler: F) -> Self
    where
        Req: Message + Default + Send + 'static,
        F: Fn(Req, Callback) + Send + Sync + 'static,
    {
        self.descriptor = self.descriptor.with_method(name);
        let method = name.to_string();
        self.methods.insert(
            name.to_string(),
            MethodEntry {
                parse: Box::new(parse_as::<Req>),
                invoke: Box::new(move |request, done| match request.downcast::<Req>() {
                    Ok(request) => handler(*request, done),
                    Err(_) => done.fail(ServiceError::failed(format!(
                        "request type mismatch for {}",
                        method
                    ))),
                }),
            },
        );
        self
    }

    /// Registers an async handler for `name`. The handler runs on its own
    /// task; a panic in it fails the call.
    pub fn async_method<Req, Resp, F, Fut>(self, name: &str, handler: F) -> Self
    where
        Req: Message + Default + Send + 'static,
        Resp: Message + 'static,
        F: Fn(Req) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Resp, ServiceError>> + Send + 'static,
    {
        self.method::<Req, _>(name, move |request, done| {
            let fut = handler(request);
            tokio::spawn(async move {
                match fut.await {
                    Ok(response) => done.run(&response),
                    Err(e) => done.fail(e),
                }
            });
        })
    }

    /// Declares `name` without an implementation. Calls to it are answered
    /// as method-not-found.
    pub fn unimplemented<Req>(self, name: &str) -> Self
    where
        Req: Message + Default + Send + 'static,
    {
        self.method::<Req, _>(name, |_, done| done.fail(ServiceError::NotImplemented))
    }

    pub fn build(self) -> BuiltService {
        BuiltService {
            descriptor: self.descriptor,
            methods: self.methods,
        }
    }
}

/// A service assembled by [`ServiceBuilder`].
pub struct BuiltService {
    descriptor: ServiceDescriptor,
    methods: HashMap<String, MethodEntry>,
}

impl Service for BuiltService {
    fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    fn parse_request(
        &self,
        method: &MethodDescriptor,
        payload: &[u8],
    ) -> Result<MethodRequest, prost::DecodeError> {
        match self.methods.get(method.name()) {
            Some(entry) => (entry.parse)(payload),
            None => Err(prost::DecodeError::new("no request type for method")),
        }
    }

    fn call_method(&self, method: &MethodDescriptor, request: MethodRequest, done: Callback) {
        match self.methods.get(method.name()) {
            Some(entry) => (entry.invoke)(request, done),
            None => done.fail(ServiceError::NotImplemented),
        }
    }
}
