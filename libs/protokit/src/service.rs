//! Service and RPC descriptors and the RPC registration hook.
//!
//! A [`Service`] is the declaration-time handle; its [`ServiceDescriptor`] is
//! recorded in the registry as soon as the service is created and grows one
//! [`RpcDescriptor`] per successful [`Service::register`] call.

use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::{BoxStream, Stream};
use futures::{FutureExt, StreamExt};
use parking_lot::RwLock;

use crate::error::{RegistrationError, RpcError, SchemaError};
use crate::field::ScalarType;
use crate::message::{Message, MessageDescriptor};
use crate::naming::check_identifier;
use crate::registry::SchemaRegistry;
use crate::scope::CallScope;

/// Stream of declared instances flowing into or out of a handler.
pub type MessageStream = BoxStream<'static, Result<Message, RpcError>>;

/// A pre- or post-processing step. Receives the message and the active call
/// scope and returns the (possibly replaced) message.
pub type Processor = Arc<dyn Fn(Message, &CallScope) -> Result<Message, RpcError> + Send + Sync>;

/// Boxed unary handler.
pub type UnaryFn =
    Arc<dyn Fn(Message, Arc<CallScope>) -> BoxFuture<'static, Result<Message, RpcError>> + Send + Sync>;
pub type ServerStreamingFn = Arc<
    dyn Fn(Message, Arc<CallScope>) -> BoxFuture<'static, Result<MessageStream, RpcError>>
        + Send
        + Sync,
>;
pub type ClientStreamingFn = Arc<
    dyn Fn(MessageStream, Arc<CallScope>) -> BoxFuture<'static, Result<Message, RpcError>>
        + Send
        + Sync,
>;
pub type StreamingFn = Arc<
    dyn Fn(MessageStream, Arc<CallScope>) -> BoxFuture<'static, Result<MessageStream, RpcError>>
        + Send
        + Sync,
>;

/// Wraps a processor closure.
pub fn processor<F>(f: F) -> Processor
where
    F: Fn(Message, &CallScope) -> Result<Message, RpcError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Cardinality of an RPC, fixed at registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallShape {
    Unary,
    ServerStreaming,
    ClientStreaming,
    Streaming,
}

impl CallShape {
    #[must_use]
    pub const fn from_flags(request_streaming: bool, response_streaming: bool) -> Self {
        match (request_streaming, response_streaming) {
            (false, false) => Self::Unary,
            (false, true) => Self::ServerStreaming,
            (true, false) => Self::ClientStreaming,
            (true, true) => Self::Streaming,
        }
    }

    #[must_use]
    pub const fn request_streaming(self) -> bool {
        matches!(self, Self::ClientStreaming | Self::Streaming)
    }

    #[must_use]
    pub const fn response_streaming(self) -> bool {
        matches!(self, Self::ServerStreaming | Self::Streaming)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unary => "unary",
            Self::ServerStreaming => "server-streaming",
            Self::ClientStreaming => "client-streaming",
            Self::Streaming => "bidirectional-streaming",
        }
    }
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The user-supplied implementation of one RPC method.
#[derive(Clone)]
pub enum Handler {
    Unary(UnaryFn),
    ServerStreaming(ServerStreamingFn),
    ClientStreaming(ClientStreamingFn),
    Streaming(StreamingFn),
}

impl Handler {
    pub fn unary<F, Fut>(f: F) -> Self
    where
        F: Fn(Message, Arc<CallScope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Message, RpcError>> + Send + 'static,
    {
        Self::Unary(Arc::new(move |request, scope| f(request, scope).boxed()))
    }

    pub fn server_streaming<F, Fut, S>(f: F) -> Self
    where
        F: Fn(Message, Arc<CallScope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, RpcError>> + Send + 'static,
        S: Stream<Item = Result<Message, RpcError>> + Send + 'static,
    {
        Self::ServerStreaming(Arc::new(move |request, scope| {
            let fut = f(request, scope);
            async move { fut.await.map(StreamExt::boxed) }.boxed()
        }))
    }

    pub fn client_streaming<F, Fut>(f: F) -> Self
    where
        F: Fn(MessageStream, Arc<CallScope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Message, RpcError>> + Send + 'static,
    {
        Self::ClientStreaming(Arc::new(move |requests, scope| f(requests, scope).boxed()))
    }

    pub fn streaming<F, Fut, S>(f: F) -> Self
    where
        F: Fn(MessageStream, Arc<CallScope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<S, RpcError>> + Send + 'static,
        S: Stream<Item = Result<Message, RpcError>> + Send + 'static,
    {
        Self::Streaming(Arc::new(move |requests, scope| {
            let fut = f(requests, scope);
            async move { fut.await.map(StreamExt::boxed) }.boxed()
        }))
    }

    #[must_use]
    pub const fn shape(&self) -> CallShape {
        match self {
            Self::Unary(_) => CallShape::Unary,
            Self::ServerStreaming(_) => CallShape::ServerStreaming,
            Self::ClientStreaming(_) => CallShape::ClientStreaming,
            Self::Streaming(_) => CallShape::Streaming,
        }
    }
}

impl fmt::Debug for Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handler({})", self.shape())
    }
}

/// Declared type of one side of an RPC signature.
#[derive(Clone)]
pub enum Annotation {
    Message(Arc<MessageDescriptor>),
    Streaming(Box<Annotation>),
    Scalar(ScalarType),
    Missing,
}

impl Annotation {
    /// A stream of `message`.
    #[must_use]
    pub fn stream(message: &Arc<MessageDescriptor>) -> Self {
        Self::Streaming(Box::new(Self::Message(Arc::clone(message))))
    }

    fn describe(&self) -> String {
        match self {
            Self::Message(m) => m.type_name().to_owned(),
            Self::Streaming(inner) => format!("Streaming[{}]", inner.describe()),
            Self::Scalar(s) => s.wire_tag().to_owned(),
            Self::Missing => "<missing>".to_owned(),
        }
    }
}

impl From<&Arc<MessageDescriptor>> for Annotation {
    fn from(value: &Arc<MessageDescriptor>) -> Self {
        Self::Message(Arc::clone(value))
    }
}

impl From<ScalarType> for Annotation {
    fn from(value: ScalarType) -> Self {
        Self::Scalar(value)
    }
}

impl fmt::Debug for Annotation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

/// Request and response annotations of an RPC method.
#[derive(Debug, Clone)]
pub struct RpcSignature {
    pub request: Annotation,
    pub response: Annotation,
}

impl RpcSignature {
    #[must_use]
    pub fn new(request: impl Into<Annotation>, response: impl Into<Annotation>) -> Self {
        Self {
            request: request.into(),
            response: response.into(),
        }
    }
}

/// Declaration of one RPC method before registration.
#[must_use]
pub struct Rpc {
    name: String,
    signature: RpcSignature,
    pre_processes: Vec<Processor>,
    post_processes: Vec<Processor>,
}

impl Rpc {
    pub fn new(name: impl Into<String>, signature: RpcSignature) -> Self {
        Self {
            name: name.into(),
            signature,
            pre_processes: Vec::new(),
            post_processes: Vec::new(),
        }
    }

    /// Runs on each request after the service's `before_request` hooks.
    pub fn pre_process<F>(mut self, f: F) -> Self
    where
        F: Fn(Message, &CallScope) -> Result<Message, RpcError> + Send + Sync + 'static,
    {
        self.pre_processes.push(processor(f));
        self
    }

    /// Runs on each response before the service's `after_request` hooks.
    pub fn post_process<F>(mut self, f: F) -> Self
    where
        F: Fn(Message, &CallScope) -> Result<Message, RpcError> + Send + Sync + 'static,
    {
        self.post_processes.push(processor(f));
        self
    }
}

/// A registered RPC method.
pub struct RpcDescriptor {
    method_name: String,
    request_type: Arc<MessageDescriptor>,
    response_type: Arc<MessageDescriptor>,
    shape: CallShape,
    handler: Handler,
    pre_processes: Vec<Processor>,
    post_processes: Vec<Processor>,
}

impl RpcDescriptor {
    #[must_use]
    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    #[must_use]
    pub fn request_type(&self) -> &Arc<MessageDescriptor> {
        &self.request_type
    }

    #[must_use]
    pub fn response_type(&self) -> &Arc<MessageDescriptor> {
        &self.response_type
    }

    #[must_use]
    pub fn shape(&self) -> CallShape {
        self.shape
    }

    #[must_use]
    pub fn request_streaming(&self) -> bool {
        self.shape.request_streaming()
    }

    #[must_use]
    pub fn response_streaming(&self) -> bool {
        self.shape.response_streaming()
    }

    #[must_use]
    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    #[must_use]
    pub fn pre_processes(&self) -> &[Processor] {
        &self.pre_processes
    }

    #[must_use]
    pub fn post_processes(&self) -> &[Processor] {
        &self.post_processes
    }
}

impl fmt::Debug for RpcDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcDescriptor")
            .field("method_name", &self.method_name)
            .field("request_type", &self.request_type.type_name())
            .field("response_type", &self.response_type.type_name())
            .field("shape", &self.shape)
            .finish_non_exhaustive()
    }
}

/// A declared service as recorded in the registry.
pub struct ServiceDescriptor {
    service_name: String,
    output_file: String,
    rpcs: RwLock<Vec<Arc<RpcDescriptor>>>,
    before_request: RwLock<Vec<Processor>>,
    after_request: RwLock<Vec<Processor>>,
    wire: RwLock<Option<prost_reflect::ServiceDescriptor>>,
}

impl ServiceDescriptor {
    #[must_use]
    pub fn service_name(&self) -> &str {
        &self.service_name
    }

    #[must_use]
    pub fn output_file(&self) -> &str {
        &self.output_file
    }

    /// `<file>.<Service>`
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.output_file, self.service_name)
    }

    /// Registered methods in registration order.
    #[must_use]
    pub fn rpcs(&self) -> Vec<Arc<RpcDescriptor>> {
        self.rpcs.read().clone()
    }

    #[must_use]
    pub fn rpc(&self, method: &str) -> Option<Arc<RpcDescriptor>> {
        self.rpcs
            .read()
            .iter()
            .find(|r| r.method_name == method)
            .cloned()
    }

    #[must_use]
    pub fn before_request(&self) -> Vec<Processor> {
        self.before_request.read().clone()
    }

    #[must_use]
    pub fn after_request(&self) -> Vec<Processor> {
        self.after_request.read().clone()
    }

    #[must_use]
    pub fn wire_descriptor(&self) -> Option<prost_reflect::ServiceDescriptor> {
        self.wire.read().clone()
    }

    pub(crate) fn bind(&self, wire: prost_reflect::ServiceDescriptor) {
        *self.wire.write() = Some(wire);
    }
}

impl fmt::Debug for ServiceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDescriptor")
            .field("service_name", &self.service_name)
            .field("output_file", &self.output_file)
            .field("rpcs", &*self.rpcs.read())
            .finish_non_exhaustive()
    }
}

/// Declaration handle for a service.
///
/// ```ignore
/// let mut echo = registry.service("Echo")?;
/// echo.register(
///     Rpc::new("Say", RpcSignature::new(&greeting, &greeting)),
///     Handler::unary(|req, _scope| async move { Ok(req) }),
/// )?;
/// ```
pub struct Service {
    registry: SchemaRegistry,
    descriptor: Arc<ServiceDescriptor>,
}

impl Service {
    pub(crate) fn new(
        registry: SchemaRegistry,
        service_name: String,
        output_file: String,
    ) -> Result<Self, SchemaError> {
        check_identifier("service", &service_name)?;
        check_identifier("file", &output_file)?;
        let descriptor = Arc::new(ServiceDescriptor {
            service_name,
            output_file,
            rpcs: RwLock::new(Vec::new()),
            before_request: RwLock::new(Vec::new()),
            after_request: RwLock::new(Vec::new()),
            wire: RwLock::new(None),
        });
        registry.add_service(&descriptor);
        tracing::debug!(
            service = %descriptor.service_name,
            file = %descriptor.output_file,
            "declared service"
        );
        Ok(Self {
            registry,
            descriptor,
        })
    }

    #[must_use]
    pub fn descriptor(&self) -> &Arc<ServiceDescriptor> {
        &self.descriptor
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.descriptor.service_name
    }

    /// Hook run on every request of every method, before method pre-processes.
    pub fn before_request<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Message, &CallScope) -> Result<Message, RpcError> + Send + Sync + 'static,
    {
        self.descriptor.before_request.write().push(processor(f));
        self
    }

    /// Hook run on every response of every method, after method post-processes.
    pub fn after_request<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Message, &CallScope) -> Result<Message, RpcError> + Send + Sync + 'static,
    {
        self.descriptor.after_request.write().push(processor(f));
        self
    }

    /// Validates `rpc` against `handler` and records it.
    ///
    /// # Errors
    /// - [`RegistrationError::InvalidRpcMethod`] when either annotation does not
    ///   resolve to a declared message, streaming is nested, or the handler
    ///   shape does not match the signature.
    /// - [`RegistrationError::DuplicatedRpcMethod`] when this service already
    ///   has a method with the same name.
    pub fn register(
        &mut self,
        rpc: Rpc,
        handler: Handler,
    ) -> Result<Arc<RpcDescriptor>, RegistrationError> {
        let Rpc {
            name,
            signature,
            pre_processes,
            post_processes,
        } = rpc;
        check_identifier("method", &name)?;

        let invalid = |reason: String| RegistrationError::InvalidRpcMethod {
            service: self.descriptor.service_name.clone(),
            method: name.clone(),
            reason,
        };

        let (request_type, request_streaming) =
            resolve_side("request", &signature.request).map_err(&invalid)?;
        let (response_type, response_streaming) =
            resolve_side("response", &signature.response).map_err(&invalid)?;
        let shape = CallShape::from_flags(request_streaming, response_streaming);
        if handler.shape() != shape {
            return Err(invalid(format!(
                "the signature is {shape} but the handler is {}",
                handler.shape()
            )));
        }

        let descriptor = Arc::new(RpcDescriptor {
            method_name: name.clone(),
            request_type,
            response_type,
            shape,
            handler,
            pre_processes,
            post_processes,
        });
        {
            let mut rpcs = self.descriptor.rpcs.write();
            if rpcs.iter().any(|r| r.method_name == name) {
                return Err(RegistrationError::DuplicatedRpcMethod {
                    service: self.descriptor.service_name.clone(),
                    method: name,
                });
            }
            rpcs.push(Arc::clone(&descriptor));
        }

        let imports: BTreeSet<String> = [&descriptor.request_type, &descriptor.response_type]
            .into_iter()
            .map(|m| m.output_file().to_owned())
            .collect();
        self.registry
            .add_imports(&self.descriptor.output_file, imports);

        tracing::debug!(
            service = %self.descriptor.service_name,
            method = %descriptor.method_name,
            shape = %shape,
            "registered rpc method"
        );
        Ok(descriptor)
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Service").field(&self.descriptor).finish()
    }
}

fn resolve_side(
    side: &str,
    annotation: &Annotation,
) -> Result<(Arc<MessageDescriptor>, bool), String> {
    let (inner, streaming) = match annotation {
        Annotation::Streaming(inner) => (inner.as_ref(), true),
        other => (other, false),
    };
    match inner {
        Annotation::Message(m) => Ok((Arc::clone(m), streaming)),
        Annotation::Missing => Err(format!("{side} annotation is missing")),
        Annotation::Streaming(_) => Err(format!(
            "{side} annotation '{}' nests streaming",
            annotation.describe()
        )),
        Annotation::Scalar(_) => Err(format!(
            "{side} annotation '{}' is not a declared message",
            annotation.describe()
        )),
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    fn echo(registry: &SchemaRegistry) -> Arc<MessageDescriptor> {
        registry
            .message("Ping")
            .field_of::<String>("name")
            .register()
            .unwrap()
    }

    fn unary() -> Handler {
        Handler::unary(|req, _| async move { Ok(req) })
    }

    #[test]
    fn call_shape_flags() {
        assert_eq!(CallShape::from_flags(false, false), CallShape::Unary);
        assert_eq!(CallShape::from_flags(true, true), CallShape::Streaming);
        assert!(CallShape::ClientStreaming.request_streaming());
        assert!(!CallShape::ClientStreaming.response_streaming());
    }

    #[test]
    fn registers_method_and_records_imports() {
        let registry = SchemaRegistry::new();
        let ping = echo(&registry);
        let mut service = registry.service("Pinger").unwrap();
        let rpc = service
            .register(Rpc::new("Ping", RpcSignature::new(&ping, &ping)), unary())
            .unwrap();

        assert_eq!(rpc.shape(), CallShape::Unary);
        assert_eq!(service.descriptor().rpcs().len(), 1);
        let file = registry.file("pinger").unwrap();
        assert_eq!(file.services.len(), 1);
        assert!(file.import_files.contains("ping"));
    }

    #[test]
    fn streaming_annotation_selects_shape() {
        let registry = SchemaRegistry::new();
        let ping = echo(&registry);
        let mut service = registry.service("Pinger").unwrap();
        let rpc = service
            .register(
                Rpc::new("Watch", RpcSignature::new(&ping, Annotation::stream(&ping))),
                Handler::server_streaming(|req, _| async move {
                    Ok(futures::stream::iter([Ok(req)]))
                }),
            )
            .unwrap();
        assert!(rpc.response_streaming());
        assert!(!rpc.request_streaming());
    }

    #[test]
    fn rejects_scalar_missing_and_nested_annotations() {
        let registry = SchemaRegistry::new();
        let ping = echo(&registry);
        let mut service = registry.service("Pinger").unwrap();

        let cases = [
            RpcSignature::new(ScalarType::String, &ping),
            RpcSignature::new(&ping, Annotation::Missing),
            RpcSignature::new(
                Annotation::Streaming(Box::new(Annotation::stream(&ping))),
                &ping,
            ),
        ];
        for signature in cases {
            let err = service
                .register(Rpc::new("Bad", signature), unary())
                .unwrap_err();
            assert!(matches!(err, RegistrationError::InvalidRpcMethod { .. }), "{err}");
        }
        assert!(service.descriptor().rpcs().is_empty());
    }

    #[test]
    fn rejects_handler_of_wrong_shape() {
        let registry = SchemaRegistry::new();
        let ping = echo(&registry);
        let mut service = registry.service("Pinger").unwrap();
        let err = service
            .register(
                Rpc::new("Sum", RpcSignature::new(Annotation::stream(&ping), &ping)),
                unary(),
            )
            .unwrap_err();
        assert!(
            matches!(err, RegistrationError::InvalidRpcMethod { ref reason, .. } if reason.contains("client-streaming"))
        );
    }

    #[test]
    fn duplicate_method_is_per_service_instance() {
        let registry = SchemaRegistry::new();
        let ping = echo(&registry);
        let mut first = registry.service("Pinger").unwrap();
        let mut second = registry.service("Pinger").unwrap();

        first
            .register(Rpc::new("Ping", RpcSignature::new(&ping, &ping)), unary())
            .unwrap();
        let err = first
            .register(Rpc::new("Ping", RpcSignature::new(&ping, &ping)), unary())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::DuplicatedRpcMethod { .. }));

        second
            .register(Rpc::new("Ping", RpcSignature::new(&ping, &ping)), unary())
            .unwrap();
    }

    #[test]
    fn invalid_method_name() {
        let registry = SchemaRegistry::new();
        let ping = echo(&registry);
        let mut service = registry.service("Pinger").unwrap();
        let err = service
            .register(Rpc::new("no spaces", RpcSignature::new(&ping, &ping)), unary())
            .unwrap_err();
        assert!(matches!(err, RegistrationError::Schema(SchemaError::InvalidIdentifier { .. })));
        assert!(registry.service("bad.name").is_err());
    }
}
