//! RPC dispatch adapter.
//!
//! A [`MethodHandle`] turns one registered method into a transport-facing
//! entry point. Every call runs the same pipeline:
//!
//! 1. decode the wire request into a declared instance
//! 2. push the call scope
//! 3. run the server request processors, the service `before_request`
//!    hooks, then method pre-processes
//! 4. invoke the handler
//! 5. run method post-processes, the service `after_request` hooks, then
//!    the server response processors
//! 6. route any failure to the exception handler
//! 7. encode the response and pop the scope
//!
//! Streaming sides run steps 1, 3 and 5 once per item.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::{self, BoxStream, Stream, StreamExt};
use prost_reflect::DynamicMessage;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tonic::metadata::MetadataMap;
use tonic::{Request, Response, Status};
use tracing::Instrument;

use crate::error::{MessageError, RpcError};
use crate::message::Message;
use crate::scope::{self, CallScope, ScopedStream};
use crate::service::{
    CallShape, ClientStreamingFn, Handler, MessageStream, Processor, RpcDescriptor,
    ServerStreamingFn, ServiceDescriptor, StreamingFn, UnaryFn,
};

/// Outgoing stream of wire responses.
pub type WireStream = BoxStream<'static, Result<DynamicMessage, Status>>;

/// Decides what the caller sees when a call fails.
///
/// Returning `Ok` substitutes a response; returning `Err` fails the call
/// with that status. For streaming responses the substitutes from
/// [`ExceptionHandler::handle_stream`] are the last items of the stream.
pub trait ExceptionHandler: Send + Sync {
    /// # Errors
    /// The status to report to the caller.
    fn handle(&self, error: RpcError, scope: &CallScope) -> Result<Message, Status>;

    /// Substitutes for a failed streaming response, in order. Defaults to the
    /// single response of [`ExceptionHandler::handle`].
    ///
    /// # Errors
    /// The status that ends the stream.
    fn handle_stream(&self, error: RpcError, scope: &CallScope) -> Result<Vec<Message>, Status> {
        self.handle(error, scope).map(|message| vec![message])
    }
}

/// Default handler: converts the error into a status.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReRaise;

impl ExceptionHandler for ReRaise {
    fn handle(&self, error: RpcError, _scope: &CallScope) -> Result<Message, Status> {
        Err(error.into())
    }
}

impl<F> ExceptionHandler for F
where
    F: Fn(RpcError, &CallScope) -> Result<Message, Status> + Send + Sync,
{
    fn handle(&self, error: RpcError, scope: &CallScope) -> Result<Message, Status> {
        self(error, scope)
    }
}

enum Opened {
    Stream(MessageStream),
    Substitute(Vec<Message>),
}

/// Callable entry point for one registered method.
#[derive(Clone)]
pub struct MethodHandle {
    service: Arc<ServiceDescriptor>,
    rpc: Arc<RpcDescriptor>,
    exception_handler: Arc<dyn ExceptionHandler>,
    limiter: Option<Arc<Semaphore>>,
    process_request: Arc<[Processor]>,
    process_response: Arc<[Processor]>,
}

impl MethodHandle {
    #[must_use]
    pub fn new(
        service: Arc<ServiceDescriptor>,
        rpc: Arc<RpcDescriptor>,
        exception_handler: Arc<dyn ExceptionHandler>,
        limiter: Option<Arc<Semaphore>>,
    ) -> Self {
        Self {
            service,
            rpc,
            exception_handler,
            limiter,
            process_request: Arc::from([]),
            process_response: Arc::from([]),
        }
    }

    /// Server-wide processors, run outside the service hooks.
    #[must_use]
    pub fn with_processors(
        mut self,
        process_request: Arc<[Processor]>,
        process_response: Arc<[Processor]>,
    ) -> Self {
        self.process_request = process_request;
        self.process_response = process_response;
        self
    }

    #[must_use]
    pub fn service(&self) -> &Arc<ServiceDescriptor> {
        &self.service
    }

    #[must_use]
    pub fn rpc(&self) -> &Arc<RpcDescriptor> {
        &self.rpc
    }

    #[must_use]
    pub fn shape(&self) -> CallShape {
        self.rpc.shape()
    }

    /// gRPC route: `/<file>.<Service>/<Method>`.
    #[must_use]
    pub fn path(&self) -> String {
        format!("/{}/{}", self.service.full_name(), self.rpc.method_name())
    }

    /// Compiled request type.
    ///
    /// # Errors
    /// Returns [`MessageError::Unbound`] before binding.
    pub fn request_descriptor(&self) -> Result<prost_reflect::MessageDescriptor, MessageError> {
        self.rpc.request_type().wire_descriptor()
    }

    /// Compiled response type.
    ///
    /// # Errors
    /// Returns [`MessageError::Unbound`] before binding.
    pub fn response_descriptor(&self) -> Result<prost_reflect::MessageDescriptor, MessageError> {
        self.rpc.response_type().wire_descriptor()
    }

    /// Single request, single response.
    ///
    /// # Errors
    /// Returns the status chosen by the exception handler, `Unimplemented`
    /// for a method of another shape, or `ResourceExhausted` when the
    /// concurrency limit is reached.
    pub async fn call_unary(
        &self,
        request: Request<DynamicMessage>,
    ) -> Result<Response<DynamicMessage>, Status> {
        let Handler::Unary(handler) = self.rpc.handler() else {
            return Err(self.wrong_shape(CallShape::Unary));
        };
        let _permit = self.acquire()?;
        let (scope, wire) = self.open_single(request);

        let this = self.clone();
        let handler = Arc::clone(handler);
        let call_scope = Arc::clone(&scope);
        let response = scope::enter(scope, async move {
            let result = this.run_unary(&handler, wire, &call_scope).await;
            result.or_else(|err| this.recover(err, &call_scope))
        })
        .instrument(self.span())
        .await?;
        Ok(Response::new(response.into_wire()))
    }

    /// Single request, stream of responses.
    ///
    /// # Errors
    /// See [`MethodHandle::call_unary`]. Failures after the stream has started
    /// are reported in the stream.
    pub async fn call_server_streaming(
        &self,
        request: Request<DynamicMessage>,
    ) -> Result<Response<WireStream>, Status> {
        let Handler::ServerStreaming(handler) = self.rpc.handler() else {
            return Err(self.wrong_shape(CallShape::ServerStreaming));
        };
        let permit = self.acquire()?;
        let (scope, wire) = self.open_single(request);

        let this = self.clone();
        let handler = Arc::clone(handler);
        let call_scope = Arc::clone(&scope);
        let opened = scope::enter(Arc::clone(&scope), async move {
            match this.open_server_stream(&handler, wire, &call_scope).await {
                Ok(responses) => Ok(Opened::Stream(responses)),
                Err(err) => this.recover_stream(err, &call_scope).map(Opened::Substitute),
            }
        })
        .instrument(self.span())
        .await?;
        Ok(Response::new(self.respond(opened, scope, permit)))
    }

    /// Stream of requests, single response.
    ///
    /// # Errors
    /// See [`MethodHandle::call_unary`].
    pub async fn call_client_streaming<S>(
        &self,
        request: Request<S>,
    ) -> Result<Response<DynamicMessage>, Status>
    where
        S: Stream<Item = Result<DynamicMessage, Status>> + Send + 'static,
    {
        let Handler::ClientStreaming(handler) = self.rpc.handler() else {
            return Err(self.wrong_shape(CallShape::ClientStreaming));
        };
        let _permit = self.acquire()?;
        let (scope, incoming) = self.open_stream(request);
        let requests = self.incoming(incoming, Arc::clone(&scope));

        let this = self.clone();
        let handler = Arc::clone(handler);
        let call_scope = Arc::clone(&scope);
        let response = scope::enter(scope, async move {
            let result = this.run_client_streaming(&handler, requests, &call_scope).await;
            result.or_else(|err| this.recover(err, &call_scope))
        })
        .instrument(self.span())
        .await?;
        Ok(Response::new(response.into_wire()))
    }

    /// Stream of requests, stream of responses.
    ///
    /// # Errors
    /// See [`MethodHandle::call_server_streaming`].
    pub async fn call_streaming<S>(&self, request: Request<S>) -> Result<Response<WireStream>, Status>
    where
        S: Stream<Item = Result<DynamicMessage, Status>> + Send + 'static,
    {
        let Handler::Streaming(handler) = self.rpc.handler() else {
            return Err(self.wrong_shape(CallShape::Streaming));
        };
        let permit = self.acquire()?;
        let (scope, incoming) = self.open_stream(request);
        let requests = self.incoming(incoming, Arc::clone(&scope));

        let this = self.clone();
        let handler = Arc::clone(handler);
        let call_scope = Arc::clone(&scope);
        let opened = scope::enter(Arc::clone(&scope), async move {
            match this.open_streaming(&handler, requests, &call_scope).await {
                Ok(responses) => Ok(Opened::Stream(responses)),
                Err(err) => this.recover_stream(err, &call_scope).map(Opened::Substitute),
            }
        })
        .instrument(self.span())
        .await?;
        Ok(Response::new(self.respond(opened, scope, permit)))
    }

    async fn run_unary(
        &self,
        handler: &UnaryFn,
        wire: DynamicMessage,
        scope: &Arc<CallScope>,
    ) -> Result<Message, RpcError> {
        let request = self.pre_process(self.decode(wire)?, scope)?;
        let response = handler(request, Arc::clone(scope)).await?;
        self.post_process(response, scope)
    }

    async fn open_server_stream(
        &self,
        handler: &ServerStreamingFn,
        wire: DynamicMessage,
        scope: &Arc<CallScope>,
    ) -> Result<MessageStream, RpcError> {
        let request = self.pre_process(self.decode(wire)?, scope)?;
        handler(request, Arc::clone(scope)).await
    }

    async fn run_client_streaming(
        &self,
        handler: &ClientStreamingFn,
        requests: MessageStream,
        scope: &Arc<CallScope>,
    ) -> Result<Message, RpcError> {
        let response = handler(requests, Arc::clone(scope)).await?;
        self.post_process(response, scope)
    }

    async fn open_streaming(
        &self,
        handler: &StreamingFn,
        requests: MessageStream,
        scope: &Arc<CallScope>,
    ) -> Result<MessageStream, RpcError> {
        handler(requests, Arc::clone(scope)).await
    }

    fn open_single(&self, request: Request<DynamicMessage>) -> (Arc<CallScope>, DynamicMessage) {
        let remote_addr = request.remote_addr();
        let (metadata, _, wire) = request.into_parts();
        let scope = self.scope(metadata, remote_addr, Some(wire.clone()));
        (scope, wire)
    }

    fn open_stream<S>(&self, request: Request<S>) -> (Arc<CallScope>, S) {
        let remote_addr = request.remote_addr();
        let (metadata, _, incoming) = request.into_parts();
        (self.scope(metadata, remote_addr, None), incoming)
    }

    fn scope(
        &self,
        metadata: MetadataMap,
        remote_addr: Option<SocketAddr>,
        request: Option<DynamicMessage>,
    ) -> Arc<CallScope> {
        Arc::new(CallScope::new(
            Arc::clone(&self.service),
            Arc::clone(&self.rpc),
            request,
            metadata,
            remote_addr,
        ))
    }

    /// Decodes and pre-processes each incoming item lazily.
    fn incoming<S>(&self, incoming: S, scope: Arc<CallScope>) -> MessageStream
    where
        S: Stream<Item = Result<DynamicMessage, Status>> + Send + 'static,
    {
        let this = self.clone();
        incoming
            .map(move |item| -> Result<Message, RpcError> {
                let message = this.decode(item?)?;
                this.pre_process(message, &scope)
            })
            .boxed()
    }

    /// Post-processes each outgoing item. The first failure is routed to the
    /// exception handler; its substitutes end the stream.
    fn respond(
        &self,
        opened: Opened,
        scope: Arc<CallScope>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> WireStream {
        let wire = match opened {
            Opened::Substitute(messages) => {
                stream::iter(messages.into_iter().map(|m| Ok(m.into_wire()))).boxed()
            }
            Opened::Stream(responses) => {
                let this = self.clone();
                let item_scope = Arc::clone(&scope);
                responses
                    .scan(false, move |failed, item| {
                        if *failed {
                            return futures::future::ready(None);
                        }
                        let out = match item.and_then(|m| this.post_process(m, &item_scope)) {
                            Ok(message) => vec![Ok(message.into_wire())],
                            Err(err) => {
                                *failed = true;
                                match this.recover_stream(err, &item_scope) {
                                    Ok(substitutes) => substitutes
                                        .into_iter()
                                        .map(|m| Ok(m.into_wire()))
                                        .collect(),
                                    Err(status) => vec![Err(status)],
                                }
                            }
                        };
                        futures::future::ready(Some(stream::iter(out)))
                    })
                    .flatten()
                    .boxed()
            }
        };
        ScopedStream::new(scope, wire, permit).boxed()
    }

    fn decode(&self, wire: DynamicMessage) -> Result<Message, MessageError> {
        Message::from_wire(self.rpc.request_type(), wire)
    }

    fn pre_process(&self, message: Message, scope: &CallScope) -> Result<Message, RpcError> {
        self.process_request
            .iter()
            .chain(self.service.before_request().iter())
            .chain(self.rpc.pre_processes())
            .try_fold(message, |message, step| step(message, scope))
    }

    fn post_process(&self, message: Message, scope: &CallScope) -> Result<Message, RpcError> {
        let message = self
            .rpc
            .post_processes()
            .iter()
            .chain(self.service.after_request().iter())
            .chain(self.process_response.iter())
            .try_fold(message, |message, step| step(message, scope))?;
        Ok(self.check_response(message)?)
    }

    fn check_response(&self, message: Message) -> Result<Message, MessageError> {
        let expected = self.rpc.response_type();
        if message.descriptor().full_name() == expected.full_name() {
            Ok(message)
        } else {
            Err(MessageError::WrongType {
                expected: expected.full_name(),
                actual: message.descriptor().full_name(),
            })
        }
    }

    fn recover(&self, error: RpcError, scope: &CallScope) -> Result<Message, Status> {
        self.log_failure(&error);
        let recovered = self.exception_handler.handle(error, scope)?;
        self.check_substitute(recovered)
    }

    fn recover_stream(&self, error: RpcError, scope: &CallScope) -> Result<Vec<Message>, Status> {
        self.log_failure(&error);
        self.exception_handler
            .handle_stream(error, scope)?
            .into_iter()
            .map(|message| self.check_substitute(message))
            .collect()
    }

    fn log_failure(&self, error: &RpcError) {
        tracing::error!(
            service = %self.service.full_name(),
            method = %self.rpc.method_name(),
            error = %error,
            "rpc failed"
        );
    }

    fn check_substitute(&self, message: Message) -> Result<Message, Status> {
        self.check_response(message).map_err(|e| {
            tracing::error!(error = %e, "exception handler returned a response of the wrong type");
            Status::internal(e.to_string())
        })
    }

    fn acquire(&self) -> Result<Option<OwnedSemaphorePermit>, Status> {
        let Some(limiter) = &self.limiter else {
            return Ok(None);
        };
        Arc::clone(limiter).try_acquire_owned().map(Some).map_err(|_| {
            tracing::warn!(method = %self.path(), "concurrent rpc limit reached");
            Status::resource_exhausted("too many concurrent rpcs")
        })
    }

    fn wrong_shape(&self, called: CallShape) -> Status {
        Status::unimplemented(format!(
            "method '{}' is {}, not {called}",
            self.path(),
            self.rpc.shape()
        ))
    }

    fn span(&self) -> tracing::Span {
        tracing::debug_span!(
            "rpc",
            service = %self.service.full_name(),
            method = %self.rpc.method_name(),
            shape = %self.rpc.shape(),
        )
    }
}

impl fmt::Debug for MethodHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodHandle")
            .field("path", &self.path())
            .field("shape", &self.rpc.shape())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::message::MessageDescriptor;
    use crate::registry::SchemaRegistry;
    use crate::service::{Annotation, Rpc, RpcSignature, Service};
    use crate::testing::{bind_in_memory, request, request_stream};

    struct Fixture {
        registry: SchemaRegistry,
        item: Arc<MessageDescriptor>,
        service: Service,
    }

    impl Fixture {
        fn new() -> Self {
            let registry = SchemaRegistry::new();
            let item = registry
                .message("Item")
                .field_of::<i32>("value")
                .register()
                .unwrap();
            let service = registry.service("Items").unwrap();
            Self {
                registry,
                item,
                service,
            }
        }

        fn register(&mut self, rpc: Rpc, handler: Handler) -> MethodHandle {
            self.register_limited(rpc, handler, None)
        }

        fn register_limited(
            &mut self,
            rpc: Rpc,
            handler: Handler,
            limiter: Option<Arc<Semaphore>>,
        ) -> MethodHandle {
            let rpc = self.service.register(rpc, handler).unwrap();
            bind_in_memory(&self.registry).unwrap();
            MethodHandle::new(
                Arc::clone(self.service.descriptor()),
                rpc,
                Arc::new(ReRaise),
                limiter,
            )
        }

        fn item(&self, value: i32) -> Message {
            Message::new(&self.item).unwrap().with("value", value).unwrap()
        }

        fn value(&self, wire: DynamicMessage) -> i32 {
            Message::from_wire(&self.item, wire)
                .unwrap()
                .get::<i32>("value")
                .unwrap()
        }
    }

    #[tokio::test]
    async fn wrong_entry_point_is_unimplemented() {
        let mut f = Fixture::new();
        let item = Arc::clone(&f.item);
        let h = f.register(
            Rpc::new("Get", RpcSignature::new(&item, &item)),
            Handler::unary(|req, _| async move { Ok(req) }),
        );

        let err = h.call_server_streaming(request(f.item(1))).await.err().unwrap();
        assert_eq!(err.code(), tonic::Code::Unimplemented);
        assert_eq!(h.path(), "/items.Items/Get");
    }

    #[tokio::test]
    async fn streaming_failure_yields_status_and_ends_stream() {
        let mut f = Fixture::new();
        let item = Arc::clone(&f.item);
        let h = f.register(
            Rpc::new("Count", RpcSignature::new(&item, Annotation::stream(&item))),
            Handler::server_streaming(|req, _| async move {
                let items = [
                    Ok(req.clone()),
                    Err(RpcError::from(Status::aborted("stop"))),
                    Ok(req),
                ];
                Ok(stream::iter(items))
            }),
        );

        let responses: Vec<_> = h
            .call_server_streaming(request(f.item(3)))
            .await
            .unwrap()
            .into_inner()
            .collect()
            .await;
        assert_eq!(responses.len(), 2);
        assert!(responses[0].is_ok());
        assert_eq!(responses[1].as_ref().unwrap_err().code(), tonic::Code::Aborted);
    }

    #[tokio::test]
    async fn bidirectional_calls_process_each_item() {
        let mut f = Fixture::new();
        let item = Arc::clone(&f.item);
        f.service.before_request(|mut m, _| {
            let v = m.get::<i32>("value")?;
            m.set("value", v * 10)?;
            Ok(m)
        });
        let h = f.register(
            Rpc::new(
                "Double",
                RpcSignature::new(Annotation::stream(&item), Annotation::stream(&item)),
            ),
            Handler::streaming(|requests, _| async move {
                Ok(requests.map(|m| -> Result<Message, RpcError> {
                    let mut m = m?;
                    let v = m.get::<i32>("value")?;
                    m.set("value", v * 2)?;
                    Ok(m)
                }))
            }),
        );

        let responses: Vec<_> = h
            .call_streaming(request_stream(vec![f.item(1), f.item(2)]))
            .await
            .unwrap()
            .into_inner()
            .collect()
            .await;
        let values: Vec<i32> = responses.into_iter().map(|r| f.value(r.unwrap())).collect();
        assert_eq!(values, [20, 40]);
    }

    #[tokio::test]
    async fn response_of_wrong_type_is_an_error() {
        let mut f = Fixture::new();
        let item = Arc::clone(&f.item);
        let other = f.registry.message("Other").register().unwrap();
        let h = f.register(
            Rpc::new("Get", RpcSignature::new(&item, &item)),
            Handler::unary(move |_, _| {
                let other = Arc::clone(&other);
                async move { Ok(Message::new(&other)?) }
            }),
        );

        let err = h.call_unary(request(f.item(1))).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::Internal);
    }

    #[tokio::test]
    async fn concurrency_limit_fails_fast() {
        let mut f = Fixture::new();
        let item = Arc::clone(&f.item);
        let limiter = Arc::new(Semaphore::new(1));
        let h = f.register_limited(
            Rpc::new("Get", RpcSignature::new(&item, &item)),
            Handler::unary(|req, _| async move { Ok(req) }),
            Some(Arc::clone(&limiter)),
        );

        let held = Arc::clone(&limiter).try_acquire_owned().unwrap();
        let err = h.call_unary(request(f.item(1))).await.unwrap_err();
        assert_eq!(err.code(), tonic::Code::ResourceExhausted);

        drop(held);
        let ok = h.call_unary(request(f.item(5))).await.unwrap();
        assert_eq!(f.value(ok.into_inner()), 5);
    }
}
