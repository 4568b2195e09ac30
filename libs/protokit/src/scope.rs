//! Per-call context scope.
//!
//! Every dispatch runs inside a [`CallScope`] layer pushed onto a task-local
//! stack. Layers are pushed around each poll of the call's future or
//! response stream and popped before the poll returns, so a scope never
//! outlives the work it belongs to and never leaks into another task.

use std::cell::RefCell;
use std::fmt;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use futures::stream::BoxStream;
use prost_reflect::DynamicMessage;
use tonic::metadata::MetadataMap;

use crate::service::{RpcDescriptor, ServiceDescriptor};

tokio::task_local! {
    static SCOPES: RefCell<ScopeStack>;
}

/// Context of one in-flight RPC.
pub struct CallScope {
    service: Arc<ServiceDescriptor>,
    method: Arc<RpcDescriptor>,
    request: Option<DynamicMessage>,
    metadata: MetadataMap,
    remote_addr: Option<SocketAddr>,
}

impl CallScope {
    #[must_use]
    pub fn new(
        service: Arc<ServiceDescriptor>,
        method: Arc<RpcDescriptor>,
        request: Option<DynamicMessage>,
        metadata: MetadataMap,
        remote_addr: Option<SocketAddr>,
    ) -> Self {
        Self {
            service,
            method,
            request,
            metadata,
            remote_addr,
        }
    }

    #[must_use]
    pub fn service(&self) -> &Arc<ServiceDescriptor> {
        &self.service
    }

    #[must_use]
    pub fn method(&self) -> &Arc<RpcDescriptor> {
        &self.method
    }

    /// The incoming request for calls with a single request; `None` for
    /// client-streaming and bidirectional calls.
    #[must_use]
    pub fn request(&self) -> Option<&DynamicMessage> {
        self.request.as_ref()
    }

    #[must_use]
    pub fn metadata(&self) -> &MetadataMap {
        &self.metadata
    }

    #[must_use]
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }
}

impl fmt::Debug for CallScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallScope")
            .field("service", &self.service.service_name())
            .field("method", &self.method.method_name())
            .field("remote_addr", &self.remote_addr)
            .finish_non_exhaustive()
    }
}

/// Scope stack misuse.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScopeError {
    #[error("scope layer {token} is not the topmost layer (top is {top})")]
    NotTopmost { token: u64, top: u64 },

    #[error("scope stack is empty")]
    Empty,
}

/// Handle identifying one pushed layer.
#[derive(Debug, PartialEq, Eq)]
#[must_use = "a pushed scope layer must be popped with its token"]
pub struct ScopeToken(u64);

/// LIFO stack of active call scopes.
#[derive(Debug, Default)]
pub struct ScopeStack {
    layers: Vec<(u64, Arc<CallScope>)>,
    next: u64,
}

impl ScopeStack {
    pub fn push(&mut self, scope: Arc<CallScope>) -> ScopeToken {
        let id = self.next;
        self.next += 1;
        self.layers.push((id, scope));
        ScopeToken(id)
    }

    /// Pops the topmost layer, which must be the one `token` refers to.
    ///
    /// # Errors
    /// - [`ScopeError::Empty`] when nothing is pushed.
    /// - [`ScopeError::NotTopmost`] when another layer sits above `token`.
    pub fn pop(&mut self, token: ScopeToken) -> Result<Arc<CallScope>, ScopeError> {
        match self.layers.last() {
            None => Err(ScopeError::Empty),
            Some((top, _)) if *top != token.0 => Err(ScopeError::NotTopmost {
                token: token.0,
                top: *top,
            }),
            Some(_) => self.layers.pop().map(|(_, s)| s).ok_or(ScopeError::Empty),
        }
    }

    #[must_use]
    pub fn top(&self) -> Option<Arc<CallScope>> {
        self.layers.last().map(|(_, s)| Arc::clone(s))
    }

    #[must_use]
    pub fn depth(&self) -> usize {
        self.layers.len()
    }
}

/// Pops its layer on drop, on every exit path.
struct ScopeGuard {
    token: Option<ScopeToken>,
}

impl ScopeGuard {
    fn push(scope: Arc<CallScope>) -> Self {
        let token = SCOPES.with(|stack| stack.borrow_mut().push(scope));
        Self { token: Some(token) }
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        let Some(token) = self.token.take() else {
            return;
        };
        let popped = SCOPES
            .try_with(|stack| stack.borrow_mut().pop(token))
            .unwrap_or(Err(ScopeError::Empty));
        if let Err(err) = popped {
            tracing::error!(error = %err, "call scope stack corrupted");
            if !std::thread::panicking() {
                panic!("call scope stack corrupted: {err}");
            }
        }
    }
}

/// Innermost active call scope on this task.
#[must_use]
pub fn current() -> Option<Arc<CallScope>> {
    SCOPES.try_with(|stack| stack.borrow().top()).ok().flatten()
}

/// Number of active layers on this task; 0 outside any call.
#[must_use]
pub fn depth() -> usize {
    SCOPES.try_with(|stack| stack.borrow().depth()).unwrap_or(0)
}

/// Runs `f` with `scope` pushed as the innermost layer.
pub fn enter_sync<R>(scope: Arc<CallScope>, f: impl FnOnce() -> R) -> R {
    if SCOPES.try_with(|_| ()).is_ok() {
        let _guard = ScopeGuard::push(scope);
        f()
    } else {
        SCOPES.sync_scope(RefCell::new(ScopeStack::default()), || {
            let _guard = ScopeGuard::push(scope);
            f()
        })
    }
}

/// Wraps `future` so that `scope` is active whenever it is polled.
pub fn enter<F: Future>(scope: Arc<CallScope>, future: F) -> Scoped<F> {
    Scoped {
        scope,
        inner: Box::pin(future),
    }
}

/// Future returned by [`enter`].
pub struct Scoped<F> {
    scope: Arc<CallScope>,
    inner: Pin<Box<F>>,
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let scope = Arc::clone(&this.scope);
        enter_sync(scope, || this.inner.as_mut().poll(cx))
    }
}

/// Stream that re-enters its call scope on every poll.
pub struct ScopedStream<T> {
    scope: Arc<CallScope>,
    inner: BoxStream<'static, T>,
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl<T> ScopedStream<T> {
    pub(crate) fn new(
        scope: Arc<CallScope>,
        inner: BoxStream<'static, T>,
        permit: Option<tokio::sync::OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            scope,
            inner,
            _permit: permit,
        }
    }
}

impl<T> Stream for ScopedStream<T> {
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<T>> {
        let this = self.get_mut();
        let scope = Arc::clone(&this.scope);
        enter_sync(scope, || this.inner.as_mut().poll_next(cx))
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::registry::SchemaRegistry;
    use crate::service::{Handler, Rpc, RpcSignature};

    fn scope(method: &str) -> Arc<CallScope> {
        let registry = SchemaRegistry::new();
        let m = registry.message("Item").register().unwrap();
        let mut service = registry.service("Scoped").unwrap();
        let rpc = service
            .register(
                Rpc::new(method, RpcSignature::new(&m, &m)),
                Handler::unary(|req, _| async move { Ok(req) }),
            )
            .unwrap();
        Arc::new(CallScope::new(
            Arc::clone(service.descriptor()),
            rpc,
            None,
            MetadataMap::new(),
            None,
        ))
    }

    #[test]
    fn stack_pops_in_lifo_order() {
        let mut stack = ScopeStack::default();
        let outer = stack.push(scope("Outer"));
        let inner = stack.push(scope("Inner"));
        assert_eq!(stack.depth(), 2);

        let err = stack.pop(outer).unwrap_err();
        assert!(matches!(err, ScopeError::NotTopmost { .. }));

        let popped = stack.pop(inner).unwrap();
        assert_eq!(popped.method().method_name(), "Inner");
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.top().unwrap().method().method_name(), "Outer");
    }

    #[test]
    fn pop_on_empty_stack_fails() {
        let mut stack = ScopeStack::default();
        let token = stack.push(scope("Only"));
        let stale = ScopeToken(token.0);
        stack.pop(token).unwrap();
        assert_eq!(stack.pop(stale).unwrap_err(), ScopeError::Empty);
    }

    #[test]
    fn nothing_is_active_outside_a_call() {
        assert!(current().is_none());
        assert_eq!(depth(), 0);
    }

    #[test]
    fn sync_scopes_nest_and_unwind() {
        enter_sync(scope("Outer"), || {
            assert_eq!(current().unwrap().method().method_name(), "Outer");
            enter_sync(scope("Inner"), || {
                assert_eq!(depth(), 2);
                assert_eq!(current().unwrap().method().method_name(), "Inner");
            });
            assert_eq!(depth(), 1);
            assert_eq!(current().unwrap().method().method_name(), "Outer");
        });
        assert_eq!(depth(), 0);
    }

    #[test]
    fn scope_unwinds_on_panic() {
        let result = std::panic::catch_unwind(|| {
            enter_sync(scope("Boom"), || panic!("handler failed"));
        });
        assert!(result.is_err());
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn scope_is_active_only_while_polled() {
        let observed = enter(scope("Async"), async {
            tokio::task::yield_now().await;
            current().map(|s| s.method().method_name().to_owned())
        })
        .await;
        assert_eq!(observed.as_deref(), Some("Async"));
        assert!(current().is_none());
    }

    #[tokio::test]
    async fn concurrent_tasks_do_not_observe_each_other() {
        let a = tokio::spawn(enter(scope("A"), async {
            tokio::task::yield_now().await;
            current().unwrap().method().method_name().to_owned()
        }));
        let b = tokio::spawn(enter(scope("B"), async {
            tokio::task::yield_now().await;
            current().unwrap().method().method_name().to_owned()
        }));
        assert_eq!(a.await.unwrap(), "A");
        assert_eq!(b.await.unwrap(), "B");
    }

    #[tokio::test]
    async fn streams_reenter_their_scope() {
        use futures::StreamExt;

        let inner = futures::stream::iter(0..3)
            .map(|_| current().map(|s| s.method().method_name().to_owned()))
            .boxed();
        let names: Vec<_> = ScopedStream::new(scope("Stream"), inner, None)
            .collect()
            .await;
        assert!(names.iter().all(|n| n.as_deref() == Some("Stream")));
        assert_eq!(depth(), 0);
    }
}
