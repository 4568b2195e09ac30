//! tonic server glue: per-method services and a path router.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use prost_reflect::DynamicMessage;
use tonic::codegen::{Body, StdError, http};
use tonic::server::{
    ClientStreamingService, Grpc, ServerStreamingService, StreamingService, UnaryService,
};
use tonic::service::Routes;
use tonic::{Code, Request, Response, Status, Streaming};

use protokit::{CallShape, MethodHandle, Server, WireStream};

use crate::attach_method_metadata;
use crate::codec::WireCodec;

/// One registered method seen through tonic's server traits.
#[derive(Clone, Debug)]
pub struct GrpcMethod {
    handle: MethodHandle,
}

impl GrpcMethod {
    #[must_use]
    pub fn new(handle: MethodHandle) -> Self {
        Self { handle }
    }

    #[must_use]
    pub fn handle(&self) -> &MethodHandle {
        &self.handle
    }

    fn tag<T>(&self, request: &mut Request<T>) -> Result<(), Status> {
        attach_method_metadata(request.metadata_mut(), &self.handle.path())
    }
}

impl UnaryService<DynamicMessage> for GrpcMethod {
    type Response = DynamicMessage;
    type Future = BoxFuture<'static, Result<Response<DynamicMessage>, Status>>;

    fn call(&mut self, mut request: Request<DynamicMessage>) -> Self::Future {
        let handle = self.handle.clone();
        let tagged = self.tag(&mut request);
        Box::pin(async move {
            tagged?;
            handle.call_unary(request).await
        })
    }
}

impl ServerStreamingService<DynamicMessage> for GrpcMethod {
    type Response = DynamicMessage;
    type ResponseStream = WireStream;
    type Future = BoxFuture<'static, Result<Response<WireStream>, Status>>;

    fn call(&mut self, mut request: Request<DynamicMessage>) -> Self::Future {
        let handle = self.handle.clone();
        let tagged = self.tag(&mut request);
        Box::pin(async move {
            tagged?;
            handle.call_server_streaming(request).await
        })
    }
}

impl ClientStreamingService<DynamicMessage> for GrpcMethod {
    type Response = DynamicMessage;
    type Future = BoxFuture<'static, Result<Response<DynamicMessage>, Status>>;

    fn call(&mut self, mut request: Request<Streaming<DynamicMessage>>) -> Self::Future {
        let handle = self.handle.clone();
        let tagged = self.tag(&mut request);
        Box::pin(async move {
            tagged?;
            handle.call_client_streaming(request).await
        })
    }
}

impl StreamingService<DynamicMessage> for GrpcMethod {
    type Response = DynamicMessage;
    type ResponseStream = WireStream;
    type Future = BoxFuture<'static, Result<Response<WireStream>, Status>>;

    fn call(&mut self, mut request: Request<Streaming<DynamicMessage>>) -> Self::Future {
        let handle = self.handle.clone();
        let tagged = self.tag(&mut request);
        Box::pin(async move {
            tagged?;
            handle.call_streaming(request).await
        })
    }
}

/// Routes HTTP/2 gRPC requests to the methods of a bound [`Server`] by path.
#[derive(Clone, Debug, Default)]
pub struct GrpcRouter {
    routes: Arc<HashMap<String, MethodHandle>>,
}

impl GrpcRouter {
    /// Collects every method of `server`. Call after the server is bound.
    #[must_use]
    pub fn new(server: &Server) -> Self {
        let routes = server
            .methods()
            .into_iter()
            .map(|handle| (handle.path(), handle))
            .collect();
        Self {
            routes: Arc::new(routes),
        }
    }

    #[must_use]
    pub fn route(&self, path: &str) -> Option<&MethodHandle> {
        self.routes.get(path)
    }

    /// Registered paths, sorted.
    #[must_use]
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.routes.keys().map(String::as_str).collect();
        paths.sort_unstable();
        paths
    }

    /// Routes for `tonic::transport::Server::add_routes`. Paths are only known at
    /// runtime, so the router sits behind the fallback instead of a `NamedService`.
    #[must_use]
    pub fn into_routes(self) -> Routes {
        Routes::from(axum::Router::new().fallback_service(self))
    }
}

impl<B> tonic::codegen::Service<http::Request<B>> for GrpcRouter
where
    B: Body + Send + 'static,
    B::Error: Into<StdError> + Send + 'static,
{
    type Response = http::Response<tonic::body::Body>;
    type Error = Infallible;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<B>) -> Self::Future {
        let Some(handle) = self.routes.get(req.uri().path()).cloned() else {
            tracing::debug!(path = %req.uri().path(), "no route for gRPC path");
            return Box::pin(async { Ok(status_response(Code::Unimplemented)) });
        };
        Box::pin(async move {
            let codec = match WireCodec::for_method(&handle) {
                Ok(codec) => codec,
                Err(status) => {
                    tracing::error!(path = %handle.path(), error = %status.message(), "method is not bound");
                    return Ok(status_response(status.code()));
                }
            };
            let mut grpc = Grpc::new(codec);
            let shape = handle.shape();
            let method = GrpcMethod::new(handle);
            let response = match shape {
                CallShape::Unary => grpc.unary(method, req).await,
                CallShape::ServerStreaming => grpc.server_streaming(method, req).await,
                CallShape::ClientStreaming => grpc.client_streaming(method, req).await,
                CallShape::Streaming => grpc.streaming(method, req).await,
            };
            Ok(response)
        })
    }
}

fn status_response(code: Code) -> http::Response<tonic::body::Body> {
    let mut response = http::Response::new(tonic::body::Body::default());
    let headers = response.headers_mut();
    headers.insert(Status::GRPC_STATUS, (code as i32).into());
    headers.insert(
        http::header::CONTENT_TYPE,
        tonic::metadata::GRPC_CONTENT_TYPE,
    );
    response
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn status_response_carries_grpc_headers() {
        let response = status_response(Code::Unimplemented);
        let headers = response.headers();
        assert_eq!(headers[Status::GRPC_STATUS], "12");
        assert_eq!(headers[http::header::CONTENT_TYPE], "application/grpc");
    }

    #[test]
    fn empty_router_has_no_paths() {
        let router = GrpcRouter::default();
        assert!(router.paths().is_empty());
        assert!(router.route("/echo.Echo/Say").is_none());
    }
}
