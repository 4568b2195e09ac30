//! TCP serving of a [`GrpcRouter`] with `tonic::transport`.

use std::future::Future;
use std::net::SocketAddr;

use anyhow::Context as _;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;

use crate::service::GrpcRouter;

/// Binds `addr` and serves `router` until `shutdown` resolves.
///
/// # Errors
/// Returns an error if the address cannot be bound or the transport fails.
pub async fn serve<F>(router: GrpcRouter, addr: SocketAddr, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind gRPC listener on {addr}"))?;
    serve_listener(router, listener, shutdown).await
}

/// Serves `router` on an already bound listener until `shutdown` resolves.
///
/// # Errors
/// Returns an error if the transport fails.
pub async fn serve_listener<F>(
    router: GrpcRouter,
    listener: TcpListener,
    shutdown: F,
) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send,
{
    let bound_addr = listener.local_addr()?;
    tracing::info!(
        %bound_addr,
        transport = "tcp",
        methods = router.paths().len(),
        "gRPC server listening"
    );

    Server::builder()
        .add_routes(router.into_routes())
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await?;

    tracing::info!(%bound_addr, "gRPC server stopped");
    Ok(())
}
