#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Transport glue over an in-memory bound server, in-process and over TCP.

use protokit::testing::{bind_in_memory, request};
use protokit::{
    Handler, Message, ProtokitConfig, Rpc, RpcSignature, SchemaRegistry, Server, scope,
};
use protokit_transport_grpc::{
    GrpcMethod, GrpcRouter, METHOD_METADATA_KEY, WireCodec, extract_method_metadata, route_path,
    serve_listener,
};
use tonic::codegen::{Service as _, http};
use tonic::server::UnaryService as _;

fn echo_server() -> (Server, std::sync::Arc<protokit::MessageDescriptor>) {
    let registry = SchemaRegistry::new();
    let greeting = registry
        .message("Greeting")
        .field_of::<String>("text")
        .register()
        .unwrap();
    let mut echo = registry.service("Echo").unwrap();
    echo.register(
        Rpc::new("Say", RpcSignature::new(&greeting, &greeting)),
        Handler::unary(|request, _| async move {
            // The served path travels in the scope metadata.
            let path = scope::current()
                .map(|call| extract_method_metadata(call.metadata()))
                .transpose()?
                .unwrap_or_default();
            Ok(Message::new(request.descriptor())?.with("text", path)?)
        }),
    )
    .unwrap();

    let mut server = Server::new(registry.clone(), ProtokitConfig::default());
    server.add_service(&echo);
    server.bind_pool(bind_in_memory(&registry).unwrap()).unwrap();
    (server, greeting)
}

#[test]
fn router_lists_every_bound_method() {
    let (server, _) = echo_server();
    let router = GrpcRouter::new(&server);
    assert_eq!(router.paths(), [route_path("echo", "Echo", "Say")]);
    assert!(router.route("/echo.Echo/Say").is_some());
}

#[tokio::test]
async fn unary_service_tags_request_with_method_path() {
    let (server, greeting) = echo_server();
    let mut method = GrpcMethod::new(server.method("Echo", "Say").unwrap());

    let hello = Message::new(&greeting).unwrap().with("text", "hi").unwrap();
    let response = method.call(request(hello)).await.unwrap();
    let text = Message::from_wire(&greeting, response.into_inner())
        .unwrap()
        .get::<String>("text")
        .unwrap();
    assert_eq!(text, "/echo.Echo/Say");
    assert_eq!(METHOD_METADATA_KEY, "x-protokit-method");
}

#[tokio::test]
async fn unknown_path_answers_unimplemented() {
    let (server, _) = echo_server();
    let mut router = GrpcRouter::new(&server);

    let req = http::Request::builder()
        .uri("/echo.Echo/Missing")
        .body(tonic::body::Body::default())
        .unwrap();
    let response = router.call(req).await.unwrap();
    assert_eq!(response.headers()["grpc-status"], "12");
}

#[tokio::test]
async fn served_router_answers_over_tcp_and_stops_on_shutdown() {
    let (server, greeting) = echo_server();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop, stopped) = tokio::sync::oneshot::channel::<()>();
    let serving = tokio::spawn(serve_listener(
        GrpcRouter::new(&server),
        listener,
        async move {
            let _ = stopped.await;
        },
    ));

    let channel = tonic::transport::Endpoint::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let mut client = tonic::client::Grpc::new(channel);
    client.ready().await.unwrap();

    let hello = Message::new(&greeting).unwrap().with("text", "hi").unwrap();
    let codec = WireCodec::new(greeting.wire_descriptor().unwrap());
    let response = client
        .unary(
            request(hello),
            http::uri::PathAndQuery::from_static("/echo.Echo/Say"),
            codec,
        )
        .await
        .unwrap();
    let text = Message::from_wire(&greeting, response.into_inner())
        .unwrap()
        .get::<String>("text")
        .unwrap();
    assert_eq!(text, "/echo.Echo/Say");

    drop(client);
    stop.send(()).unwrap();
    serving.await.unwrap().unwrap();
}
