//! Sample declarations served by the demo: one service covering every call shape.

use std::sync::Arc;

use futures::StreamExt;
use protokit::{
    Annotation, Handler, Message, MessageDescriptor, Rpc, RpcError, RpcSignature, SchemaRegistry,
    Service,
};

pub struct EchoApi {
    pub greeting: Arc<MessageDescriptor>,
    pub number: Arc<MessageDescriptor>,
    pub service: Service,
}

/// Declares `Greeting`, `Number` and the `Echo` service on `registry`.
pub fn declare(registry: &SchemaRegistry) -> anyhow::Result<EchoApi> {
    let greeting = registry
        .message("Greeting")
        .field_of::<String>("text")
        .register()?;
    let number = registry
        .message("Number")
        .field_of::<i64>("value")
        .register()?;

    let mut service = registry.service("Echo")?;
    service.before_request(|message, call| {
        tracing::debug!(method = call.method().method_name(), "request received");
        Ok(message)
    });

    service.register(
        Rpc::new("Say", RpcSignature::new(&greeting, &greeting)),
        Handler::unary(|request, _| async move { Ok(request) }),
    )?;

    let shout = Rpc::new("Shout", RpcSignature::new(&greeting, &greeting))
        .pre_process(|mut message, _| -> Result<Message, RpcError> {
            let text = message.get::<String>("text")?;
            message.set("text", text.to_uppercase())?;
            Ok(message)
        })
        .post_process(|mut message, _| -> Result<Message, RpcError> {
            let text = message.get::<String>("text")?;
            message.set("text", format!("{text}!"))?;
            Ok(message)
        });
    service.register(
        shout,
        Handler::unary(|request, _| async move { Ok(request) }),
    )?;

    service.register(
        Rpc::new("Countdown", RpcSignature::new(&number, Annotation::stream(&number))),
        Handler::server_streaming(|request, _| async move {
            let from = request.get::<i64>("value")?;
            let descriptor = Arc::clone(request.descriptor());
            Ok(futures::stream::iter((1..=from).rev()).map(
                move |n| -> Result<Message, RpcError> { Ok(Message::new(&descriptor)?.with("value", n)?) },
            ))
        }),
    )?;

    service.register(
        Rpc::new("Sum", RpcSignature::new(Annotation::stream(&number), &number)),
        Handler::client_streaming(|mut requests, call| async move {
            let mut total = 0_i64;
            while let Some(item) = requests.next().await {
                total += item?.get::<i64>("value")?;
            }
            Ok(Message::new(call.method().response_type())?.with("value", total)?)
        }),
    )?;

    service.register(
        Rpc::new(
            "Chat",
            RpcSignature::new(Annotation::stream(&greeting), Annotation::stream(&greeting)),
        ),
        Handler::streaming(|requests, _| async move {
            Ok(requests.map(|item| -> Result<Message, RpcError> {
                let mut item = item?;
                let text = item.get::<String>("text")?;
                item.set("text", format!("you said: {text}"))?;
                Ok(item)
            }))
        }),
    )?;

    Ok(EchoApi {
        greeting,
        number,
        service,
    })
}
