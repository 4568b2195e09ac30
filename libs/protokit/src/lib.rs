#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Declarative protobuf schemas and RPC dispatch.
//!
//! Application code declares messages and services through builders on a
//! [`SchemaRegistry`]. At startup a [`Server`] renders the declarations to
//! `.proto` text, compiles them with `protoc`, binds the compiled wire types
//! back onto the declarations and hands out [`MethodHandle`]s that run the
//! decode, process, handle, encode pipeline for each call shape.
//!
//! ```ignore
//! let registry = SchemaRegistry::new();
//! let greeting = registry.message("Greeting").field_of::<String>("name").register()?;
//!
//! let mut echo = registry.service("Echo")?;
//! echo.register(
//!     Rpc::new("Say", RpcSignature::new(&greeting, &greeting)),
//!     Handler::unary(|request, _scope| async move { Ok(request) }),
//! )?;
//!
//! let mut server = Server::new(registry, ProtokitConfig::load(None)?);
//! server.add_service(&echo);
//! server.start()?;
//! ```

pub mod binder;
pub mod compiler;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod field;
pub mod message;
mod naming;
pub mod registry;
pub mod render;
pub mod scope;
pub mod server;
pub mod service;
pub mod testing;

pub use compiler::{ProtocCompiler, SchemaCompiler};
pub use config::{CodegenConfig, ConfigError, LoggingConfig, ProtokitConfig, ServerConfig};
pub use dispatch::{ExceptionHandler, MethodHandle, ReRaise, WireStream};
pub use error::{
    CodegenError, MessageError, RegistrationError, RpcError, SchemaError, ServerError,
};
pub use field::{FieldDescriptor, FieldKind, FieldType, ProtoScalar, ScalarType};
pub use message::{FromFieldValue, IntoFieldValue, Message, MessageBuilder, MessageDescriptor};
pub use registry::{FileMetadata, SchemaRegistry};
pub use scope::{CallScope, ScopeError};
pub use server::Server;
pub use service::{
    Annotation, CallShape, Handler, MessageStream, Processor, Rpc, RpcDescriptor, RpcSignature,
    Service, ServiceDescriptor,
};

pub use prost_reflect::{DynamicMessage, Value};
