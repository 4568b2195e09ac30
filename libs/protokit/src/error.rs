//! Error taxonomy for declaration, generation and dispatch.

use std::path::PathBuf;

use tonic::Status;

use crate::field::ScalarType;

/// Invalid message declaration.
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("invalid {what} identifier '{name}'")]
    InvalidIdentifier { what: &'static str, name: String },

    #[error("message '{message}' declares field '{field}' more than once")]
    DuplicateField { message: String, field: String },

    #[error("field '{message}.{field}' uses '{key}' as map key; only string, integral and bool keys are allowed")]
    InvalidMapKey {
        message: String,
        field: String,
        key: ScalarType,
    },
}

/// Invalid service or RPC registration. Raised synchronously at declaration.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error(
        "invalid rpc method '{service}.{method}': {reason}; expected a request and a response \
         annotation that resolve to declared messages, optionally wrapped in Streaming"
    )]
    InvalidRpcMethod {
        service: String,
        method: String,
        reason: String,
    },

    #[error("rpc method '{method}' is already registered on service '{service}'")]
    DuplicatedRpcMethod { service: String, method: String },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

/// Startup failure while rendering, compiling or binding. Always fatal.
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("I/O error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("protobuf compiler rejected the generated schema: {source}")]
    Compile {
        #[source]
        source: std::io::Error,
    },

    #[error("invalid descriptor set: {0}")]
    DescriptorDecode(#[from] prost_reflect::DescriptorError),

    #[error("no compiled type for message '{type_name}' declared in file '{file}'")]
    UnboundMessage { file: String, type_name: String },

    #[error("no compiled service '{service}' declared in file '{file}'")]
    UnboundService { file: String, service: String },
}

impl CodegenError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Startup failure of a [`Server`](crate::Server).
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Codegen(#[from] CodegenError),

    #[error(transparent)]
    Listener(anyhow::Error),
}

/// Field access or conversion failure on a declared instance.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("message type '{type_name}' is not bound to a compiled wire type")]
    Unbound { type_name: String },

    #[error("message '{type_name}' has no field '{field}'")]
    UnknownField { type_name: String, field: String },

    #[error("value for field '{type_name}.{field}' has the wrong type")]
    TypeMismatch { type_name: String, field: String },

    #[error("expected message '{expected}', got '{actual}'")]
    WrongType { expected: String, actual: String },

    #[error("failed to decode wire message: {0}")]
    Decode(#[from] prost::DecodeError),
}

/// Error raised by a handler or a pre/post-processing step during a call.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error(transparent)]
    Status(#[from] Status),

    #[error(transparent)]
    Handler(#[from] anyhow::Error),

    #[error(transparent)]
    Message(#[from] MessageError),
}

impl RpcError {
    /// Wraps any application error.
    pub fn handler<E>(error: E) -> Self
    where
        E: Into<anyhow::Error>,
    {
        Self::Handler(error.into())
    }

    /// Downcasts a handler error to a concrete application error type.
    #[must_use]
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: std::fmt::Display + std::fmt::Debug + Send + Sync + 'static,
    {
        match self {
            Self::Handler(e) => e.downcast_ref::<E>(),
            _ => None,
        }
    }
}

impl From<RpcError> for Status {
    fn from(value: RpcError) -> Self {
        match value {
            RpcError::Status(status) => status,
            RpcError::Handler(e) => Status::internal(format!("{e:#}")),
            RpcError::Message(e @ MessageError::TypeMismatch { .. }) => {
                Status::invalid_argument(e.to_string())
            }
            RpcError::Message(e) => Status::internal(e.to_string()),
        }
    }
}
