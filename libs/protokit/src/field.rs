//! Field descriptor model.
//!
//! A field is exactly one of four shapes: a scalar, a reference to another
//! declared message, a repeated element, or a map. The element type of a
//! repeated field and the value type of a map may themselves be scalars or
//! message references; map keys are always scalars.

use std::fmt;
use std::sync::Arc;

use crate::message::MessageDescriptor;

/// Protobuf scalar types supported in declarations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScalarType {
    String,
    Int32,
    Int64,
    UInt32,
    UInt64,
    Float,
    Double,
    Bool,
    Bytes,
}

impl ScalarType {
    /// Wire type tag as written in `.proto` text.
    #[must_use]
    pub const fn wire_tag(self) -> &'static str {
        match self {
            Self::String => "string",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
            Self::UInt32 => "uint32",
            Self::UInt64 => "uint64",
            Self::Float => "float",
            Self::Double => "double",
            Self::Bool => "bool",
            Self::Bytes => "bytes",
        }
    }

    /// Whether this scalar may be used as a map key.
    #[must_use]
    pub const fn is_valid_map_key(self) -> bool {
        !matches!(self, Self::Float | Self::Double | Self::Bytes)
    }
}

impl fmt::Display for ScalarType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_tag())
    }
}

/// Maps a Rust type to its protobuf scalar.
///
/// This is the annotation shorthand: `builder.field_of::<String>("name")`
/// declares a `string name` field without spelling out [`ScalarType`].
pub trait ProtoScalar {
    const SCALAR: ScalarType;
}

macro_rules! proto_scalar {
    ($($ty:ty => $scalar:ident),* $(,)?) => {
        $(impl ProtoScalar for $ty {
            const SCALAR: ScalarType = ScalarType::$scalar;
        })*
    };
}

proto_scalar! {
    String => String,
    i32 => Int32,
    i64 => Int64,
    u32 => UInt32,
    u64 => UInt64,
    f32 => Float,
    f64 => Double,
    bool => Bool,
    Vec<u8> => Bytes,
}

/// Element type of a field: a scalar or a declared message.
#[derive(Clone)]
pub enum FieldType {
    Scalar(ScalarType),
    Message(Arc<MessageDescriptor>),
}

impl FieldType {
    /// Shorthand for a scalar element derived from a Rust type.
    #[must_use]
    pub fn of<T: ProtoScalar>() -> Self {
        Self::Scalar(T::SCALAR)
    }

    /// Shorthand for a message element.
    #[must_use]
    pub fn message(descriptor: &Arc<MessageDescriptor>) -> Self {
        Self::Message(Arc::clone(descriptor))
    }

    /// Type tag: the scalar keyword or the referenced message's type name.
    #[must_use]
    pub fn wire_type_tag(&self) -> &str {
        match self {
            Self::Scalar(s) => s.wire_tag(),
            Self::Message(m) => m.type_name(),
        }
    }

    #[must_use]
    pub fn referenced_message(&self) -> Option<&Arc<MessageDescriptor>> {
        match self {
            Self::Scalar(_) => None,
            Self::Message(m) => Some(m),
        }
    }
}

impl From<ScalarType> for FieldType {
    fn from(value: ScalarType) -> Self {
        Self::Scalar(value)
    }
}

impl From<&Arc<MessageDescriptor>> for FieldType {
    fn from(value: &Arc<MessageDescriptor>) -> Self {
        Self::message(value)
    }
}

impl fmt::Debug for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scalar(s) => write!(f, "Scalar({s})"),
            Self::Message(m) => write!(f, "Message({}/{})", m.output_file(), m.type_name()),
        }
    }
}

/// Shape of a declared field.
#[derive(Debug, Clone)]
pub enum FieldKind {
    Scalar(ScalarType),
    Reference(Arc<MessageDescriptor>),
    Repeated(FieldType),
    Map { key: ScalarType, value: FieldType },
}

impl From<FieldType> for FieldKind {
    fn from(value: FieldType) -> Self {
        match value {
            FieldType::Scalar(s) => Self::Scalar(s),
            FieldType::Message(m) => Self::Reference(m),
        }
    }
}

impl From<ScalarType> for FieldKind {
    fn from(value: ScalarType) -> Self {
        Self::Scalar(value)
    }
}

impl From<&Arc<MessageDescriptor>> for FieldKind {
    fn from(value: &Arc<MessageDescriptor>) -> Self {
        Self::Reference(Arc::clone(value))
    }
}

/// One attribute of a declared message.
#[derive(Debug, Clone)]
pub struct FieldDescriptor {
    name: String,
    kind: FieldKind,
}

impl FieldDescriptor {
    #[must_use]
    pub fn new(name: impl Into<String>, kind: impl Into<FieldKind>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
        }
    }

    #[must_use]
    pub fn declared_name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> &FieldKind {
        &self.kind
    }

    /// For scalars and references the element tag; for repeated fields the
    /// element tag; for maps the key tag.
    #[must_use]
    pub fn wire_type_tag(&self) -> &str {
        match &self.kind {
            FieldKind::Scalar(s) | FieldKind::Map { key: s, .. } => s.wire_tag(),
            FieldKind::Reference(m) => m.type_name(),
            FieldKind::Repeated(element) => element.wire_type_tag(),
        }
    }

    #[must_use]
    pub fn is_reference(&self) -> bool {
        matches!(self.kind, FieldKind::Reference(_))
    }

    #[must_use]
    pub fn is_repeated(&self) -> bool {
        matches!(self.kind, FieldKind::Repeated(_))
    }

    #[must_use]
    pub fn is_map(&self) -> bool {
        matches!(self.kind, FieldKind::Map { .. })
    }

    /// Message this field points at, through a reference, a repeated element
    /// or a map value.
    #[must_use]
    pub fn referenced_message(&self) -> Option<&Arc<MessageDescriptor>> {
        match &self.kind {
            FieldKind::Scalar(_) => None,
            FieldKind::Reference(m) => Some(m),
            FieldKind::Repeated(element) => element.referenced_message(),
            FieldKind::Map { value, .. } => value.referenced_message(),
        }
    }

    /// Value type of a map field.
    #[must_use]
    pub fn value_type(&self) -> Option<&FieldType> {
        match &self.kind {
            FieldKind::Map { value, .. } => Some(value),
            _ => None,
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn rust_types_map_to_scalars() {
        assert_eq!(<String as ProtoScalar>::SCALAR, ScalarType::String);
        assert_eq!(<i32 as ProtoScalar>::SCALAR, ScalarType::Int32);
        assert_eq!(<f64 as ProtoScalar>::SCALAR, ScalarType::Double);
        assert_eq!(<Vec<u8> as ProtoScalar>::SCALAR, ScalarType::Bytes);
        assert_eq!(FieldType::of::<bool>().wire_type_tag(), "bool");
    }

    #[test]
    fn map_key_restrictions() {
        assert!(ScalarType::String.is_valid_map_key());
        assert!(ScalarType::Int64.is_valid_map_key());
        assert!(ScalarType::Bool.is_valid_map_key());
        assert!(!ScalarType::Double.is_valid_map_key());
        assert!(!ScalarType::Bytes.is_valid_map_key());
    }

    #[test]
    fn field_shape_flags_are_exclusive() {
        let scalar = FieldDescriptor::new("name", ScalarType::String);
        assert!(!scalar.is_reference() && !scalar.is_repeated() && !scalar.is_map());
        assert_eq!(scalar.wire_type_tag(), "string");

        let repeated = FieldDescriptor::new("ids", FieldKind::Repeated(FieldType::of::<i64>()));
        assert!(repeated.is_repeated());
        assert!(!repeated.is_map());
        assert_eq!(repeated.wire_type_tag(), "int64");
        assert!(repeated.referenced_message().is_none());

        let map = FieldDescriptor::new(
            "counts",
            FieldKind::Map {
                key: ScalarType::String,
                value: FieldType::of::<u32>(),
            },
        );
        assert!(map.is_map());
        assert_eq!(map.value_type().map(FieldType::wire_type_tag), Some("uint32"));
    }
}
