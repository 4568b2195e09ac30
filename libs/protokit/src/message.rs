//! Message descriptors, the declaration builder and declared instances.
//!
//! A [`MessageDescriptor`] is created once by [`MessageBuilder::register`] and
//! never changes afterwards, except for the compiled wire type the binder
//! attaches after code generation. A [`Message`] is a declared instance: it
//! owns exactly one wire message and exposes typed field access by name.

use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use prost::Message as _;
use prost::bytes::Bytes;
use prost_reflect::{DynamicMessage, ReflectMessage, SerializeOptions, Value};

use crate::error::{MessageError, SchemaError};
use crate::field::{FieldDescriptor, FieldKind, FieldType, ProtoScalar, ScalarType};
use crate::naming::check_identifier;
use crate::registry::SchemaRegistry;

/// Compile-time description of a declared message type.
pub struct MessageDescriptor {
    type_name: String,
    output_file: String,
    fields: Vec<FieldDescriptor>,
    bases: Vec<Arc<MessageDescriptor>>,
    wire: RwLock<Option<prost_reflect::MessageDescriptor>>,
}

impl MessageDescriptor {
    #[must_use]
    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    #[must_use]
    pub fn output_file(&self) -> &str {
        &self.output_file
    }

    /// Resolved fields: inherited first, then directly declared.
    #[must_use]
    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.declared_name() == name)
    }

    #[must_use]
    pub fn bases(&self) -> &[Arc<MessageDescriptor>] {
        &self.bases
    }

    /// Fully-qualified protobuf name, `<file>.<Type>`.
    #[must_use]
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.output_file, self.type_name)
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.wire.read().is_some()
    }

    /// Compiled wire type attached by the binder.
    ///
    /// # Errors
    /// Returns [`MessageError::Unbound`] before code generation has run.
    pub fn wire_descriptor(&self) -> Result<prost_reflect::MessageDescriptor, MessageError> {
        self.wire
            .read()
            .clone()
            .ok_or_else(|| MessageError::Unbound {
                type_name: self.type_name.clone(),
            })
    }

    /// Attaches the compiled type. Binding again to the same full name is a no-op.
    pub(crate) fn bind(&self, wire: prost_reflect::MessageDescriptor) {
        let mut slot = self.wire.write();
        if let Some(existing) = slot.as_ref() {
            if existing.full_name() == wire.full_name() {
                return;
            }
            tracing::warn!(
                message = %self.type_name,
                previous = existing.full_name(),
                new = wire.full_name(),
                "rebinding message to a different compiled type"
            );
        }
        *slot = Some(wire);
    }
}

impl fmt::Debug for MessageDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageDescriptor")
            .field("type_name", &self.type_name)
            .field("output_file", &self.output_file)
            .field("fields", &self.fields)
            .field(
                "bases",
                &self.bases.iter().map(|b| b.type_name()).collect::<Vec<_>>(),
            )
            .field("bound", &self.is_bound())
            .finish()
    }
}

/// Declares a message type and records it in the registry.
///
/// ```ignore
/// let user = registry.message("User").field_of::<String>("name").register()?;
/// let team = registry
///     .message("Team")
///     .repeated("members", &user)
///     .map("roles", ScalarType::String, ScalarType::Int32)
///     .register()?;
/// ```
#[must_use = "a message is only declared once `register` is called"]
pub struct MessageBuilder<'r> {
    registry: &'r SchemaRegistry,
    type_name: String,
    output_file: Option<String>,
    bases: Vec<Arc<MessageDescriptor>>,
    fields: Vec<FieldDescriptor>,
}

impl<'r> MessageBuilder<'r> {
    pub(crate) fn new(registry: &'r SchemaRegistry, type_name: impl Into<String>) -> Self {
        Self {
            registry,
            type_name: type_name.into(),
            output_file: None,
            bases: Vec::new(),
            fields: Vec::new(),
        }
    }

    /// Overrides the output file (defaults to the lower-cased type name).
    pub fn file(mut self, file: impl Into<String>) -> Self {
        self.output_file = Some(file.into());
        self
    }

    /// Inherits the fields of `base`. Bases are merged in call order.
    pub fn extends(mut self, base: &Arc<MessageDescriptor>) -> Self {
        self.bases.push(Arc::clone(base));
        self
    }

    pub fn field(mut self, name: impl Into<String>, kind: impl Into<FieldKind>) -> Self {
        self.fields.push(FieldDescriptor::new(name, kind));
        self
    }

    /// Scalar field whose type is derived from a Rust type.
    pub fn field_of<T: ProtoScalar>(self, name: impl Into<String>) -> Self {
        self.field(name, T::SCALAR)
    }

    pub fn repeated(self, name: impl Into<String>, element: impl Into<FieldType>) -> Self {
        self.field(name, FieldKind::Repeated(element.into()))
    }

    pub fn map(
        self,
        name: impl Into<String>,
        key: ScalarType,
        value: impl Into<FieldType>,
    ) -> Self {
        self.field(
            name,
            FieldKind::Map {
                key,
                value: value.into(),
            },
        )
    }

    /// Resolves fields and imports and appends the descriptor to its file.
    ///
    /// # Errors
    /// Returns [`SchemaError`] for invalid names, duplicate direct fields or
    /// unsupported map keys.
    pub fn register(self) -> Result<Arc<MessageDescriptor>, SchemaError> {
        check_identifier("message", &self.type_name)?;
        let output_file = self
            .output_file
            .unwrap_or_else(|| self.type_name.to_lowercase());
        check_identifier("file", &output_file)?;

        let fields = merge_fields(&self.type_name, &self.bases, self.fields)?;

        let imports: BTreeSet<String> = fields
            .iter()
            .filter_map(FieldDescriptor::referenced_message)
            .map(|m| m.output_file().to_owned())
            .filter(|file| *file != output_file)
            .collect();

        let descriptor = Arc::new(MessageDescriptor {
            type_name: self.type_name,
            output_file,
            fields,
            bases: self.bases,
            wire: RwLock::new(None),
        });

        tracing::debug!(
            message = %descriptor.type_name,
            file = %descriptor.output_file,
            fields = descriptor.fields.len(),
            imports = imports.len(),
            "declared message"
        );
        self.registry.add_message(&descriptor, imports);
        Ok(descriptor)
    }
}

fn merge_fields(
    type_name: &str,
    bases: &[Arc<MessageDescriptor>],
    direct: Vec<FieldDescriptor>,
) -> Result<Vec<FieldDescriptor>, SchemaError> {
    let mut merged: Vec<FieldDescriptor> = Vec::new();
    for base in bases {
        for field in base.fields() {
            match merged
                .iter_mut()
                .find(|f| f.declared_name() == field.declared_name())
            {
                Some(slot) => *slot = field.clone(),
                None => merged.push(field.clone()),
            }
        }
    }

    let mut seen = HashSet::new();
    for field in direct {
        check_identifier("field", field.declared_name())?;
        if !seen.insert(field.declared_name().to_owned()) {
            return Err(SchemaError::DuplicateField {
                message: type_name.to_owned(),
                field: field.declared_name().to_owned(),
            });
        }
        if let FieldKind::Map { key, .. } = field.kind()
            && !key.is_valid_map_key()
        {
            return Err(SchemaError::InvalidMapKey {
                message: type_name.to_owned(),
                field: field.declared_name().to_owned(),
                key: *key,
            });
        }
        match merged
            .iter_mut()
            .find(|f| f.declared_name() == field.declared_name())
        {
            Some(slot) => *slot = field,
            None => merged.push(field),
        }
    }
    Ok(merged)
}

/// Conversion into a protobuf field value.
pub trait IntoFieldValue {
    fn into_value(self) -> Value;
}

/// Conversion out of a protobuf field value.
pub trait FromFieldValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

macro_rules! field_value {
    ($($ty:ty => $variant:ident, $accessor:ident);* $(;)?) => {
        $(
            impl IntoFieldValue for $ty {
                fn into_value(self) -> Value {
                    Value::$variant(self)
                }
            }

            impl FromFieldValue for $ty {
                fn from_value(value: &Value) -> Option<Self> {
                    value.$accessor()
                }
            }
        )*
    };
}

field_value! {
    i32 => I32, as_i32;
    i64 => I64, as_i64;
    u32 => U32, as_u32;
    u64 => U64, as_u64;
    f32 => F32, as_f32;
    f64 => F64, as_f64;
    bool => Bool, as_bool;
}

impl IntoFieldValue for String {
    fn into_value(self) -> Value {
        Value::String(self)
    }
}

impl IntoFieldValue for &str {
    fn into_value(self) -> Value {
        Value::String(self.to_owned())
    }
}

impl FromFieldValue for String {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_str().map(str::to_owned)
    }
}

impl IntoFieldValue for Vec<u8> {
    fn into_value(self) -> Value {
        Value::Bytes(Bytes::from(self))
    }
}

impl FromFieldValue for Vec<u8> {
    fn from_value(value: &Value) -> Option<Self> {
        value.as_bytes().map(|b| b.to_vec())
    }
}

impl IntoFieldValue for Message {
    fn into_value(self) -> Value {
        Value::Message(self.wire)
    }
}

impl IntoFieldValue for Vec<Message> {
    fn into_value(self) -> Value {
        Value::List(self.into_iter().map(|m| Value::Message(m.wire)).collect())
    }
}

impl IntoFieldValue for Value {
    fn into_value(self) -> Value {
        self
    }
}

/// A declared instance bound to its own wire message.
#[derive(Clone)]
pub struct Message {
    descriptor: Arc<MessageDescriptor>,
    wire: DynamicMessage,
}

impl Message {
    /// Empty instance with every field at its default.
    ///
    /// # Errors
    /// Returns [`MessageError::Unbound`] before code generation has run.
    pub fn new(descriptor: &Arc<MessageDescriptor>) -> Result<Self, MessageError> {
        let wire = DynamicMessage::new(descriptor.wire_descriptor()?);
        Ok(Self {
            descriptor: Arc::clone(descriptor),
            wire,
        })
    }

    /// Wraps an incoming wire message.
    ///
    /// # Errors
    /// Returns [`MessageError::WrongType`] when `wire` is not of the declared type.
    pub fn from_wire(
        descriptor: &Arc<MessageDescriptor>,
        wire: DynamicMessage,
    ) -> Result<Self, MessageError> {
        let expected = descriptor.wire_descriptor()?;
        if wire.descriptor().full_name() != expected.full_name() {
            return Err(MessageError::WrongType {
                expected: expected.full_name().to_owned(),
                actual: wire.descriptor().full_name().to_owned(),
            });
        }
        Ok(Self {
            descriptor: Arc::clone(descriptor),
            wire,
        })
    }

    /// Decodes protobuf bytes into a declared instance.
    ///
    /// # Errors
    /// Returns [`MessageError`] when the type is unbound or the bytes are malformed.
    pub fn decode(descriptor: &Arc<MessageDescriptor>, bytes: &[u8]) -> Result<Self, MessageError> {
        let wire = DynamicMessage::decode(descriptor.wire_descriptor()?, bytes)?;
        Ok(Self {
            descriptor: Arc::clone(descriptor),
            wire,
        })
    }

    #[must_use]
    pub fn descriptor(&self) -> &Arc<MessageDescriptor> {
        &self.descriptor
    }

    #[must_use]
    pub fn wire(&self) -> &DynamicMessage {
        &self.wire
    }

    #[must_use]
    pub fn into_wire(self) -> DynamicMessage {
        self.wire
    }

    #[must_use]
    pub fn encode_to_vec(&self) -> Vec<u8> {
        self.wire.encode_to_vec()
    }

    fn wire_field(&self, name: &str) -> Result<prost_reflect::FieldDescriptor, MessageError> {
        self.wire
            .descriptor()
            .get_field_by_name(name)
            .ok_or_else(|| MessageError::UnknownField {
                type_name: self.descriptor.type_name.clone(),
                field: name.to_owned(),
            })
    }

    /// Raw field value; unset fields read as their default.
    ///
    /// # Errors
    /// Returns [`MessageError::UnknownField`] for undeclared names.
    pub fn get_field(&self, name: &str) -> Result<Value, MessageError> {
        let field = self.wire_field(name)?;
        Ok(self.wire.get_field(&field).into_owned())
    }

    /// # Errors
    /// Returns [`MessageError`] for undeclared names or values of the wrong type.
    pub fn set_field(&mut self, name: &str, value: Value) -> Result<(), MessageError> {
        let field = self.wire_field(name)?;
        self.wire
            .try_set_field(&field, value)
            .map_err(|_| MessageError::TypeMismatch {
                type_name: self.descriptor.type_name.clone(),
                field: name.to_owned(),
            })
    }

    /// Typed read: `msg.get::<String>("name")`.
    ///
    /// # Errors
    /// Returns [`MessageError`] for undeclared names or when `T` does not match.
    pub fn get<T: FromFieldValue>(&self, name: &str) -> Result<T, MessageError> {
        let value = self.get_field(name)?;
        T::from_value(&value).ok_or_else(|| MessageError::TypeMismatch {
            type_name: self.descriptor.type_name.clone(),
            field: name.to_owned(),
        })
    }

    /// # Errors
    /// Returns [`MessageError`] for undeclared names or values of the wrong type.
    pub fn set(&mut self, name: &str, value: impl IntoFieldValue) -> Result<(), MessageError> {
        self.set_field(name, value.into_value())
    }

    /// Builder-style [`Message::set`].
    ///
    /// # Errors
    /// Returns [`MessageError`] for undeclared names or values of the wrong type.
    pub fn with(mut self, name: &str, value: impl IntoFieldValue) -> Result<Self, MessageError> {
        self.set(name, value)?;
        Ok(self)
    }

    /// Reads a reference field as a declared instance of the referenced type.
    ///
    /// # Errors
    /// Returns [`MessageError`] when `name` is not a reference field.
    pub fn get_message(&self, name: &str) -> Result<Message, MessageError> {
        let mismatch = || MessageError::TypeMismatch {
            type_name: self.descriptor.type_name.clone(),
            field: name.to_owned(),
        };
        let declared = self
            .descriptor
            .field(name)
            .ok_or_else(|| MessageError::UnknownField {
                type_name: self.descriptor.type_name.clone(),
                field: name.to_owned(),
            })?;
        let FieldKind::Reference(target) = declared.kind() else {
            return Err(mismatch());
        };
        match self.get_field(name)? {
            Value::Message(wire) => Message::from_wire(target, wire),
            _ => Err(mismatch()),
        }
    }

    /// JSON view with default-valued fields included and proto field names kept.
    ///
    /// # Errors
    /// Returns a serialization error from `serde_json`.
    pub fn to_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        let options = SerializeOptions::new()
            .skip_default_fields(false)
            .use_proto_field_name(true);
        self.wire
            .serialize_with_options(serde_json::value::Serializer, &options)
    }

    /// # Errors
    /// Returns a serialization error from `serde_json`.
    pub fn to_json_string(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(&self.to_json()?)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("type_name", &self.descriptor.type_name)
            .field("wire", &self.wire)
            .finish()
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.descriptor, &other.descriptor) && self.wire == other.wire
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::testing::bind_in_memory;

    #[test]
    fn output_file_defaults_to_lowercase_type_name() {
        let registry = SchemaRegistry::new();
        let m = registry
            .message("EchoRequest")
            .field_of::<String>("name")
            .register()
            .unwrap();
        assert_eq!(m.output_file(), "echorequest");
        assert_eq!(m.full_name(), "echorequest.EchoRequest");

        let custom = registry
            .message("Other")
            .file("shared")
            .register()
            .unwrap();
        assert_eq!(custom.output_file(), "shared");
    }

    #[test]
    fn inherited_fields_come_first_and_direct_fields_override() {
        let registry = SchemaRegistry::new();
        let audit = registry
            .message("Audited")
            .field_of::<i64>("created_at")
            .field_of::<String>("created_by")
            .register()
            .unwrap();
        let named = registry
            .message("Named")
            .field_of::<String>("name")
            .register()
            .unwrap();
        let user = registry
            .message("User")
            .extends(&audit)
            .extends(&named)
            .field_of::<String>("email")
            .field_of::<i32>("created_by")
            .register()
            .unwrap();

        let names: Vec<_> = user.fields().iter().map(FieldDescriptor::declared_name).collect();
        assert_eq!(names, ["created_at", "created_by", "name", "email"]);
        assert_eq!(user.field("created_by").unwrap().wire_type_tag(), "int32");
        assert_eq!(user.bases().len(), 2);
    }

    #[test]
    fn later_base_replaces_earlier_base_in_place() {
        let registry = SchemaRegistry::new();
        let a = registry
            .message("A")
            .field_of::<String>("id")
            .field_of::<String>("label")
            .register()
            .unwrap();
        let b = registry.message("B").field_of::<i64>("id").register().unwrap();
        let c = registry.message("C").extends(&a).extends(&b).register().unwrap();

        let fields: Vec<_> = c
            .fields()
            .iter()
            .map(|f| (f.declared_name(), f.wire_type_tag()))
            .collect();
        assert_eq!(fields, [("id", "int64"), ("label", "string")]);
    }

    #[test]
    fn duplicate_direct_field_is_rejected() {
        let registry = SchemaRegistry::new();
        let err = registry
            .message("Dup")
            .field_of::<String>("x")
            .field_of::<i32>("x")
            .register()
            .unwrap_err();
        assert!(matches!(err, SchemaError::DuplicateField { ref field, .. } if field == "x"));
    }

    #[test]
    fn invalid_names_and_map_keys_are_rejected() {
        let registry = SchemaRegistry::new();
        assert!(matches!(
            registry.message("bad-name").register(),
            Err(SchemaError::InvalidIdentifier { what: "message", .. })
        ));
        assert!(matches!(
            registry.message("Ok").file("a/b").register(),
            Err(SchemaError::InvalidIdentifier { what: "file", .. })
        ));
        assert!(matches!(
            registry
                .message("Weights")
                .map("by_score", ScalarType::Double, ScalarType::String)
                .register(),
            Err(SchemaError::InvalidMapKey { .. })
        ));
        assert!(registry.is_empty());
    }

    #[test]
    fn unbound_message_cannot_be_instantiated() {
        let registry = SchemaRegistry::new();
        let m = registry.message("Lonely").register().unwrap();
        assert!(!m.is_bound());
        assert!(matches!(Message::new(&m), Err(MessageError::Unbound { .. })));
    }

    #[test]
    fn typed_field_access() {
        let registry = SchemaRegistry::new();
        let inner = registry
            .message("Inner")
            .field_of::<i32>("value")
            .register()
            .unwrap();
        let outer = registry
            .message("Outer")
            .field_of::<String>("name")
            .field_of::<Vec<u8>>("blob")
            .field("inner", &inner)
            .register()
            .unwrap();
        bind_in_memory(&registry).unwrap();

        let mut msg = Message::new(&outer).unwrap();
        assert_eq!(msg.get::<String>("name").unwrap(), "");
        msg.set("name", "x").unwrap();
        msg.set("blob", vec![1_u8, 2]).unwrap();
        msg.set("inner", Message::new(&inner).unwrap().with("value", 7).unwrap())
            .unwrap();

        assert_eq!(msg.get::<String>("name").unwrap(), "x");
        assert_eq!(msg.get::<Vec<u8>>("blob").unwrap(), vec![1, 2]);
        assert_eq!(msg.get_message("inner").unwrap().get::<i32>("value").unwrap(), 7);

        assert!(matches!(msg.get::<i32>("name"), Err(MessageError::TypeMismatch { .. })));
        assert!(matches!(msg.set("name", 5), Err(MessageError::TypeMismatch { .. })));
        assert!(matches!(msg.get_field("nope"), Err(MessageError::UnknownField { .. })));
    }

    #[test]
    fn wire_round_trip_and_wrong_type() {
        let registry = SchemaRegistry::new();
        let a = registry.message("Ping").field_of::<u64>("seq").register().unwrap();
        let b = registry.message("Pong").field_of::<u64>("seq").register().unwrap();
        bind_in_memory(&registry).unwrap();

        let ping = Message::new(&a).unwrap().with("seq", 42_u64).unwrap();
        let decoded = Message::decode(&a, &ping.encode_to_vec()).unwrap();
        assert_eq!(decoded, ping);

        let err = Message::from_wire(&b, ping.into_wire()).unwrap_err();
        assert!(matches!(err, MessageError::WrongType { .. }));
    }

    #[test]
    fn json_view_keeps_defaults_and_proto_names() {
        let registry = SchemaRegistry::new();
        let m = registry
            .message("Profile")
            .field_of::<String>("display_name")
            .field_of::<bool>("active")
            .register()
            .unwrap();
        bind_in_memory(&registry).unwrap();

        let msg = Message::new(&m).unwrap().with("display_name", "ada").unwrap();
        let json = msg.to_json().unwrap();
        assert_eq!(json["display_name"], "ada");
        assert_eq!(json["active"], false);
    }
}
