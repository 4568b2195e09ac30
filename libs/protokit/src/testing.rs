//! Test support: compiled descriptors without `protoc`.
//!
//! [`file_descriptor_set`] builds the same `FileDescriptorSet` that compiling
//! the rendered schema would produce, which lets tests and tools bind the
//! registry in memory.

use std::collections::{BTreeMap, BTreeSet};

use prost_reflect::{DescriptorPool, DynamicMessage};
use prost_types::field_descriptor_proto::{Label, Type};
use prost_types::{
    DescriptorProto, FieldDescriptorProto, FileDescriptorProto, FileDescriptorSet,
    MessageOptions, MethodDescriptorProto, ServiceDescriptorProto,
};

use crate::error::CodegenError;
use crate::field::{FieldKind, FieldType, ScalarType};
use crate::message::{Message, MessageDescriptor};
use crate::naming::map_entry_name;
use crate::registry::{FileMetadata, SchemaRegistry};
use crate::service::ServiceDescriptor;

/// Descriptor set for every declared file, dependencies first.
#[must_use]
pub fn file_descriptor_set(registry: &SchemaRegistry) -> FileDescriptorSet {
    let files = registry.snapshot();
    let file = dependency_order(&files)
        .into_iter()
        .filter_map(|name| files.get(name).map(|meta| file_proto(name, meta)))
        .collect();
    FileDescriptorSet { file }
}

/// Builds and binds an in-memory descriptor pool for `registry`.
///
/// # Errors
/// Returns [`CodegenError`] when the pool cannot be built or bound.
pub fn bind_in_memory(registry: &SchemaRegistry) -> Result<DescriptorPool, CodegenError> {
    let pool = DescriptorPool::from_file_descriptor_set(file_descriptor_set(registry))?;
    crate::binder::bind_pool(registry, &pool)?;
    Ok(pool)
}

/// Wraps a declared instance into a transport request.
#[must_use]
pub fn request(message: Message) -> tonic::Request<DynamicMessage> {
    tonic::Request::new(message.into_wire())
}

/// Wraps declared instances into a client request stream.
#[must_use]
pub fn request_stream(
    messages: Vec<Message>,
) -> tonic::Request<futures::stream::Iter<std::vec::IntoIter<Result<DynamicMessage, tonic::Status>>>>
{
    let items: Vec<_> = messages.into_iter().map(|m| Ok(m.into_wire())).collect();
    tonic::Request::new(futures::stream::iter(items))
}

fn dependency_order(files: &BTreeMap<String, FileMetadata>) -> Vec<&str> {
    fn visit<'a>(
        name: &'a str,
        files: &'a BTreeMap<String, FileMetadata>,
        seen: &mut BTreeSet<&'a str>,
        out: &mut Vec<&'a str>,
    ) {
        if !seen.insert(name) {
            return;
        }
        if let Some(meta) = files.get(name) {
            for import in &meta.import_files {
                visit(import, files, seen, out);
            }
        }
        out.push(name);
    }

    let mut seen = BTreeSet::new();
    let mut out = Vec::with_capacity(files.len());
    for name in files.keys() {
        visit(name, files, &mut seen, &mut out);
    }
    out
}

fn file_proto(name: &str, meta: &FileMetadata) -> FileDescriptorProto {
    FileDescriptorProto {
        name: Some(format!("{name}.proto")),
        package: Some(name.to_owned()),
        dependency: meta
            .import_files
            .iter()
            .map(|f| format!("{f}.proto"))
            .collect(),
        message_type: meta.messages.iter().map(|m| message_proto(m)).collect(),
        service: meta.services.iter().map(|s| service_proto(s)).collect(),
        syntax: Some("proto3".to_owned()),
        ..Default::default()
    }
}

fn message_proto(message: &MessageDescriptor) -> DescriptorProto {
    let mut field = Vec::with_capacity(message.fields().len());
    let mut nested_type = Vec::new();

    for (index, f) in message.fields().iter().enumerate() {
        let number = i32::try_from(index + 1).unwrap_or(i32::MAX);
        let name = f.declared_name();
        let proto = match f.kind() {
            FieldKind::Scalar(s) => scalar_field(name, number, *s, Label::Optional),
            FieldKind::Reference(m) => message_field(name, number, &type_path(m), Label::Optional),
            FieldKind::Repeated(element) => element_field(name, number, element, Label::Repeated),
            FieldKind::Map { key, value } => {
                let entry = map_entry_name(name);
                nested_type.push(DescriptorProto {
                    name: Some(entry.clone()),
                    field: vec![
                        scalar_field("key", 1, *key, Label::Optional),
                        element_field("value", 2, value, Label::Optional),
                    ],
                    options: Some(MessageOptions {
                        map_entry: Some(true),
                        ..Default::default()
                    }),
                    ..Default::default()
                });
                let path = format!(".{}.{}", message.full_name(), entry);
                message_field(name, number, &path, Label::Repeated)
            }
        };
        field.push(proto);
    }

    DescriptorProto {
        name: Some(message.type_name().to_owned()),
        field,
        nested_type,
        ..Default::default()
    }
}

fn service_proto(service: &ServiceDescriptor) -> ServiceDescriptorProto {
    ServiceDescriptorProto {
        name: Some(service.service_name().to_owned()),
        method: service
            .rpcs()
            .iter()
            .map(|rpc| MethodDescriptorProto {
                name: Some(rpc.method_name().to_owned()),
                input_type: Some(type_path(rpc.request_type())),
                output_type: Some(type_path(rpc.response_type())),
                client_streaming: Some(rpc.request_streaming()),
                server_streaming: Some(rpc.response_streaming()),
                ..Default::default()
            })
            .collect(),
        ..Default::default()
    }
}

fn element_field(name: &str, number: i32, element: &FieldType, label: Label) -> FieldDescriptorProto {
    match element {
        FieldType::Scalar(s) => scalar_field(name, number, *s, label),
        FieldType::Message(m) => message_field(name, number, &type_path(m), label),
    }
}

fn scalar_field(name: &str, number: i32, scalar: ScalarType, label: Label) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_owned()),
        number: Some(number),
        label: Some(label as i32),
        r#type: Some(scalar_type(scalar) as i32),
        ..Default::default()
    }
}

fn message_field(name: &str, number: i32, path: &str, label: Label) -> FieldDescriptorProto {
    FieldDescriptorProto {
        name: Some(name.to_owned()),
        number: Some(number),
        label: Some(label as i32),
        r#type: Some(Type::Message as i32),
        type_name: Some(path.to_owned()),
        ..Default::default()
    }
}

fn type_path(message: &MessageDescriptor) -> String {
    format!(".{}", message.full_name())
}

const fn scalar_type(scalar: ScalarType) -> Type {
    match scalar {
        ScalarType::String => Type::String,
        ScalarType::Int32 => Type::Int32,
        ScalarType::Int64 => Type::Int64,
        ScalarType::UInt32 => Type::Uint32,
        ScalarType::UInt64 => Type::Uint64,
        ScalarType::Float => Type::Float,
        ScalarType::Double => Type::Double,
        ScalarType::Bool => Type::Bool,
        ScalarType::Bytes => Type::Bytes,
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn dependencies_precede_dependents() {
        let registry = SchemaRegistry::new();
        let z = registry.message("Zulu").register().unwrap();
        registry.message("Alpha").field("z", &z).register().unwrap();

        let set = file_descriptor_set(&registry);
        let names: Vec<_> = set.file.iter().map(|f| f.name().to_owned()).collect();
        assert_eq!(names, ["zulu.proto", "alpha.proto"]);
    }

    #[test]
    fn map_fields_become_entry_messages() {
        let registry = SchemaRegistry::new();
        let m = registry
            .message("Tagged")
            .map("user_tags", ScalarType::String, ScalarType::Int32)
            .register()
            .unwrap();
        bind_in_memory(&registry).unwrap();

        let wire = m.wire_descriptor().unwrap();
        let field = wire.get_field_by_name("user_tags").unwrap();
        assert!(field.is_map());
        assert_eq!(field.number(), 1);
    }
}
