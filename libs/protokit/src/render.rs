//! `.proto` text rendering.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::field::{FieldDescriptor, FieldKind, FieldType};
use crate::message::MessageDescriptor;
use crate::registry::{FileMetadata, SchemaRegistry};
use crate::service::ServiceDescriptor;

const INDENT: &str = "    ";

/// Renders every declared file. Output is keyed and ordered by file name.
#[must_use]
pub fn render_all(registry: &SchemaRegistry) -> BTreeMap<String, String> {
    registry
        .snapshot()
        .into_iter()
        .map(|(name, meta)| {
            let text = render_file(&name, &meta);
            (name, text)
        })
        .collect()
}

/// Renders one file as proto3 text in package `file`.
#[must_use]
pub fn render_file(file: &str, meta: &FileMetadata) -> String {
    let mut out = String::new();
    out.push_str("syntax = \"proto3\";\n\n");
    let _ = writeln!(out, "package {file};");

    if !meta.import_files.is_empty() {
        out.push('\n');
        for import in &meta.import_files {
            let _ = writeln!(out, "import \"{import}.proto\";");
        }
    }

    for message in &meta.messages {
        out.push('\n');
        render_message(&mut out, file, message);
    }

    for service in &meta.services {
        out.push('\n');
        render_service(&mut out, file, service);
    }

    out
}

fn render_message(out: &mut String, file: &str, message: &MessageDescriptor) {
    let _ = writeln!(out, "message {} {{", message.type_name());
    for (index, field) in message.fields().iter().enumerate() {
        let _ = writeln!(
            out,
            "{INDENT}{} {} = {};",
            field_type(file, field),
            field.declared_name(),
            index + 1
        );
    }
    out.push_str("}\n");
}

fn render_service(out: &mut String, file: &str, service: &ServiceDescriptor) {
    let _ = writeln!(out, "service {} {{", service.service_name());
    for rpc in service.rpcs() {
        let _ = writeln!(
            out,
            "{INDENT}rpc {} ({}{}) returns ({}{}) {{}}",
            rpc.method_name(),
            if rpc.request_streaming() { "stream " } else { "" },
            type_ref(file, rpc.request_type()),
            if rpc.response_streaming() { "stream " } else { "" },
            type_ref(file, rpc.response_type()),
        );
    }
    out.push_str("}\n");
}

fn field_type(file: &str, field: &FieldDescriptor) -> String {
    match field.kind() {
        FieldKind::Scalar(s) => s.wire_tag().to_owned(),
        FieldKind::Reference(m) => type_ref(file, m),
        FieldKind::Repeated(element) => format!("repeated {}", element_ref(file, element)),
        FieldKind::Map { key, value } => {
            format!("map<{}, {}>", key.wire_tag(), element_ref(file, value))
        }
    }
}

fn element_ref(file: &str, element: &FieldType) -> String {
    match element {
        FieldType::Scalar(s) => s.wire_tag().to_owned(),
        FieldType::Message(m) => type_ref(file, m),
    }
}

/// Messages from other files live in the package named after their file.
fn type_ref(file: &str, message: &MessageDescriptor) -> String {
    if message.output_file() == file {
        message.type_name().to_owned()
    } else {
        message.full_name()
    }
}
