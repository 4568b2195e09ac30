#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Declaration-time behavior of the registry and renderer:
//! - field resolution order with inheritance
//! - import bookkeeping across output files
//! - deterministic rendering

use protokit::render::render_all;
use protokit::{FieldDescriptor, ScalarType, SchemaRegistry};

fn names(fields: &[FieldDescriptor]) -> Vec<&str> {
    fields.iter().map(FieldDescriptor::declared_name).collect()
}

#[test]
fn inherited_fields_precede_direct_fields_for_any_mix() {
    for inherited in 0..4_usize {
        for direct in 0..4_usize {
            let registry = SchemaRegistry::new();
            let mut base = registry.message("Base");
            for i in 0..inherited {
                base = base.field_of::<i64>(format!("inherited_{i}"));
            }
            let base = base.register().unwrap();

            let mut child = registry.message("Child").extends(&base);
            for i in 0..direct {
                child = child.field_of::<String>(format!("direct_{i}"));
            }
            let child = child.register().unwrap();

            let expected: Vec<String> = (0..inherited)
                .map(|i| format!("inherited_{i}"))
                .chain((0..direct).map(|i| format!("direct_{i}")))
                .collect();
            assert_eq!(names(child.fields()), expected, "{inherited} + {direct}");
        }
    }
}

#[test]
fn direct_field_overrides_inherited_field_of_same_name() {
    let registry = SchemaRegistry::new();
    let base = registry
        .message("Entity")
        .field_of::<String>("id")
        .field_of::<i64>("version")
        .register()
        .unwrap();
    let child = registry
        .message("Account")
        .extends(&base)
        .field_of::<String>("owner")
        .field_of::<u64>("id")
        .register()
        .unwrap();

    assert_eq!(names(child.fields()), ["id", "version", "owner"]);
    assert_eq!(child.field("id").unwrap().wire_type_tag(), "uint64");
}

#[test]
fn each_referenced_file_is_imported_once() {
    let registry = SchemaRegistry::new();
    let reference = registry
        .message("RefMsg")
        .field_of::<String>("id")
        .register()
        .unwrap();
    registry
        .message("Holder")
        .field("user", &reference)
        .repeated("items", &reference)
        .map("tags", ScalarType::String, &reference)
        .register()
        .unwrap();

    let holder = registry.file("holder").unwrap();
    assert_eq!(holder.import_files.len(), 1);
    assert!(holder.import_files.contains("refmsg"));
    assert!(registry.file("refmsg").unwrap().import_files.is_empty());

    let text = &render_all(&registry)["holder"];
    assert_eq!(text.matches("import ").count(), 1);
    assert!(text.contains("import \"refmsg.proto\";"));
    assert!(text.contains("    map<string, refmsg.RefMsg> tags = 3;"));
}

#[test]
fn rendering_twice_is_byte_identical() {
    let registry = SchemaRegistry::new();
    let point = registry
        .message("Point")
        .file("geo")
        .field_of::<f64>("lat")
        .field_of::<f64>("lng")
        .register()
        .unwrap();
    registry
        .message("Route")
        .field_of::<String>("name")
        .repeated("stops", &point)
        .map("metadata", ScalarType::String, ScalarType::String)
        .register()
        .unwrap();

    let first = render_all(&registry);
    let second = render_all(&registry);
    assert_eq!(first, second);
    assert_eq!(
        first.keys().map(String::as_str).collect::<Vec<_>>(),
        ["geo", "route"]
    );
}
