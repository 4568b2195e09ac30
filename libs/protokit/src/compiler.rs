//! External protobuf compiler invocation.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::CodegenError;

/// File name of the serialized descriptor set written next to the schemas.
pub const DESCRIPTOR_SET_FILE: &str = "descriptor.bin";

/// Turns rendered schema text into compiled artifacts.
pub trait SchemaCompiler: Send + Sync {
    /// Compiles `rendered` (file name to `.proto` text) into `out_dir` and
    /// returns the encoded `FileDescriptorSet`.
    ///
    /// # Errors
    /// Any failure is fatal for startup.
    fn compile(
        &self,
        rendered: &BTreeMap<String, String>,
        out_dir: &Path,
    ) -> Result<Vec<u8>, CodegenError>;
}

/// Drives `protoc` through `tonic-prost-build`.
///
/// For every output file `F` this produces `F.proto`, the generated Rust
/// module `F.rs` with message types and client/server stubs, a shared
/// `descriptor.bin` and a `mod.rs` that includes every generated module.
#[derive(Debug, Clone)]
pub struct ProtocCompiler {
    build_client: bool,
    build_server: bool,
}

impl Default for ProtocCompiler {
    fn default() -> Self {
        Self {
            build_client: true,
            build_server: true,
        }
    }
}

impl ProtocCompiler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn build_client(mut self, enabled: bool) -> Self {
        self.build_client = enabled;
        self
    }

    #[must_use]
    pub fn build_server(mut self, enabled: bool) -> Self {
        self.build_server = enabled;
        self
    }
}

impl SchemaCompiler for ProtocCompiler {
    fn compile(
        &self,
        rendered: &BTreeMap<String, String>,
        out_dir: &Path,
    ) -> Result<Vec<u8>, CodegenError> {
        fs::create_dir_all(out_dir).map_err(|e| CodegenError::io(out_dir, e))?;

        let mut protos = Vec::with_capacity(rendered.len());
        for (file, text) in rendered {
            let path = out_dir.join(format!("{file}.proto"));
            write_if_changed(&path, text)?;
            protos.push(path);
        }

        let descriptor_path = out_dir.join(DESCRIPTOR_SET_FILE);
        tracing::info!(
            out_dir = %out_dir.display(),
            files = protos.len(),
            "compiling generated schemas"
        );
        tonic_prost_build::configure()
            .build_client(self.build_client)
            .build_server(self.build_server)
            .out_dir(out_dir)
            .file_descriptor_set_path(&descriptor_path)
            .compile_protos(&protos[..], &[out_dir.to_path_buf()])
            .map_err(|source| CodegenError::Compile { source })?;

        write_if_changed(&out_dir.join("mod.rs"), &module_index(rendered.keys()))?;

        fs::read(&descriptor_path).map_err(|e| CodegenError::io(descriptor_path, e))
    }
}

/// Leaves the file untouched when its content is already `text`.
fn write_if_changed(path: &Path, text: &str) -> Result<(), CodegenError> {
    match fs::read_to_string(path) {
        Ok(existing) if existing == text => {
            tracing::trace!(path = %path.display(), "generated file unchanged");
            return Ok(());
        }
        _ => {}
    }
    fs::write(path, text).map_err(|e| CodegenError::io(path, e))?;
    tracing::debug!(path = %path.display(), "wrote generated file");
    Ok(())
}

fn module_index<'a>(files: impl Iterator<Item = &'a String>) -> String {
    let mut out = String::from("// @generated\n");
    for file in files {
        let _ = writeln!(out, "pub mod {file} {{\n    include!(\"{file}.rs\");\n}}");
    }
    out
}

/// Reads a descriptor set produced by an earlier run.
///
/// # Errors
/// Returns [`CodegenError::Io`] when the file cannot be read.
pub fn read_descriptor_set(out_dir: &Path) -> Result<Vec<u8>, CodegenError> {
    let path: PathBuf = out_dir.join(DESCRIPTOR_SET_FILE);
    fs::read(&path).map_err(|e| CodegenError::io(path, e))
}
