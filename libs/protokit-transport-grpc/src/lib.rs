#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod codec;
pub mod serve;
pub mod service;

pub use codec::WireCodec;
pub use serve::{serve, serve_listener};
pub use service::{GrpcMethod, GrpcRouter};

use tonic::Status;
use tonic::metadata::{MetadataMap, MetadataValue};

/// Metadata key carrying the gRPC path of the method being served.
pub const METHOD_METADATA_KEY: &str = "x-protokit-method";

/// gRPC route of `method` on `service` declared in output file `file`.
#[must_use]
pub fn route_path(file: &str, service: &str, method: &str) -> String {
    format!("/{file}.{service}/{method}")
}

/// Record the served method path in request metadata.
///
/// # Errors
/// Returns `Status::internal` if the path is not valid ASCII metadata.
pub fn attach_method_metadata(meta: &mut MetadataMap, path: &str) -> Result<(), Status> {
    let value = MetadataValue::try_from(path)
        .map_err(|e| Status::internal(format!("method path not encodable: {e}")))?;
    meta.insert(METHOD_METADATA_KEY, value);
    Ok(())
}

/// Read the served method path back from request metadata.
///
/// # Errors
/// Returns `Status::invalid_argument` if the key is missing or not ASCII.
pub fn extract_method_metadata(meta: &MetadataMap) -> Result<String, Status> {
    let raw = meta
        .get(METHOD_METADATA_KEY)
        .ok_or_else(|| Status::invalid_argument("missing method metadata"))?;
    raw.to_str()
        .map(str::to_owned)
        .map_err(|e| Status::invalid_argument(format!("method metadata not ascii: {e}")))
}
