//! Attaches compiled wire types to declared descriptors.

use prost_reflect::DescriptorPool;

use crate::error::CodegenError;
use crate::registry::SchemaRegistry;

/// Decodes an encoded `FileDescriptorSet` and binds every declared message
/// and service to it.
///
/// # Errors
/// - [`CodegenError::DescriptorDecode`] for a malformed descriptor set.
/// - [`CodegenError::UnboundMessage`] / [`CodegenError::UnboundService`] when
///   a declaration has no compiled counterpart in its own file.
pub fn bind(registry: &SchemaRegistry, descriptor_set: &[u8]) -> Result<DescriptorPool, CodegenError> {
    let pool = DescriptorPool::decode(descriptor_set)?;
    bind_pool(registry, &pool)?;
    Ok(pool)
}

/// Binds against an already decoded pool.
///
/// # Errors
/// See [`bind`].
pub fn bind_pool(registry: &SchemaRegistry, pool: &DescriptorPool) -> Result<(), CodegenError> {
    let mut messages = Vec::new();
    let mut services = Vec::new();

    // Every lookup resolves before anything is attached, so a failure leaves the
    // registry unbound.
    for (file, meta) in registry.snapshot() {
        let proto_file = format!("{file}.proto");

        for message in meta.messages {
            let wire = pool
                .get_message_by_name(&message.full_name())
                .filter(|wire| wire.parent_file().name() == proto_file)
                .ok_or_else(|| CodegenError::UnboundMessage {
                    file: file.clone(),
                    type_name: message.type_name().to_owned(),
                })?;
            messages.push((message, wire));
        }

        for service in meta.services {
            let unbound = || CodegenError::UnboundService {
                file: file.clone(),
                service: service.service_name().to_owned(),
            };
            let wire = pool
                .get_service_by_name(&service.full_name())
                .filter(|wire| wire.parent_file().name() == proto_file)
                .ok_or_else(unbound)?;
            let complete = service
                .rpcs()
                .iter()
                .all(|rpc| wire.methods().any(|m| m.name() == rpc.method_name()));
            if !complete {
                return Err(unbound());
            }
            services.push((service, wire));
        }
    }

    tracing::info!(
        messages = messages.len(),
        services = services.len(),
        "bound compiled descriptors"
    );
    for (message, wire) in messages {
        message.bind(wire);
    }
    for (service, wire) in services {
        service.bind(wire);
    }
    Ok(())
}
