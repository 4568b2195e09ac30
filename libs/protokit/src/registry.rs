//! File metadata store.
//!
//! Maps an output file name to the messages, services and imports that will
//! be rendered into `<file>.proto`. Entries are created on first access and
//! only grow during declaration; [`SchemaRegistry::reset`] exists for test
//! isolation.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::message::{MessageBuilder, MessageDescriptor};
use crate::service::{Service, ServiceDescriptor};

/// Everything rendered into one output file.
#[derive(Debug, Clone, Default)]
pub struct FileMetadata {
    pub import_files: BTreeSet<String>,
    pub messages: Vec<Arc<MessageDescriptor>>,
    pub services: Vec<Arc<ServiceDescriptor>>,
}

impl FileMetadata {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty() && self.services.is_empty()
    }
}

/// Cloneable handle to a shared file metadata store.
///
/// Clones observe the same store. Files iterate in sorted name order, so
/// anything derived from a snapshot is deterministic.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    files: Arc<RwLock<BTreeMap<String, FileMetadata>>>,
}

impl SchemaRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a message declaration.
    pub fn message(&self, type_name: impl Into<String>) -> MessageBuilder<'_> {
        MessageBuilder::new(self, type_name)
    }

    /// Declares a service in the file named after its lower-cased name.
    ///
    /// # Errors
    /// Returns [`SchemaError::InvalidIdentifier`](crate::SchemaError::InvalidIdentifier)
    /// for an invalid service name.
    pub fn service(&self, name: impl Into<String>) -> Result<Service, crate::SchemaError> {
        let name = name.into();
        let file = name.to_lowercase();
        Service::new(self.clone(), name, file)
    }

    /// Declares a service in an explicit output file.
    ///
    /// # Errors
    /// Returns [`SchemaError::InvalidIdentifier`](crate::SchemaError::InvalidIdentifier)
    /// for an invalid service or file name.
    pub fn service_in(
        &self,
        file: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Service, crate::SchemaError> {
        Service::new(self.clone(), name.into(), file.into())
    }

    pub(crate) fn add_message(
        &self,
        descriptor: &Arc<MessageDescriptor>,
        imports: impl IntoIterator<Item = String>,
    ) {
        let mut files = self.files.write();
        let file = files
            .entry(descriptor.output_file().to_owned())
            .or_default();
        if file
            .messages
            .iter()
            .any(|m| m.type_name() == descriptor.type_name())
        {
            tracing::warn!(
                message = %descriptor.type_name(),
                file = %descriptor.output_file(),
                "message declared more than once in the same file"
            );
        }
        file.messages.push(Arc::clone(descriptor));
        let own = descriptor.output_file();
        file.import_files
            .extend(imports.into_iter().filter(|import| import != own));
    }

    pub(crate) fn add_service(&self, descriptor: &Arc<ServiceDescriptor>) {
        let mut files = self.files.write();
        files
            .entry(descriptor.output_file().to_owned())
            .or_default()
            .services
            .push(Arc::clone(descriptor));
    }

    /// Merges imports into `file`, dropping self-imports.
    pub(crate) fn add_imports(&self, file: &str, imports: impl IntoIterator<Item = String>) {
        let mut files = self.files.write();
        files
            .entry(file.to_owned())
            .or_default()
            .import_files
            .extend(imports.into_iter().filter(|import| import != file));
    }

    /// Metadata of one file, if anything was declared into it.
    #[must_use]
    pub fn file(&self, name: &str) -> Option<FileMetadata> {
        self.files.read().get(name).cloned()
    }

    #[must_use]
    pub fn file_names(&self) -> Vec<String> {
        self.files.read().keys().cloned().collect()
    }

    /// Point-in-time copy of the whole store.
    #[must_use]
    pub fn snapshot(&self) -> BTreeMap<String, FileMetadata> {
        self.files.read().clone()
    }

    /// All declared messages in file order, then declaration order.
    #[must_use]
    pub fn messages(&self) -> Vec<Arc<MessageDescriptor>> {
        self.files
            .read()
            .values()
            .flat_map(|f| f.messages.iter().cloned())
            .collect()
    }

    #[must_use]
    pub fn services(&self) -> Vec<Arc<ServiceDescriptor>> {
        self.files
            .read()
            .values()
            .flat_map(|f| f.services.iter().cloned())
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.read().is_empty()
    }

    /// Drops every declared file.
    pub fn reset(&self) {
        let mut files = self.files.write();
        tracing::debug!(files = files.len(), "resetting schema registry");
        files.clear();
    }
}
