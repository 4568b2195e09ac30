//! Startup orchestration: generate, compile, bind, then hand out method handles.

use std::fmt;
use std::sync::Arc;

use prost_reflect::DescriptorPool;
use tokio::sync::Semaphore;

use crate::binder;
use crate::compiler::{ProtocCompiler, SchemaCompiler, read_descriptor_set};
use crate::config::ProtokitConfig;
use crate::dispatch::{ExceptionHandler, MethodHandle, ReRaise};
use crate::error::{CodegenError, RpcError, ServerError};
use crate::message::Message;
use crate::registry::SchemaRegistry;
use crate::render::render_all;
use crate::scope::CallScope;
use crate::service::{Processor, Service, ServiceDescriptor, processor};

type StartupListener = Box<dyn Fn(&Server) -> anyhow::Result<()> + Send + Sync>;

/// Owns the services exposed by one process and their shared dispatch policy.
pub struct Server {
    registry: SchemaRegistry,
    config: ProtokitConfig,
    services: Vec<Arc<ServiceDescriptor>>,
    exception_handler: Arc<dyn ExceptionHandler>,
    limiter: Option<Arc<Semaphore>>,
    process_request: Vec<Processor>,
    process_response: Vec<Processor>,
    compiler: Box<dyn SchemaCompiler>,
    startup: Vec<StartupListener>,
    pool: Option<DescriptorPool>,
}

impl Server {
    #[must_use]
    pub fn new(registry: SchemaRegistry, config: ProtokitConfig) -> Self {
        let limiter = config
            .server
            .max_concurrent_rpcs
            .map(|limit| Arc::new(Semaphore::new(limit)));
        Self {
            registry,
            config,
            services: Vec::new(),
            exception_handler: Arc::new(ReRaise),
            limiter,
            process_request: Vec::new(),
            process_response: Vec::new(),
            compiler: Box::new(ProtocCompiler::new()),
            startup: Vec::new(),
            pool: None,
        }
    }

    #[must_use]
    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    #[must_use]
    pub fn config(&self) -> &ProtokitConfig {
        &self.config
    }

    /// Exposes `service`. Methods registered on it later are exposed too.
    pub fn add_service(&mut self, service: &Service) -> &mut Self {
        let descriptor = service.descriptor();
        if !self.services.iter().any(|s| Arc::ptr_eq(s, descriptor)) {
            tracing::debug!(service = %descriptor.full_name(), "service added");
            self.services.push(Arc::clone(descriptor));
        }
        self
    }

    #[must_use]
    pub fn with_exception_handler(mut self, handler: impl ExceptionHandler + 'static) -> Self {
        self.exception_handler = Arc::new(handler);
        self
    }

    #[must_use]
    pub fn with_compiler(mut self, compiler: impl SchemaCompiler + 'static) -> Self {
        self.compiler = Box::new(compiler);
        self
    }

    /// Adds a request processor applied to every method of every service,
    /// before the service `before_request` hooks.
    pub fn process_request<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Message, &CallScope) -> Result<Message, RpcError> + Send + Sync + 'static,
    {
        self.process_request.push(processor(f));
        self
    }

    /// Adds a response processor applied to every method of every service,
    /// after the service `after_request` hooks.
    pub fn process_response<F>(&mut self, f: F) -> &mut Self
    where
        F: Fn(Message, &CallScope) -> Result<Message, RpcError> + Send + Sync + 'static,
    {
        self.process_response.push(processor(f));
        self
    }

    /// Registers a callback run once after a successful bind.
    pub fn on_startup<F>(&mut self, listener: F) -> &mut Self
    where
        F: Fn(&Server) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.startup.push(Box::new(listener));
        self
    }

    /// Renders, compiles and binds every declared file.
    ///
    /// # Errors
    /// Any [`CodegenError`] is fatal.
    pub fn generate(&self) -> Result<DescriptorPool, CodegenError> {
        let out_dir = self.config.codegen.output_dir();
        let _span = tracing::info_span!("codegen", out_dir = %out_dir.display()).entered();

        let rendered = render_all(&self.registry);
        tracing::info!(files = rendered.len(), "rendered schemas");
        let descriptor_set = self.compiler.compile(&rendered, &out_dir)?;
        binder::bind(&self.registry, &descriptor_set)
    }

    /// Binds the descriptor set left by an earlier [`Server::generate`].
    ///
    /// # Errors
    /// Returns [`CodegenError::Io`] when no descriptor set exists, or a bind error.
    pub fn bind_pregenerated(&self) -> Result<DescriptorPool, CodegenError> {
        let out_dir = self.config.codegen.output_dir();
        tracing::info!(out_dir = %out_dir.display(), "binding pre-generated descriptors");
        binder::bind(&self.registry, &read_descriptor_set(&out_dir)?)
    }

    /// Binds against a pool built elsewhere and marks the server as bound.
    ///
    /// # Errors
    /// Returns a bind error when a declaration is missing from `pool`.
    pub fn bind_pool(&mut self, pool: DescriptorPool) -> Result<(), CodegenError> {
        binder::bind_pool(&self.registry, &pool)?;
        self.pool = Some(pool);
        Ok(())
    }

    /// Runs the startup sequence unless already bound, then the startup listeners.
    ///
    /// # Errors
    /// Returns [`ServerError::Codegen`] when generation or binding fails and
    /// [`ServerError::Listener`] when a listener fails.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.pool.is_none() {
            let pool = if self.config.codegen.auto_generate {
                self.generate()?
            } else {
                self.bind_pregenerated()?
            };
            self.pool = Some(pool);
        }

        for listener in &self.startup {
            listener(self).map_err(ServerError::Listener)?;
        }
        tracing::info!(
            services = self.services.len(),
            methods = self.methods().len(),
            "server bound"
        );
        Ok(())
    }

    #[must_use]
    pub fn is_bound(&self) -> bool {
        self.pool.is_some()
    }

    #[must_use]
    pub fn pool(&self) -> Option<&DescriptorPool> {
        self.pool.as_ref()
    }

    /// In-process entry point for `service.method`; `service` may be the bare
    /// or the fully-qualified service name.
    #[must_use]
    pub fn method(&self, service: &str, method: &str) -> Option<MethodHandle> {
        self.services
            .iter()
            .filter(|s| s.service_name() == service || s.full_name() == service)
            .find_map(|s| s.rpc(method).map(|rpc| self.handle(s, rpc)))
    }

    /// Every exposed method, in service then registration order.
    #[must_use]
    pub fn methods(&self) -> Vec<MethodHandle> {
        self.services
            .iter()
            .flat_map(|s| s.rpcs().into_iter().map(move |rpc| (s, rpc)))
            .map(|(s, rpc)| self.handle(s, rpc))
            .collect()
    }

    fn handle(
        &self,
        service: &Arc<ServiceDescriptor>,
        rpc: Arc<crate::service::RpcDescriptor>,
    ) -> MethodHandle {
        MethodHandle::new(
            Arc::clone(service),
            rpc,
            Arc::clone(&self.exception_handler),
            self.limiter.clone(),
        )
        .with_processors(
            Arc::from(self.process_request.as_slice()),
            Arc::from(self.process_response.as_slice()),
        )
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .field("services", &self.services)
            .field("bound", &self.is_bound())
            .finish_non_exhaustive()
    }
}
