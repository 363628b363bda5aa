//! One attach/detach lifetime of the agent
//!
//! Setup resolves everything once into a [`Registry`] that is read-only from
//! then on and shared with the interceptors. Each hook target is resolved
//! and installed on its own, so losing one still leaves the other working.
//! Nothing here returns an error to the host: a session that could not set
//! anything up is simply inactive.

use std::sync::Arc;

use crate::backend::{locate_module, ClassHandle, MemorySource, RuntimeApi};
use crate::channel::transport::{spawn_forwarder, Forwarder};
use crate::channel::MessageSender;
use crate::config::AgentConfig;
use crate::hook::{
    DetourInstaller, HookInstaller, HookTarget, InstalledHook, Interceptor, RequestCapture, ResponseCapture,
};
use crate::il2cpp::{
    ArrayLayout, ManagedArrayReader, MethodResolver, NativeExports, ResolvedMethod, RuntimeIntrospector,
    SelfMemory,
};
use crate::NetcapError;

/// Handles resolved once at attach
#[derive(Debug)]
pub struct Registry {
    class: ClassHandle,
    methods: Vec<(HookTarget, ResolvedMethod)>,
    reader: Arc<ManagedArrayReader>,
}

impl Registry {
    /// Find the helper class and both methods
    ///
    /// Only a missing class fails the whole resolution; an unresolved method
    /// is logged and left out.
    pub fn resolve(
        config: &AgentConfig,
        api: Arc<dyn RuntimeApi>,
        memory: Arc<dyn MemorySource>,
    ) -> Result<Self, NetcapError> {
        let class = RuntimeIntrospector::new(api.as_ref()).find_class(&config.namespace, &config.class)?;

        let resolver = MethodResolver::new(api.as_ref(), memory.as_ref());
        let mut methods = Vec::with_capacity(HookTarget::COUNT);
        for target in HookTarget::ALL {
            match resolver.find_method(class, config.method_name(target), config.arg_count) {
                Ok(method) => methods.push((target, method)),
                Err(err) => tracing::warn!(hook = %target, error = %err, "method not resolved"),
            }
        }

        let layout = ArrayLayout::probe(api.as_ref(), config.array_data_offset);
        tracing::info!(?layout, "array layout selected");
        let reader = Arc::new(ManagedArrayReader::new(api, memory, layout));

        Ok(Registry { class, methods, reader })
    }

    pub fn class(&self) -> ClassHandle {
        self.class
    }

    pub fn method(&self, target: HookTarget) -> Option<ResolvedMethod> {
        self.methods
            .iter()
            .find(|(candidate, _)| *candidate == target)
            .map(|(_, method)| *method)
    }

    pub fn reader(&self) -> &Arc<ManagedArrayReader> {
        &self.reader
    }
}

/// A live instrumentation session
#[derive(Default)]
pub struct Session {
    registry: Option<Arc<Registry>>,
    hooks: Vec<Box<dyn InstalledHook>>,
    forwarder: Option<Forwarder>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("registry", &self.registry)
            .field("hooks", &self.installed())
            .finish()
    }
}

impl Session {
    /// Attach inside the host process
    ///
    /// Never fails outright; check [`Session::is_active`].
    pub fn attach(config: &AgentConfig) -> Session {
        let (api, memory) = match open_runtime(config) {
            Ok(runtime) => runtime,
            Err(err) => {
                tracing::warn!(error = %err, "runtime unavailable, capture disabled");
                return Session::default();
            }
        };

        let (sender, forwarder) = match spawn_forwarder(config.controller_addr.clone(), config.queue_capacity) {
            Ok(forwarding) => forwarding,
            Err(err) => {
                tracing::warn!(error = %err, "cannot start forwarder, capture disabled");
                return Session::default();
            }
        };

        let mut session = Session::attach_with(config, api, memory, sender, &DetourInstaller);
        if session.is_active() {
            session.forwarder = Some(forwarder);
        } else {
            forwarder.shutdown();
        }
        session
    }

    /// Resolve and install against the given runtime and installer
    pub fn attach_with(
        config: &AgentConfig,
        api: Arc<dyn RuntimeApi>,
        memory: Arc<dyn MemorySource>,
        sender: MessageSender,
        installer: &dyn HookInstaller,
    ) -> Session {
        let registry = match Registry::resolve(config, api, memory) {
            Ok(registry) => Arc::new(registry),
            Err(err) => {
                tracing::warn!(error = %err, "resolution failed, capture disabled");
                return Session::default();
            }
        };

        let mut hooks = Vec::with_capacity(HookTarget::COUNT);
        for target in HookTarget::ALL {
            let Some(method) = registry.method(target) else {
                continue;
            };
            let interceptor = interceptor_for(target, config, registry.reader().clone(), sender.clone());
            match installer.install(target, method.entry_point, interceptor) {
                Ok(hook) => hooks.push(hook),
                Err(err) => tracing::warn!(hook = %target, error = %err, "hook not installed"),
            }
        }

        tracing::info!(installed = hooks.len(), "session attached");
        Session {
            registry: Some(registry),
            hooks,
            forwarder: None,
        }
    }

    /// At least one hook is live
    pub fn is_active(&self) -> bool {
        !self.hooks.is_empty()
    }

    pub fn installed(&self) -> Vec<HookTarget> {
        self.hooks.iter().map(|hook| hook.target()).collect()
    }

    pub fn registry(&self) -> Option<&Registry> {
        self.registry.as_deref()
    }

    /// Remove the hooks and stop forwarding
    ///
    /// Calls already inside a hook complete; what they capture may be lost.
    pub fn detach(mut self) {
        for hook in self.hooks.drain(..) {
            if let Err(err) = hook.remove() {
                tracing::warn!(hook = %hook.target(), error = %err, "hook removal failed");
            }
        }
        self.registry = None;
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.shutdown();
        }
        tracing::info!("session detached");
    }
}

fn open_runtime(config: &AgentConfig) -> Result<(Arc<dyn RuntimeApi>, Arc<dyn MemorySource>), NetcapError> {
    let module = locate_module(&config.module)?;
    let exports = NativeExports::resolve(module)?;
    let memory = SelfMemory::open()?;
    Ok((Arc::new(exports), Arc::new(memory)))
}

fn interceptor_for(
    target: HookTarget,
    config: &AgentConfig,
    reader: Arc<ManagedArrayReader>,
    sender: MessageSender,
) -> Box<dyn Interceptor> {
    match target {
        HookTarget::DecompressResponse => Box::new(ResponseCapture::new(reader, sender)),
        HookTarget::CompressRequest => Box::new(
            RequestCapture::new(reader, sender).with_argument_order(&config.request_argument_order),
        ),
    }
}
