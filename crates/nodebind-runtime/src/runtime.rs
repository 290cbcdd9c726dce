use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use bytes::Bytes;
use nodebind_promise::{Scheduler, ThreadPool};
use tracing::{debug, info, warn};

use crate::binder::BinderTable;
use crate::config::{Configuration, RuntimeConfig};
use crate::error::{BinderError, Result, RuntimeError};
use crate::id::BinderId;
use crate::interface::{Interface, InterfaceRegistry};
use crate::lock;
use crate::plugin::{Plugin, PluginContext, Supervisor, TransactFlags};
use crate::proxy::{Proxy, ProxyKind};
use crate::stub::Stub;
use crate::uri::{BinderUri, WIRE_SCHEME};
use crate::wire::WirePlugin;
use crate::Completion;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Running,
    Stopped,
}

impl Lifecycle {
    fn name(self) -> &'static str {
        match self {
            Lifecycle::Created => "not started",
            Lifecycle::Running => "running",
            Lifecycle::Stopped => "stopped",
        }
    }
}

/// One node's share of the object system.
///
/// Cheap to clone; every clone is a handle to the same node. The runtime is
/// constructed explicitly, started with [`start`](Self::start) and stopped
/// with [`shutdown`](Self::shutdown) (or when the last handle drops).
#[derive(Clone)]
pub struct Runtime {
    inner: Arc<Inner>,
}

struct Inner {
    node_id: u32,
    config: Arc<Configuration>,
    settings: RuntimeConfig,
    binders: Arc<BinderTable>,
    interfaces: RwLock<InterfaceRegistry>,
    plugins: RwLock<HashMap<&'static str, Arc<dyn Plugin>>>,
    services: Mutex<HashMap<String, BinderUri>>,
    scheduler: Arc<Scheduler>,
    workers: Arc<ThreadPool>,
    state: Mutex<Lifecycle>,
}

impl Runtime {
    /// Build a runtime for `node_id` with the TCP wire plugin registered.
    pub fn new(
        node_id: u32,
        config: Configuration,
        settings: RuntimeConfig,
    ) -> std::result::Result<Self, RuntimeError> {
        if node_id == 0 {
            return Err(RuntimeError::InvalidNode(node_id));
        }
        config.validate()?;

        let binders = Arc::new(BinderTable::new(node_id, config.reserved_ids(node_id)));
        let scheduler = Arc::new(Scheduler::new(&format!("nodebind-{node_id}-timer"))?);
        let workers = Arc::new(ThreadPool::new(
            &format!("nodebind-{node_id}-dispatch"),
            settings.dispatch_workers,
            settings.dispatch_queue,
        )?);

        let wire: Arc<dyn Plugin> = Arc::new(WirePlugin::new());
        let mut plugins = HashMap::new();
        plugins.insert(wire.scheme(), wire);

        Ok(Self {
            inner: Arc::new(Inner {
                node_id,
                config: Arc::new(config),
                settings,
                binders,
                interfaces: RwLock::new(InterfaceRegistry::new()),
                plugins: RwLock::new(plugins),
                services: Mutex::new(HashMap::new()),
                scheduler,
                workers,
                state: Mutex::new(Lifecycle::Created),
            }),
        })
    }

    /// Add or replace the plugin for its scheme. Only before `start`.
    pub fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> std::result::Result<(), RuntimeError> {
        let state = *lock(&self.inner.state);
        if state != Lifecycle::Created {
            return Err(RuntimeError::State(state.name()));
        }
        self.plugins_mut().insert(plugin.scheme(), plugin);
        Ok(())
    }

    pub fn register_interface<I: Interface>(&self) {
        self.inner
            .interfaces
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .register::<I>();
    }

    /// Turn a proxy into a registered typed interface.
    pub fn as_interface<I: Interface>(&self, proxy: Proxy) -> Result<I> {
        self.inner
            .interfaces
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_interface::<I>(proxy)
    }

    /// Start every plugin.
    pub fn start(&self) -> std::result::Result<(), RuntimeError> {
        let mut state = lock(&self.inner.state);
        if *state != Lifecycle::Created {
            return Err(RuntimeError::State(state.name()));
        }

        let ctx = PluginContext {
            node_id: self.inner.node_id,
            config: Arc::clone(&self.inner.config),
            settings: self.inner.settings.clone(),
            binders: Arc::clone(&self.inner.binders),
            scheduler: Arc::clone(&self.inner.scheduler),
            workers: Arc::clone(&self.inner.workers),
        };
        for plugin in self.plugins().values() {
            plugin.start(ctx.clone())?;
        }

        *state = Lifecycle::Running;
        info!(node = self.inner.node_id, "runtime started");
        Ok(())
    }

    /// Stop plugins, then the worker pool and the timer. Idempotent.
    pub fn shutdown(&self) {
        self.inner.shutdown();
    }

    pub fn is_running(&self) -> bool {
        *lock(&self.inner.state) == Lifecycle::Running
    }

    pub fn node_id(&self) -> u32 {
        self.inner.node_id
    }

    pub fn config(&self) -> &Configuration {
        &self.inner.config
    }

    pub fn settings(&self) -> &RuntimeConfig {
        &self.inner.settings
    }

    pub fn binders(&self) -> &BinderTable {
        &self.inner.binders
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.inner.scheduler
    }

    /// Address the wire plugin accepts connections on, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.plugins().values().find_map(|plugin| plugin.local_addr())
    }

    /// Expose `stub` under a freshly allocated id.
    pub fn register(&self, stub: Arc<Stub>) -> Result<BinderUri> {
        let descriptor = stub.descriptor().to_string();
        let id = self.inner.binders.register(stub)?;
        Ok(BinderUri::wire(id).with_interface(descriptor))
    }

    pub fn unregister(&self, uri: &BinderUri) -> bool {
        self.inner.binders.unregister(uri.id()).is_some()
    }

    /// Build a proxy for `uri`. Local targets must already be registered.
    pub fn proxy(&self, uri: &BinderUri) -> Result<Proxy> {
        if uri.node_id() == self.inner.node_id {
            let stub = self
                .inner
                .binders
                .get(uri.id())
                .ok_or_else(|| BinderError::not_found(uri))?;
            return Ok(Proxy::new(
                self.clone(),
                uri.clone(),
                ProxyKind::Local(Arc::downgrade(&stub)),
            ));
        }
        self.plugin_for(uri)?;
        Ok(Proxy::new(self.clone(), uri.clone(), ProxyKind::Remote))
    }

    /// Route a transaction. Local targets dispatch directly; everything else
    /// goes to the plugin registered for the URI scheme.
    pub fn transact(
        &self,
        target: &BinderUri,
        what: i32,
        payload: Bytes,
        flags: TransactFlags,
    ) -> Result<Option<Completion>> {
        if target.node_id() == self.inner.node_id {
            let completion = self.inner.binders.dispatch(target.id(), what, payload);
            return Ok((!flags.oneway).then_some(completion));
        }
        self.ensure_running()?;
        self.plugin_for(target)?
            .transact(target, what, payload, flags)
    }

    /// Open the wire connection to `node_id` now instead of on first call.
    pub fn connect(&self, node_id: u32) -> Result<()> {
        if node_id == self.inner.node_id {
            return Ok(());
        }
        self.ensure_running()?;
        self.wire()?.connect(node_id)
    }

    /// Close the wire connection to `node_id`; its pending calls reject and
    /// the next call reconnects. False if no connection was open.
    pub fn disconnect(&self, node_id: u32) -> bool {
        match self.wire() {
            Ok(plugin) => plugin.disconnect(node_id),
            Err(_) => false,
        }
    }

    pub fn attach_proxy(&self, target: &BinderUri) {
        if let Ok(plugin) = self.plugin_for(target) {
            plugin.attach_proxy(target);
        }
    }

    pub fn detach_proxy(&self, target: &BinderUri) {
        if let Ok(plugin) = self.plugin_for(target) {
            plugin.detach_proxy(target);
        }
    }

    /// Tell `supervisor` when the connection to `target`'s node closes.
    ///
    /// Local targets never exit while the runtime lives. A target with no
    /// transport, or no live connection, is reported immediately.
    pub fn link(&self, target: &BinderUri, supervisor: Arc<dyn Supervisor>) {
        if target.node_id() == self.inner.node_id {
            return;
        }
        match self.plugin_for(target) {
            Ok(plugin) => plugin.link(target, supervisor),
            Err(_) => supervisor.on_exit(target),
        }
    }

    pub fn unlink(&self, target: &BinderUri, supervisor: &Arc<dyn Supervisor>) {
        if let Ok(plugin) = self.plugin_for(target) {
            plugin.unlink(target, supervisor);
        }
    }

    /// Expose `stub` as the named service.
    ///
    /// A service configured for this node takes its configured id; an
    /// unconfigured one gets a fresh id and is only reachable by name here.
    pub fn add_service(&self, name: &str, stub: Arc<Stub>) -> Result<BinderUri> {
        let mut services = lock(&self.inner.services);
        if services.contains_key(name) {
            return Err(BinderError::LocalDispatch(format!(
                "service {name:?} already added"
            )));
        }

        let uri = match self.inner.config.service(name) {
            Some(service) if service.node != self.inner.node_id => {
                return Err(BinderError::LocalDispatch(format!(
                    "service {name:?} belongs to node {}",
                    service.node
                )));
            }
            Some(service) => {
                if service.interface != stub.descriptor() {
                    return Err(BinderError::LocalDispatch(format!(
                        "service {name:?} is configured as {}, stub implements {}",
                        service.interface,
                        stub.descriptor()
                    )));
                }
                let id = self.inner.binders.register_with_id(stub, service.id)?;
                BinderUri::wire(id).with_interface(service.interface.clone())
            }
            None => self.register(stub)?,
        };

        debug!(service = name, uri = %uri, "service added");
        services.insert(name.to_string(), uri.clone());
        Ok(uri)
    }

    /// Proxy for a named service, local or remote.
    pub fn get_service(&self, name: &str) -> Result<Proxy> {
        let local = lock(&self.inner.services).get(name).cloned();
        if let Some(uri) = local {
            return self.proxy(&uri);
        }

        match self.inner.config.service(name) {
            Some(service) if service.node == self.inner.node_id => Err(
                BinderError::LocalDispatch(format!("service {name:?} is not exposed")),
            ),
            Some(service) => {
                let uri = BinderUri::wire(BinderId::new(service.node, service.id))
                    .with_interface(service.interface.clone());
                self.proxy(&uri)
            }
            None => Err(BinderError::LocalDispatch(format!(
                "unknown service {name:?}"
            ))),
        }
    }

    pub fn remove_service(&self, name: &str) -> bool {
        let removed = lock(&self.inner.services).remove(name);
        match removed {
            Some(uri) => {
                self.unregister(&uri);
                debug!(service = name, "service removed");
                true
            }
            None => false,
        }
    }

    fn ensure_running(&self) -> Result<()> {
        let state = *lock(&self.inner.state);
        if state == Lifecycle::Running {
            return Ok(());
        }
        Err(BinderError::Connection(format!(
            "runtime for node {} is {}",
            self.inner.node_id,
            state.name()
        )))
    }

    fn plugin_for(&self, target: &BinderUri) -> Result<Arc<dyn Plugin>> {
        self.plugin(target.scheme())
    }

    fn wire(&self) -> Result<Arc<dyn Plugin>> {
        self.plugin(WIRE_SCHEME)
    }

    fn plugin(&self, scheme: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins()
            .get(scheme)
            .cloned()
            .ok_or_else(|| BinderError::Connection(format!("no transport for scheme {scheme:?}")))
    }

    fn plugins(&self) -> std::sync::RwLockReadGuard<'_, HashMap<&'static str, Arc<dyn Plugin>>> {
        self.inner
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn plugins_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<&'static str, Arc<dyn Plugin>>> {
        self.inner
            .plugins
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Inner {
    fn shutdown(&self) {
        {
            let mut state = lock(&self.state);
            if *state == Lifecycle::Stopped {
                return;
            }
            *state = Lifecycle::Stopped;
        }

        let plugins: Vec<Arc<dyn Plugin>> = self
            .plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        for plugin in plugins {
            plugin.shutdown();
        }

        if !self.workers.shutdown(self.settings.shutdown_timeout) {
            warn!(node = self.node_id, "dispatch workers still busy at shutdown");
        }
        self.scheduler.shutdown(self.settings.shutdown_timeout);
        info!(node = self.node_id, "runtime stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("node_id", &self.inner.node_id)
            .field("state", &lock(&self.inner.state).name())
            .field("binders", &self.inner.binders.len())
            .finish()
    }
}
