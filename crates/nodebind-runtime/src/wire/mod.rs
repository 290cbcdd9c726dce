//! TCP wire transport between nodes.
//!
//! Each node listens on its configured address. The first transaction to a
//! peer opens one outbound connection to it, shared by every later call.
//! Replies are correlated by transaction id and bounded by a timeout.

mod client;
mod connection;
mod pending;
mod server;

pub use client::Client;
pub use connection::{Connection, ConnectionState, TRANSACTION_FAILURE};
pub use pending::PendingTable;
pub use server::Server;

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use nodebind_transport::NodeAddress;
use tracing::{debug, error, info};

use crate::error::{BinderError, Result, RuntimeError};
use crate::lock;
use crate::plugin::{Plugin, PluginContext, Supervisor, TransactFlags};
use crate::uri::{BinderUri, WIRE_SCHEME};
use crate::Completion;

/// The `rpc` transport plugin.
///
/// Registered on every runtime by default. Register your own instance
/// before `start` to keep a handle on its connection counters.
pub struct WirePlugin {
    shared: Arc<Shared>,
}

struct Shared {
    ctx: Mutex<Option<PluginContext>>,
    server: Mutex<Option<Server>>,
    clients: Mutex<HashMap<u32, Arc<Client>>>,
    proxies: Mutex<HashMap<u32, usize>>,
    connects: AtomicU64,
    stopped: AtomicBool,
}

impl Default for WirePlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl WirePlugin {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                ctx: Mutex::new(None),
                server: Mutex::new(None),
                clients: Mutex::new(HashMap::new()),
                proxies: Mutex::new(HashMap::new()),
                connects: AtomicU64::new(0),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    /// Outbound connections opened over this plugin's lifetime.
    pub fn outbound_connections(&self) -> u64 {
        self.shared.connects.load(Ordering::Acquire)
    }

    /// Outbound connections currently held.
    pub fn client_count(&self) -> usize {
        lock(&self.shared.clients).len()
    }

    /// Inbound connections currently open.
    pub fn inbound_connections(&self) -> usize {
        lock(&self.shared.server)
            .as_ref()
            .map_or(0, Server::connection_count)
    }

    /// Live remote proxies pointing at `node_id`.
    pub fn proxy_count(&self, node_id: u32) -> usize {
        lock(&self.shared.proxies)
            .get(&node_id)
            .copied()
            .unwrap_or(0)
    }

    /// The open connection to `node_id`, if there is one.
    pub fn client(&self, node_id: u32) -> Option<Arc<Client>> {
        lock(&self.shared.clients)
            .get(&node_id)
            .filter(|client| client.is_open())
            .cloned()
    }

    /// Close the connection to `node_id`. Its pending transactions reject.
    pub fn disconnect(&self, node_id: u32, reason: &str) -> bool {
        let client = lock(&self.shared.clients).remove(&node_id);
        match client {
            Some(client) => {
                client.close(reason);
                true
            }
            None => false,
        }
    }

    /// The connection to `node_id`, opened on first use.
    ///
    /// Check and create happen under one lock, so concurrent first calls
    /// share a single connection.
    fn client_for(&self, node_id: u32) -> Result<Arc<Client>> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(BinderError::Connection(
                "wire transport is shut down".to_string(),
            ));
        }
        let ctx = lock(&self.shared.ctx)
            .clone()
            .ok_or_else(|| BinderError::Connection("wire transport not started".to_string()))?;

        let client = {
            let mut clients = lock(&self.shared.clients);
            if let Some(client) = clients.get(&node_id) {
                if client.is_open() {
                    return Ok(Arc::clone(client));
                }
            }
            let client = Arc::new(Client::connect(node_id, &ctx)?);
            self.shared.connects.fetch_add(1, Ordering::AcqRel);
            clients.insert(node_id, Arc::clone(&client));
            client
        };

        let shared = Arc::downgrade(&self.shared);
        let closed = Arc::downgrade(&client);
        client.on_closed(move || {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            let mut clients = lock(&shared.clients);
            let current = clients
                .get(&node_id)
                .is_some_and(|client| std::ptr::eq(Arc::as_ptr(client), closed.as_ptr()));
            if current {
                clients.remove(&node_id);
                debug!(node = node_id, "connection dropped from pool");
            }
        });

        Ok(client)
    }
}

impl Plugin for WirePlugin {
    fn scheme(&self) -> &'static str {
        WIRE_SCHEME
    }

    fn start(&self, ctx: PluginContext) -> std::result::Result<(), RuntimeError> {
        self.shared.stopped.store(false, Ordering::Release);
        match ctx.config.node(ctx.node_id) {
            Some(node) => {
                let server = NodeAddress::parse(&node.uri)
                    .and_then(|address| Server::start(&address, &ctx));
                match server {
                    Ok(server) => *lock(&self.shared.server) = Some(server),
                    Err(err) => error!(
                        node = ctx.node_id,
                        uri = %node.uri,
                        error = %err,
                        "failed to listen; inbound transactions disabled"
                    ),
                }
            }
            None => info!(
                node = ctx.node_id,
                "no address configured for this node; inbound transactions disabled"
            ),
        }
        *lock(&self.shared.ctx) = Some(ctx);
        Ok(())
    }

    fn shutdown(&self) {
        if self.shared.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        let server = lock(&self.shared.server).take();
        if let Some(server) = server {
            server.shutdown();
        }
        let clients: Vec<Arc<Client>> = lock(&self.shared.clients)
            .drain()
            .map(|(_, client)| client)
            .collect();
        for client in clients {
            client.close("runtime shutting down");
        }
        lock(&self.shared.proxies).clear();
        lock(&self.shared.ctx).take();
    }

    fn transact(
        &self,
        target: &BinderUri,
        what: i32,
        payload: Bytes,
        flags: TransactFlags,
    ) -> Result<Option<Completion>> {
        self.client_for(target.node_id())?
            .transact(target, what, payload, flags)
    }

    fn connect(&self, node_id: u32) -> Result<()> {
        self.client_for(node_id).map(|_| ())
    }

    fn disconnect(&self, node_id: u32) -> bool {
        WirePlugin::disconnect(self, node_id, "disconnect requested")
    }

    fn attach_proxy(&self, target: &BinderUri) {
        *lock(&self.shared.proxies)
            .entry(target.node_id())
            .or_insert(0) += 1;
    }

    fn detach_proxy(&self, target: &BinderUri) {
        let node_id = target.node_id();
        let idle = {
            let mut proxies = lock(&self.shared.proxies);
            match proxies.get_mut(&node_id) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    proxies.remove(&node_id);
                    true
                }
                None => false,
            }
        };

        let close_idle = lock(&self.shared.ctx)
            .as_ref()
            .is_some_and(|ctx| ctx.settings.close_idle_connections);
        if idle && close_idle && self.disconnect(node_id, "no proxies left") {
            debug!(node = node_id, "closed idle connection");
        }
    }

    fn link(&self, target: &BinderUri, supervisor: Arc<dyn Supervisor>) {
        match self.client(target.node_id()) {
            Some(client) => client.link(target, supervisor),
            None => supervisor.on_exit(target),
        }
    }

    fn unlink(&self, target: &BinderUri, supervisor: &Arc<dyn Supervisor>) {
        if let Some(client) = self.client(target.node_id()) {
            client.unlink(target, supervisor);
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        lock(&self.shared.server).as_ref().map(Server::local_addr)
    }
}

impl std::fmt::Debug for WirePlugin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WirePlugin")
            .field("clients", &self.client_count())
            .field("outbound_connections", &self.outbound_connections())
            .finish()
    }
}
