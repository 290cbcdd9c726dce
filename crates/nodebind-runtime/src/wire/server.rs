use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use nodebind_promise::join_bounded;
use nodebind_transport::{NodeAddress, NodeListener, TransportError};
use tracing::{debug, info, warn};

use crate::lock;
use crate::plugin::PluginContext;
use crate::wire::connection::{Connection, Role};

type Connections = Arc<Mutex<HashMap<u64, Arc<Connection>>>>;

/// Accepts inbound connections and serves them against the binder table.
pub struct Server {
    listener: Arc<NodeListener>,
    connections: Connections,
    acceptor: Mutex<Option<JoinHandle<()>>>,
    shutdown_timeout: Duration,
}

impl Server {
    /// Bind `address` and start the accept thread.
    pub fn start(address: &NodeAddress, ctx: &PluginContext) -> Result<Self, TransportError> {
        let listener = Arc::new(NodeListener::bind(address)?);
        let connections: Connections = Arc::new(Mutex::new(HashMap::new()));

        let accept_listener = Arc::clone(&listener);
        let accept_connections = Arc::clone(&connections);
        let accept_ctx = ctx.clone();
        let acceptor = std::thread::Builder::new()
            .name(format!("nodebind-{}-accept", ctx.node_id))
            .spawn(move || accept_loop(&accept_listener, &accept_connections, &accept_ctx))?;

        info!(
            node = ctx.node_id,
            local_addr = %listener.local_addr(),
            "accepting binder connections"
        );

        Ok(Self {
            listener,
            connections,
            acceptor: Mutex::new(Some(acceptor)),
            shutdown_timeout: ctx.settings.shutdown_timeout,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Inbound connections currently open.
    pub fn connection_count(&self) -> usize {
        lock(&self.connections).len()
    }

    /// Stop accepting and close every inbound connection.
    pub fn shutdown(&self) {
        self.listener.close();
        let acceptor = lock(&self.acceptor).take();
        if let Some(acceptor) = acceptor {
            if !join_bounded(acceptor, self.shutdown_timeout) {
                warn!("accept thread did not exit before timeout");
            }
        }

        let open: Vec<Arc<Connection>> = lock(&self.connections)
            .drain()
            .map(|(_, connection)| connection)
            .collect();
        for connection in open {
            connection.close("server shutting down");
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn accept_loop(listener: &NodeListener, connections: &Connections, ctx: &PluginContext) {
    loop {
        let stream = match listener.accept() {
            Ok(stream) => stream,
            Err(TransportError::Shutdown) => break,
            Err(err) => {
                if listener.is_closed() {
                    break;
                }
                warn!(error = %err, "accept failed");
                std::thread::sleep(Duration::from_millis(10));
                continue;
            }
        };

        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let role = Role::Server {
            binders: Arc::clone(&ctx.binders),
            workers: Arc::clone(&ctx.workers),
        };
        let connection = match Connection::open(
            stream,
            role,
            ctx.settings.frame.clone(),
            ctx.settings.shutdown_timeout,
            peer,
        ) {
            Ok(connection) => connection,
            Err(err) => {
                warn!(error = %err, "failed to open inbound connection");
                continue;
            }
        };

        debug!(conn = connection.id(), peer = connection.peer(), "inbound connection");
        let id = connection.id();
        lock(connections).insert(id, Arc::clone(&connection));

        let registry = Arc::downgrade(connections);
        connection.on_closed(move || {
            if let Some(registry) = registry.upgrade() {
                lock(&registry).remove(&id);
            }
        });
    }
    debug!("accept loop finished");
}
