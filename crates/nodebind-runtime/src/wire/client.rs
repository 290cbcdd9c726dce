use std::sync::{Arc, Mutex};

use bytes::Bytes;
use nodebind_frame::Frame;
use nodebind_promise::Executor;
use nodebind_transport::NodeAddress;
use tracing::{debug, info};

use crate::error::{BinderError, Result};
use crate::lock;
use crate::plugin::{PluginContext, Supervisor, TransactFlags};
use crate::uri::BinderUri;
use crate::wire::connection::{Connection, Role};
use crate::wire::pending::PendingTable;
use crate::Completion;

type Linked = Vec<(BinderUri, Arc<dyn Supervisor>)>;

/// Outbound connection to one peer node.
pub struct Client {
    node_id: u32,
    address: NodeAddress,
    connection: Arc<Connection>,
    pending: Arc<PendingTable>,
    ctx: PluginContext,
    supervisors: Arc<Mutex<Linked>>,
}

impl Client {
    /// Connect to the configured address of `node_id`.
    pub fn connect(node_id: u32, ctx: &PluginContext) -> Result<Self> {
        let node = ctx.config.node(node_id).ok_or_else(|| {
            BinderError::Connection(format!("node {node_id} has no configured address"))
        })?;
        let address = NodeAddress::parse(&node.uri)
            .map_err(|err| BinderError::Connection(format!("node {node_id}: {err}")))?;

        debug!(node = node_id, %address, "connecting");
        let stream = nodebind_transport::connect(&address, ctx.settings.connect_timeout)
            .map_err(|err| BinderError::Connection(format!("node {node_id}: {err}")))?;

        let pending = Arc::new(PendingTable::new());
        let connection = Connection::open(
            stream,
            Role::Client {
                pending: Arc::clone(&pending),
            },
            ctx.settings.frame.clone(),
            ctx.settings.shutdown_timeout,
            address.to_string(),
        )?;
        info!(from = ctx.node_id, node = node_id, %address, "connected to node");

        let supervisors: Arc<Mutex<Linked>> = Arc::new(Mutex::new(Vec::new()));
        let linked = Arc::clone(&supervisors);
        connection.on_closed(move || notify_linked(&linked));

        Ok(Self {
            node_id,
            address,
            connection,
            pending,
            ctx: ctx.clone(),
            supervisors,
        })
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    pub fn address(&self) -> &NodeAddress {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        self.connection.is_open()
    }

    /// Two-way transactions awaiting a reply.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Send a transaction over this connection.
    ///
    /// Oneway calls go out with transaction id 0 and yield `None`. Two-way
    /// calls are recorded in the pending table and bounded by the flag's
    /// timeout, or the configured transaction timeout.
    pub fn transact(
        &self,
        target: &BinderUri,
        what: i32,
        payload: Bytes,
        flags: TransactFlags,
    ) -> Result<Option<Completion>> {
        let uri = target.to_string();
        if flags.oneway {
            self.connection
                .send(Frame::transaction(uri, 0, what, payload))?;
            return Ok(None);
        }

        let executor: Arc<dyn Executor> = self.ctx.workers.clone();
        let completion = Completion::with_executor(executor);
        let tid = self.pending.insert(completion.clone())?;

        // Cancellation or any other local settlement frees the slot on the
        // settling thread, not behind queued continuations.
        let pending = Arc::clone(&self.pending);
        let weak = completion.downgrade();
        completion.on_settled_inline(move |_| {
            if let Some(settled) = weak.upgrade() {
                pending.remove_if(tid, &settled);
            }
        });

        // The entry goes before the rejection, so a caller woken by the
        // timeout never sees it.
        let timeout = flags
            .timeout
            .unwrap_or(self.ctx.settings.transaction_timeout);
        let pending = Arc::clone(&self.pending);
        let weak = completion.downgrade();
        self.ctx.scheduler.schedule_after(timeout, move || {
            if let Some(expired) = weak.upgrade() {
                if pending.remove_if(tid, &expired) {
                    expired.reject(BinderError::Timeout(timeout));
                }
            }
        });

        if let Err(err) = self
            .connection
            .send(Frame::transaction(uri, tid, what, payload))
        {
            self.pending.remove_if(tid, &completion);
            return Err(err);
        }
        Ok(Some(completion))
    }

    /// Report `target` to `supervisor` when this connection closes.
    pub fn link(&self, target: &BinderUri, supervisor: Arc<dyn Supervisor>) {
        let mut linked = lock(&self.supervisors);
        if self.connection.is_open() {
            linked.push((target.clone(), supervisor));
            return;
        }
        drop(linked);
        supervisor.on_exit(target);
    }

    pub fn unlink(&self, target: &BinderUri, supervisor: &Arc<dyn Supervisor>) {
        lock(&self.supervisors)
            .retain(|(uri, linked)| !(uri == target && Arc::ptr_eq(linked, supervisor)));
    }

    /// Run `hook` after this client's connection closes and linked
    /// supervisors have been told.
    pub(crate) fn on_closed<F>(&self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.connection.on_closed(hook);
    }

    pub fn close(&self, reason: &str) {
        self.connection.close(reason);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("node_id", &self.node_id)
            .field("address", &self.address.to_string())
            .field("connection", &self.connection)
            .finish()
    }
}

fn notify_linked(linked: &Mutex<Linked>) {
    let exited: Linked = lock(linked).drain(..).collect();
    for (target, supervisor) in exited {
        supervisor.on_exit(&target);
    }
}
