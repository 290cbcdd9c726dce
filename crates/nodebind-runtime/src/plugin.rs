use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nodebind_promise::{Scheduler, ThreadPool};

use crate::binder::BinderTable;
use crate::config::{Configuration, RuntimeConfig};
use crate::error::{BinderError, Result, RuntimeError};
use crate::uri::BinderUri;
use crate::Completion;

/// Per-call options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransactFlags {
    /// Fire and forget: no reply, no completion.
    pub oneway: bool,
    /// Deadline for a two-way call; the transport default applies when unset.
    pub timeout: Option<Duration>,
}

impl TransactFlags {
    pub fn oneway() -> Self {
        Self {
            oneway: true,
            timeout: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Notified when the connection behind a linked binder goes away.
pub trait Supervisor: Send + Sync {
    fn on_exit(&self, target: &BinderUri);
}

impl<F> Supervisor for F
where
    F: Fn(&BinderUri) + Send + Sync,
{
    fn on_exit(&self, target: &BinderUri) {
        self(target)
    }
}

/// Everything a plugin needs from its runtime, handed over at start.
#[derive(Clone)]
pub struct PluginContext {
    pub node_id: u32,
    pub config: Arc<Configuration>,
    pub settings: RuntimeConfig,
    pub binders: Arc<BinderTable>,
    pub scheduler: Arc<Scheduler>,
    pub workers: Arc<ThreadPool>,
}

impl std::fmt::Debug for PluginContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginContext")
            .field("node_id", &self.node_id)
            .finish_non_exhaustive()
    }
}

/// A transport that reaches binders on other nodes, selected by URI scheme.
pub trait Plugin: Send + Sync {
    /// URI scheme this plugin serves.
    fn scheme(&self) -> &'static str;

    fn start(&self, ctx: PluginContext) -> std::result::Result<(), RuntimeError>;

    /// Close every connection. Pending transactions reject.
    fn shutdown(&self);

    /// Send a transaction to a binder on another node.
    ///
    /// Two-way calls yield `Some` completion, oneway calls `None`.
    fn transact(
        &self,
        target: &BinderUri,
        what: i32,
        payload: Bytes,
        flags: TransactFlags,
    ) -> Result<Option<Completion>>;

    /// A proxy for `target` was created.
    fn attach_proxy(&self, _target: &BinderUri) {}

    /// A proxy for `target` was dropped.
    fn detach_proxy(&self, _target: &BinderUri) {}

    /// Open a connection to `node_id` ahead of the first transaction.
    fn connect(&self, node_id: u32) -> Result<()> {
        Err(BinderError::Connection(format!(
            "{} transport cannot connect to node {node_id}",
            self.scheme()
        )))
    }

    /// Close the connection to `node_id`. False if there was none.
    fn disconnect(&self, _node_id: u32) -> bool {
        false
    }

    fn link(&self, target: &BinderUri, supervisor: Arc<dyn Supervisor>) {
        supervisor.on_exit(target);
    }

    fn unlink(&self, _target: &BinderUri, _supervisor: &Arc<dyn Supervisor>) {}

    /// Address accepting inbound connections, if any.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}
