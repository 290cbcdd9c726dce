//! Location-transparent object invocation between nodes.
//!
//! A [`Runtime`] owns one node's binder table, its transport plugins and the
//! threads that serve them. Objects are exposed as [`Stub`]s, addressed by
//! [`BinderUri`]s, and called through [`Proxy`]s that either dispatch
//! in-process or go over the TCP wire transport, with the same observable
//! result either way: a [`Completion`] that settles exactly once.

pub mod binder;
pub mod config;
pub mod error;
pub mod id;
pub mod interface;
pub mod marshal;
pub mod plugin;
pub mod proxy;
pub mod runtime;
pub mod stub;
pub mod uri;
pub mod wire;

pub use binder::BinderTable;
pub use config::{Configuration, NodeConfig, RuntimeConfig, ServiceConfig};
pub use error::{BinderError, ConfigError, Result, RuntimeError};
pub use id::BinderId;
pub use interface::{Interface, InterfaceRegistry};
pub use plugin::{Plugin, PluginContext, Supervisor, TransactFlags};
pub use proxy::{Proxy, ProxyKind};
pub use runtime::Runtime;
pub use stub::{Reply, Stub, StubBuilder};
pub use uri::{BinderUri, WIRE_SCHEME};
pub use wire::WirePlugin;

pub use bytes::Bytes;

/// Completion handle for a binder transaction.
pub type Completion = nodebind_promise::Promise<Bytes, BinderError>;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
