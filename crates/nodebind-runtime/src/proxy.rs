use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use nodebind_promise::Promise;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{BinderError, Result};
use crate::marshal;
use crate::plugin::{Supervisor, TransactFlags};
use crate::runtime::Runtime;
use crate::stub::Stub;
use crate::uri::BinderUri;
use crate::Completion;

/// How a proxy reaches its target, decided once at construction.
#[derive(Clone)]
pub enum ProxyKind {
    /// Target lives on this node: call the stub directly, for as long as it
    /// stays registered under the proxy's id.
    Local(Weak<Stub>),
    /// Target lives on another node: go through the runtime's plugin.
    Remote,
}

impl std::fmt::Debug for ProxyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProxyKind::Local(stub) => f
                .debug_tuple("Local")
                .field(&stub.upgrade().map(|stub| stub.descriptor().to_string()))
                .finish(),
            ProxyKind::Remote => f.write_str("Remote"),
        }
    }
}

/// The calling end of a binder reference.
///
/// Local and remote proxies behave the same to callers: every two-way call
/// returns a [`Completion`], and every failure shows up as its rejection.
pub struct Proxy {
    uri: BinderUri,
    kind: ProxyKind,
    descriptor: Option<String>,
    runtime: Runtime,
    timeout: Option<Duration>,
}

impl Proxy {
    pub(crate) fn new(runtime: Runtime, uri: BinderUri, kind: ProxyKind) -> Self {
        let descriptor = match &kind {
            ProxyKind::Local(stub) => stub
                .upgrade()
                .map(|stub| stub.descriptor().to_string())
                .or_else(|| uri.interface().map(str::to_string)),
            ProxyKind::Remote => {
                runtime.attach_proxy(&uri);
                uri.interface().map(str::to_string)
            }
        };
        Self {
            uri,
            kind,
            descriptor,
            runtime,
            timeout: None,
        }
    }

    pub fn uri(&self) -> &BinderUri {
        &self.uri
    }

    pub fn kind(&self) -> &ProxyKind {
        &self.kind
    }

    pub fn is_local(&self) -> bool {
        matches!(self.kind, ProxyKind::Local(_))
    }

    /// Interface descriptor, from the stub for local targets and from the
    /// URI for remote ones.
    pub fn descriptor(&self) -> Option<&str> {
        self.descriptor.as_deref()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Deadline for two-way calls made through this proxy.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn transact(&self, what: i32, payload: Bytes) -> Completion {
        match &self.kind {
            ProxyKind::Local(stub) => {
                let reply = match self.registered(stub) {
                    Some(stub) => stub.transact(what, payload),
                    None => Promise::rejected(BinderError::not_found(self.uri.id())),
                };
                match self.timeout {
                    Some(timeout) if reply.is_pending() => {
                        let bounded = Completion::new();
                        bounded.complete_with(&reply);
                        bounded.or_timeout(timeout, self.runtime.scheduler())
                    }
                    _ => reply,
                }
            }
            ProxyKind::Remote => {
                let flags = TransactFlags {
                    oneway: false,
                    timeout: self.timeout,
                };
                match self.runtime.transact(&self.uri, what, payload, flags) {
                    Ok(Some(completion)) => completion,
                    Ok(None) => Promise::rejected(BinderError::LocalDispatch(
                        "transport returned no completion for a two-way call".to_string(),
                    )),
                    Err(err) => Promise::rejected(err),
                }
            }
        }
    }

    /// Send without waiting for a reply. Only immediate failures (no route,
    /// closed connection) are reported.
    pub fn transact_oneway(&self, what: i32, payload: Bytes) -> Result<()> {
        match &self.kind {
            ProxyKind::Local(stub) => {
                let stub = self
                    .registered(stub)
                    .ok_or_else(|| BinderError::not_found(self.uri.id()))?;
                drop(stub.transact(what, payload));
                Ok(())
            }
            ProxyKind::Remote => self
                .runtime
                .transact(&self.uri, what, payload, TransactFlags::oneway())
                .map(|_| ()),
        }
    }

    /// Typed two-way call.
    pub fn call<A, R>(&self, what: i32, args: &A) -> Promise<R, BinderError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned + Clone + Send + 'static,
    {
        match marshal::encode(args) {
            Ok(payload) => self
                .transact(what, payload)
                .then_result(|result| result.and_then(|reply| marshal::decode::<R>(&reply))),
            Err(err) => Promise::rejected(err),
        }
    }

    /// Typed oneway call.
    pub fn send<A>(&self, what: i32, args: &A) -> Result<()>
    where
        A: Serialize + ?Sized,
    {
        self.transact_oneway(what, marshal::encode(args)?)
    }

    /// Have `supervisor` told when the target's node goes away.
    pub fn link(&self, supervisor: Arc<dyn Supervisor>) {
        self.runtime.link(&self.uri, supervisor);
    }

    pub fn unlink(&self, supervisor: &Arc<dyn Supervisor>) {
        self.runtime.unlink(&self.uri, supervisor);
    }

    /// The stub this proxy was built for, if the binder table still maps
    /// the proxy's id to it.
    fn registered(&self, stub: &Weak<Stub>) -> Option<Arc<Stub>> {
        let current = self.runtime.binders().get(self.uri.id())?;
        std::ptr::eq(Arc::as_ptr(&current), stub.as_ptr()).then_some(current)
    }
}

impl Clone for Proxy {
    fn clone(&self) -> Self {
        let mut proxy = Proxy::new(self.runtime.clone(), self.uri.clone(), self.kind.clone());
        proxy.timeout = self.timeout;
        proxy.descriptor = self.descriptor.clone();
        proxy
    }
}

impl Drop for Proxy {
    fn drop(&mut self) {
        if matches!(self.kind, ProxyKind::Remote) {
            self.runtime.detach_proxy(&self.uri);
        }
    }
}

impl std::fmt::Debug for Proxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Proxy")
            .field("uri", &self.uri.to_string())
            .field("kind", &self.kind)
            .finish()
    }
}
