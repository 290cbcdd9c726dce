use std::collections::{HashMap, HashSet};
use std::sync::{Arc, PoisonError, RwLock};

use bytes::Bytes;
use nodebind_promise::Promise;
use tracing::debug;

use crate::error::{BinderError, Result};
use crate::id::BinderId;
use crate::stub::Stub;
use crate::uri::BinderUri;
use crate::Completion;

/// Local objects of one node, keyed by local id.
///
/// Local ids are handed out from a counter starting at 1. Ids reserved for
/// statically configured services are skipped so that those services can
/// later claim them with [`register_with_id`](Self::register_with_id).
pub struct BinderTable {
    node_id: u32,
    reserved: HashSet<u32>,
    state: RwLock<TableState>,
}

struct TableState {
    next_local: u32,
    entries: HashMap<u32, Arc<Stub>>,
}

impl BinderTable {
    pub fn new(node_id: u32, reserved: impl IntoIterator<Item = u32>) -> Self {
        Self {
            node_id,
            reserved: reserved.into_iter().collect(),
            state: RwLock::new(TableState {
                next_local: 1,
                entries: HashMap::new(),
            }),
        }
    }

    pub fn node_id(&self) -> u32 {
        self.node_id
    }

    /// Expose `stub` under the next free local id.
    pub fn register(&self, stub: Arc<Stub>) -> Result<BinderId> {
        let mut state = self.write();
        ensure_unique(&state, &stub)?;

        let start = state.next_local;
        let local = loop {
            let candidate = state.next_local;
            state.next_local = candidate.wrapping_add(1);
            if candidate != 0
                && !self.reserved.contains(&candidate)
                && !state.entries.contains_key(&candidate)
            {
                break candidate;
            }
            if state.next_local == start {
                return Err(BinderError::LocalDispatch(
                    "local binder ids exhausted".to_string(),
                ));
            }
        };

        state.entries.insert(local, stub);
        let id = BinderId::new(self.node_id, local);
        debug!(%id, "binder registered");
        Ok(id)
    }

    /// Expose `stub` under a well-known local id.
    pub fn register_with_id(&self, stub: Arc<Stub>, local_id: u32) -> Result<BinderId> {
        if local_id == 0 {
            return Err(BinderError::LocalDispatch(
                "local id 0 is reserved".to_string(),
            ));
        }
        let mut state = self.write();
        ensure_unique(&state, &stub)?;
        if state.entries.contains_key(&local_id) {
            return Err(BinderError::LocalDispatch(format!(
                "local id {local_id} already taken"
            )));
        }
        state.entries.insert(local_id, stub);
        let id = BinderId::new(self.node_id, local_id);
        debug!(%id, "binder registered with fixed id");
        Ok(id)
    }

    /// Remove a binder. Later transactions to it fail with "target not found".
    pub fn unregister(&self, id: BinderId) -> Option<Arc<Stub>> {
        if id.node_id() != self.node_id {
            return None;
        }
        let removed = self.write().entries.remove(&id.local_id());
        if removed.is_some() {
            debug!(%id, "binder unregistered");
        }
        removed
    }

    pub fn get(&self, id: BinderId) -> Option<Arc<Stub>> {
        if id.node_id() != self.node_id {
            return None;
        }
        self.read().entries.get(&id.local_id()).cloned()
    }

    /// Resolve a target URI received from a peer.
    ///
    /// URIs that fail to parse, name another node, or name an unknown id
    /// resolve to `None`.
    pub fn lookup_uri(&self, uri: &str) -> Option<Arc<Stub>> {
        let uri = BinderUri::parse(uri).ok()?;
        self.get(uri.id())
    }

    /// Dispatch a transaction to a local binder.
    pub fn dispatch(&self, id: BinderId, what: i32, payload: Bytes) -> Completion {
        match self.get(id) {
            Some(stub) => stub.transact(what, payload),
            None => Promise::rejected(BinderError::not_found(id)),
        }
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, TableState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, TableState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for BinderTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinderTable")
            .field("node_id", &self.node_id)
            .field("entries", &self.len())
            .finish()
    }
}

fn ensure_unique(state: &TableState, stub: &Arc<Stub>) -> Result<()> {
    if state
        .entries
        .values()
        .any(|existing| Arc::ptr_eq(existing, stub))
    {
        return Err(BinderError::LocalDispatch("already registered".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::Reply;

    fn stub(name: &str) -> Arc<Stub> {
        Arc::new(Stub::builder(name).on(1, Reply::ok).build())
    }

    #[test]
    fn allocates_sequential_ids_on_own_node() {
        let table = BinderTable::new(4, []);
        let a = table.register(stub("a")).unwrap();
        let b = table.register(stub("b")).unwrap();
        assert_eq!(a, BinderId::new(4, 1));
        assert_eq!(b, BinderId::new(4, 2));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn skips_reserved_ids() {
        let table = BinderTable::new(1, [1, 2, 4]);
        assert_eq!(table.register(stub("a")).unwrap().local_id(), 3);
        assert_eq!(table.register(stub("b")).unwrap().local_id(), 5);
        assert_eq!(
            table.register_with_id(stub("svc"), 2).unwrap(),
            BinderId::new(1, 2)
        );
    }

    #[test]
    fn same_instance_cannot_register_twice() {
        let table = BinderTable::new(1, []);
        let shared = stub("a");
        table.register(Arc::clone(&shared)).unwrap();
        assert_eq!(
            table.register(Arc::clone(&shared)),
            Err(BinderError::LocalDispatch("already registered".into()))
        );
        assert!(table.register_with_id(shared, 9).is_err());
    }

    #[test]
    fn fixed_id_conflicts_are_rejected() {
        let table = BinderTable::new(1, []);
        table.register_with_id(stub("a"), 7).unwrap();
        assert!(table.register_with_id(stub("b"), 7).is_err());
        assert!(table.register_with_id(stub("c"), 0).is_err());
    }

    #[test]
    fn dispatch_reaches_registered_stub() {
        let table = BinderTable::new(1, []);
        let id = table.register(stub("a")).unwrap();
        let reply = table.dispatch(id, 1, Bytes::from_static(b"ping")).wait();
        assert_eq!(reply, Ok(Bytes::from_static(b"ping")));
    }

    #[test]
    fn unregistered_target_is_not_found() {
        let table = BinderTable::new(1, []);
        let id = table.register(stub("a")).unwrap();
        assert!(table.unregister(id).is_some());
        assert!(table.unregister(id).is_none());

        let result = table.dispatch(id, 1, Bytes::new()).wait();
        assert!(matches!(result, Err(BinderError::LocalDispatch(msg)) if msg.starts_with("target not found")));
    }

    #[test]
    fn lookup_uri_checks_node_and_id() {
        let table = BinderTable::new(2, []);
        let id = table.register(stub("a")).unwrap();

        assert!(table.lookup_uri(&format!("rpc://{id}")).is_some());
        assert!(table.lookup_uri(&format!("rpc://{id}/if=a")).is_some());
        assert!(table.lookup_uri("rpc://3.1").is_none());
        assert!(table.lookup_uri("rpc://2.99").is_none());
        assert!(table.lookup_uri("garbage").is_none());
    }

    #[test]
    fn foreign_ids_are_never_local() {
        let table = BinderTable::new(2, []);
        table.register(stub("a")).unwrap();
        assert!(table.get(BinderId::new(3, 1)).is_none());
        assert!(table.unregister(BinderId::new(3, 1)).is_none());
    }
}
