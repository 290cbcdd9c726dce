use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};

use bytes::Bytes;
use nodebind_promise::Promise;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::error;

use crate::error::{BinderError, Result};
use crate::marshal;
use crate::Completion;

/// What a handler hands back for one transaction.
pub enum Reply {
    /// The result is already known.
    Ready(Result<Bytes>),
    /// The result arrives later; the transaction settles with this promise.
    Deferred(Completion),
}

impl Reply {
    pub fn ok(payload: impl Into<Bytes>) -> Self {
        Reply::Ready(Ok(payload.into()))
    }

    pub fn err(error: BinderError) -> Self {
        Reply::Ready(Err(error))
    }

    fn into_completion(self) -> Completion {
        match self {
            Reply::Ready(result) => Promise::from_result(result),
            Reply::Deferred(promise) => promise,
        }
    }
}

type Handler = Box<dyn Fn(Bytes) -> Reply + Send + Sync>;

/// The receiving end of an interface: a table from opcode to handler.
///
/// Built once with [`StubBuilder`] and immutable afterwards, so one stub can
/// serve transactions from many worker threads at once.
pub struct Stub {
    descriptor: String,
    handlers: HashMap<i32, Handler>,
}

impl Stub {
    pub fn builder(descriptor: impl Into<String>) -> StubBuilder {
        StubBuilder {
            descriptor: descriptor.into(),
            handlers: HashMap::new(),
        }
    }

    /// The interface descriptor this stub implements.
    pub fn descriptor(&self) -> &str {
        &self.descriptor
    }

    pub fn handles(&self, what: i32) -> bool {
        self.handlers.contains_key(&what)
    }

    pub fn opcodes(&self) -> Vec<i32> {
        let mut opcodes: Vec<i32> = self.handlers.keys().copied().collect();
        opcodes.sort_unstable();
        opcodes
    }

    /// Run the handler for `what`.
    ///
    /// Unknown opcodes and panicking handlers reject with
    /// [`BinderError::LocalDispatch`].
    pub fn transact(&self, what: i32, payload: Bytes) -> Completion {
        let Some(handler) = self.handlers.get(&what) else {
            return Promise::rejected(BinderError::LocalDispatch(format!(
                "{} has no handler for opcode {what}",
                self.descriptor
            )));
        };

        match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
            Ok(reply) => reply.into_completion(),
            Err(_) => {
                error!(descriptor = %self.descriptor, what, "stub handler panicked");
                Promise::rejected(BinderError::LocalDispatch(format!(
                    "{} handler for opcode {what} panicked",
                    self.descriptor
                )))
            }
        }
    }
}

impl fmt::Debug for Stub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("descriptor", &self.descriptor)
            .field("opcodes", &self.opcodes())
            .finish()
    }
}

/// Builder for a [`Stub`] dispatch table.
pub struct StubBuilder {
    descriptor: String,
    handlers: HashMap<i32, Handler>,
}

impl StubBuilder {
    /// Raw handler: payload in, [`Reply`] out. Replaces any earlier handler
    /// for the same opcode.
    pub fn on<F>(mut self, what: i32, handler: F) -> Self
    where
        F: Fn(Bytes) -> Reply + Send + Sync + 'static,
    {
        self.handlers.insert(what, Box::new(handler));
        self
    }

    /// Synchronous typed handler.
    pub fn on_call<A, R, F>(self, what: i32, handler: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize,
        F: Fn(A) -> Result<R> + Send + Sync + 'static,
    {
        self.on(what, move |payload| {
            let reply = marshal::decode::<A>(&payload)
                .and_then(&handler)
                .and_then(|value| marshal::encode(&value));
            Reply::Ready(reply)
        })
    }

    /// Asynchronous typed handler; the reply is sent when its promise settles.
    pub fn on_deferred<A, R, F>(self, what: i32, handler: F) -> Self
    where
        A: DeserializeOwned,
        R: Serialize + Clone + Send + 'static,
        F: Fn(A) -> Promise<R, BinderError> + Send + Sync + 'static,
    {
        self.on(what, move |payload| match marshal::decode::<A>(&payload) {
            Ok(args) => Reply::Deferred(
                handler(args).then_result(|result| result.and_then(|value| marshal::encode(&value))),
            ),
            Err(err) => Reply::err(err),
        })
    }

    /// Typed handler for calls that expect no reply.
    pub fn on_oneway<A, F>(self, what: i32, handler: F) -> Self
    where
        A: DeserializeOwned,
        F: Fn(A) + Send + Sync + 'static,
    {
        self.on(what, move |payload| match marshal::decode::<A>(&payload) {
            Ok(args) => {
                handler(args);
                Reply::ok(Bytes::new())
            }
            Err(err) => Reply::err(err),
        })
    }

    pub fn build(self) -> Stub {
        Stub {
            descriptor: self.descriptor,
            handlers: self.handlers,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn echo_stub() -> Stub {
        Stub::builder("test.Echo")
            .on(1, Reply::ok)
            .on_call(2, |name: String| Ok(format!("hello {name}")))
            .on_call(3, |_: ()| Err::<(), _>(BinderError::LocalDispatch("nope".into())))
            .build()
    }

    #[test]
    fn raw_handler_echoes_payload() {
        let stub = echo_stub();
        let result = stub.transact(1, Bytes::from_static(b"raw")).wait();
        assert_eq!(result, Ok(Bytes::from_static(b"raw")));
    }

    #[test]
    fn typed_handler_marshals() {
        let stub = echo_stub();
        let payload = marshal::encode("bob").unwrap();
        let reply = stub.transact(2, payload).wait().unwrap();
        assert_eq!(marshal::decode::<String>(&reply).unwrap(), "hello bob");
    }

    #[test]
    fn handler_error_rejects() {
        let stub = echo_stub();
        let result = stub.transact(3, marshal::encode(&()).unwrap()).wait();
        assert_eq!(result, Err(BinderError::LocalDispatch("nope".into())));
    }

    #[test]
    fn bad_arguments_are_marshal_errors() {
        let stub = echo_stub();
        let result = stub.transact(2, Bytes::from_static(b"{not json")).wait();
        assert!(matches!(result, Err(BinderError::Marshal(_))));
    }

    #[test]
    fn unknown_opcode_is_local_dispatch_error() {
        let stub = echo_stub();
        let result = stub.transact(99, Bytes::new()).wait();
        assert!(matches!(result, Err(BinderError::LocalDispatch(msg)) if msg.contains("99")));
        assert_eq!(stub.opcodes(), vec![1, 2, 3]);
        assert!(!stub.handles(99));
    }

    #[test]
    fn deferred_reply_settles_later() {
        let gate: Promise<String, BinderError> = Promise::new();
        let handed_out = gate.clone();
        let stub = Stub::builder("test.Later")
            .on_deferred(1, move |_: ()| handed_out.clone())
            .build();

        let completion = stub.transact(1, marshal::encode(&()).unwrap());
        assert!(completion.is_pending());
        gate.fulfil("done".to_string());
        let reply = completion.wait().unwrap();
        assert_eq!(marshal::decode::<String>(&reply).unwrap(), "done");
    }

    #[test]
    fn oneway_handler_runs_and_replies_empty() {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let stub = Stub::builder("test.Notify")
            .on_oneway(1, move |n: usize| {
                seen.fetch_add(n, Ordering::SeqCst);
            })
            .build();

        let reply = stub.transact(1, marshal::encode(&5usize).unwrap()).wait();
        assert_eq!(reply, Ok(Bytes::new()));
        assert_eq!(count.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn panicking_handler_rejects() {
        let stub = Stub::builder("test.Panic")
            .on(1, |_| panic!("handler bug"))
            .build();
        let result = stub.transact(1, Bytes::new()).wait();
        assert!(matches!(result, Err(BinderError::LocalDispatch(msg)) if msg.contains("panicked")));
    }
}
