//! The demo `Greeter` interface.
//!
//! Written by hand the way an interface compiler would emit it: opcode
//! constants, a server-side trait, a function building the stub's dispatch
//! table and a typed proxy.

use std::sync::{Arc, Mutex, PoisonError};

use nodebind_promise::Promise;
use nodebind_runtime::{BinderError, Interface, Proxy, Result, Stub};
use tracing::info;

pub const DESCRIPTOR: &str = "demo.Greeter";

pub const SAY_HELLO: i32 = 1;
pub const SAY_HELLO_ASYNC: i32 = 2;
pub const NOTIFY: i32 = 3;

pub trait Greeter: Send + Sync + 'static {
    fn say_hello(&self, message: &str) -> Result<String>;

    /// Answers later. Defaults to the synchronous answer.
    fn say_hello_async(&self, message: String) -> Promise<String, BinderError> {
        Promise::from_result(self.say_hello(&message))
    }

    /// Oneway.
    fn notify(&self, message: String);
}

/// Answers "Hello" with "Hi there".
#[derive(Debug, Default)]
pub struct FriendlyGreeter {
    notes: Mutex<Vec<String>>,
}

impl FriendlyGreeter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages received through [`Greeter::notify`], oldest first.
    pub fn notes(&self) -> Vec<String> {
        self.notes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl Greeter for FriendlyGreeter {
    fn say_hello(&self, message: &str) -> Result<String> {
        Ok(reply_to(message))
    }

    fn say_hello_async(&self, message: String) -> Promise<String, BinderError> {
        let reply = Promise::new();
        let settle = reply.clone();
        let spawned = std::thread::Builder::new()
            .name("greeter-reply".to_string())
            .spawn(move || {
                settle.fulfil(reply_to(&message));
            });
        if let Err(err) = spawned {
            reply.reject(BinderError::LocalDispatch(format!(
                "failed to spawn reply thread: {err}"
            )));
        }
        reply
    }

    fn notify(&self, message: String) {
        info!(%message, "greeter notified");
        self.notes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
    }
}

pub fn reply_to(message: &str) -> String {
    match message {
        "Hello" => "Hi there".to_string(),
        other => format!("Hi there, you said {other:?}"),
    }
}

/// Dispatch table serving `greeter`.
pub fn stub<G: Greeter>(greeter: Arc<G>) -> Stub {
    let sync = Arc::clone(&greeter);
    let deferred = Arc::clone(&greeter);
    Stub::builder(DESCRIPTOR)
        .on_call(SAY_HELLO, move |message: String| sync.say_hello(&message))
        .on_deferred(SAY_HELLO_ASYNC, move |message: String| {
            deferred.say_hello_async(message)
        })
        .on_oneway(NOTIFY, move |message: String| greeter.notify(message))
        .build()
}

/// Typed calls to a remote or local greeter.
#[derive(Debug, Clone)]
pub struct GreeterProxy {
    proxy: Proxy,
}

impl Interface for GreeterProxy {
    const DESCRIPTOR: &'static str = DESCRIPTOR;

    fn from_proxy(proxy: Proxy) -> Self {
        Self { proxy }
    }
}

impl GreeterProxy {
    pub fn proxy(&self) -> &Proxy {
        &self.proxy
    }

    pub fn say_hello(&self, message: &str) -> Promise<String, BinderError> {
        self.proxy.call(SAY_HELLO, message)
    }

    pub fn say_hello_async(&self, message: &str) -> Promise<String, BinderError> {
        self.proxy.call(SAY_HELLO_ASYNC, message)
    }

    pub fn notify(&self, message: &str) -> Result<()> {
        self.proxy.send(NOTIFY, message)
    }
}
