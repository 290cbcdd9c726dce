//! Location-transparent binder objects between nodes.
//!
//! A node exposes objects as stubs; any node holding a binder reference can
//! call them through a proxy and get a promise back, whether the target is
//! in the same process or across a TCP connection.
//!
//! # Crate Structure
//!
//! - [`promise`]: single-assignment completions, executors and timers
//! - [`transport`]: TCP node addresses, listeners and streams
//! - [`frame`]: the binder wire format and blocking frame I/O
//! - [`runtime`]: binder table, stubs, proxies, plugins and the wire transport
//! - [`greeter`]: a small demo interface showing what generated glue looks like

/// Re-export promise types.
pub mod promise {
    pub use nodebind_promise::*;
}

/// Re-export transport types.
pub mod transport {
    pub use nodebind_transport::*;
}

/// Re-export frame types.
pub mod frame {
    pub use nodebind_frame::*;
}

/// Re-export runtime types.
pub mod runtime {
    pub use nodebind_runtime::*;
}

pub mod greeter;

pub use nodebind_promise::Promise;
pub use nodebind_runtime::{
    BinderError, BinderUri, Completion, Configuration, Proxy, Runtime, RuntimeConfig, Stub,
};
