//! Single-assignment completion handles for the nodebind runtime.
//!
//! A [`Promise`] is settled exactly once, either locally (a handler that
//! returns immediately) or from a network reader thread when a reply frame
//! arrives. Continuations attach before or after settlement and run inline on
//! the settling thread or on an explicit [`Executor`].
//!
//! - [`promise`]: the completion handle itself
//! - [`executor`]: inline execution and a bounded worker pool
//! - [`scheduler`]: a single timer thread used for deadlines

pub mod error;
pub mod executor;
pub mod promise;
pub mod scheduler;

pub use error::{ExecutorError, Result};
pub use executor::{join_bounded, Executor, Inline, Task, ThreadPool};
pub use promise::{Promise, Rejection, WeakPromise};
pub use scheduler::Scheduler;

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock a mutex, recovering the guard if a panicking thread poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
