use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError, Weak};
use std::time::{Duration, Instant};

use crate::executor::Executor;
use crate::lock;
use crate::scheduler::Scheduler;

/// Error types a [`Promise`] can reject with.
///
/// The primitive itself produces two failures: an elapsed deadline and a
/// local cancellation. Everything else comes from whoever settles it.
pub trait Rejection: Clone + Send + 'static {
    /// No settlement happened within `after`.
    fn timed_out(after: Duration) -> Self;
    /// The promise was cancelled while pending.
    fn cancelled() -> Self;
}

enum State<T, E> {
    Pending,
    Fulfilled(T),
    Rejected(E),
    Cancelled,
}

impl<T, E> State<T, E> {
    fn name(&self) -> &'static str {
        match self {
            State::Pending => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Rejected(_) => "rejected",
            State::Cancelled => "cancelled",
        }
    }
}

type Continuation<T, E> = Box<dyn FnOnce(Result<T, E>) + Send + 'static>;

/// Where a continuation runs once the promise settles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunOn {
    /// The promise's executor, or the settling thread if it has none.
    Executor,
    /// Always the settling thread.
    Settler,
}

struct Slot<T, E> {
    state: State<T, E>,
    continuations: Vec<(RunOn, Continuation<T, E>)>,
}

struct Inner<T, E> {
    slot: Mutex<Slot<T, E>>,
    settled: Condvar,
    executor: Option<Arc<dyn Executor>>,
}

/// A single-assignment result with chainable continuations.
///
/// Cloning yields another handle to the same slot. Exactly one of
/// [`fulfil`](Self::fulfil), [`reject`](Self::reject) or
/// [`cancel`](Self::cancel) takes effect; later attempts return `false`.
pub struct Promise<T, E> {
    inner: Arc<Inner<T, E>>,
}

/// Non-owning handle, used by deadline tasks.
pub struct WeakPromise<T, E> {
    inner: Weak<Inner<T, E>>,
}

impl<T, E> Clone for Promise<T, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, E> WeakPromise<T, E> {
    /// Recover the promise if any strong handle is still alive.
    pub fn upgrade(&self) -> Option<Promise<T, E>> {
        self.inner.upgrade().map(|inner| Promise { inner })
    }
}

impl<T, E> Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Rejection,
{
    /// A pending promise whose continuations run on the settling thread.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// A pending promise whose continuations run on `executor`.
    pub fn with_executor(executor: Arc<dyn Executor>) -> Self {
        Self::build(Some(executor))
    }

    /// An already fulfilled promise.
    pub fn fulfilled(value: T) -> Self {
        let promise = Self::new();
        promise.fulfil(value);
        promise
    }

    /// An already rejected promise.
    pub fn rejected(error: E) -> Self {
        let promise = Self::new();
        promise.reject(error);
        promise
    }

    /// An already settled promise.
    pub fn from_result(result: Result<T, E>) -> Self {
        let promise = Self::new();
        promise.settle(result);
        promise
    }

    fn build(executor: Option<Arc<dyn Executor>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                slot: Mutex::new(Slot {
                    state: State::Pending,
                    continuations: Vec::new(),
                }),
                settled: Condvar::new(),
                executor,
            }),
        }
    }

    fn derive<U>(&self) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
    {
        Promise::build(self.inner.executor.clone())
    }

    /// Fulfil with `value`. Returns `false` if already settled.
    pub fn fulfil(&self, value: T) -> bool {
        self.transition(State::Fulfilled(value))
    }

    /// Reject with `error`. Returns `false` if already settled.
    pub fn reject(&self, error: E) -> bool {
        self.transition(State::Rejected(error))
    }

    /// Fulfil or reject from a `Result`.
    pub fn settle(&self, result: Result<T, E>) -> bool {
        match result {
            Ok(value) => self.fulfil(value),
            Err(error) => self.reject(error),
        }
    }

    /// Cancel a pending promise.
    ///
    /// Purely local: nothing is sent to whoever was going to settle it, and a
    /// late settlement is ignored.
    pub fn cancel(&self) -> bool {
        self.transition(State::Cancelled)
    }

    /// Settle this promise with whatever `other` settles with.
    pub fn complete_with(&self, other: &Promise<T, E>) {
        let target = self.clone();
        other.on_settled(move |result| {
            target.settle(result);
        });
    }

    pub fn is_pending(&self) -> bool {
        matches!(lock(&self.inner.slot).state, State::Pending)
    }

    pub fn is_done(&self) -> bool {
        !self.is_pending()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(lock(&self.inner.slot).state, State::Cancelled)
    }

    /// True for rejected and cancelled promises.
    pub fn is_rejected(&self) -> bool {
        matches!(
            lock(&self.inner.slot).state,
            State::Rejected(_) | State::Cancelled
        )
    }

    /// The outcome, if settled.
    pub fn try_result(&self) -> Option<Result<T, E>> {
        outcome(&lock(&self.inner.slot).state)
    }

    /// Block the calling thread until the promise settles.
    pub fn wait(&self) -> Result<T, E> {
        let mut slot = lock(&self.inner.slot);
        loop {
            if let Some(result) = outcome(&slot.state) {
                return result;
            }
            slot = self
                .inner
                .settled
                .wait(slot)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Block for at most `timeout`.
    ///
    /// An elapsed wait reports `E::timed_out` but leaves the promise pending.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<T, E> {
        let deadline = Instant::now() + timeout;
        let mut slot = lock(&self.inner.slot);
        loop {
            if let Some(result) = outcome(&slot.state) {
                return result;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(E::timed_out(timeout));
            }
            let (guard, _) = self
                .inner
                .settled
                .wait_timeout(slot, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            slot = guard;
        }
    }

    /// Run `f` with the outcome once settled.
    ///
    /// Fires immediately if already settled; otherwise continuations fire in
    /// attachment order.
    pub fn on_settled<F>(&self, f: F)
    where
        F: FnOnce(Result<T, E>) + Send + 'static,
    {
        self.attach(RunOn::Executor, Box::new(f));
    }

    /// Like [`on_settled`](Self::on_settled), but `f` always runs on the
    /// settling thread, even when the promise has an executor.
    ///
    /// Meant for short bookkeeping that must not queue behind other
    /// continuations.
    pub fn on_settled_inline<F>(&self, f: F)
    where
        F: FnOnce(Result<T, E>) + Send + 'static,
    {
        self.attach(RunOn::Settler, Box::new(f));
    }

    fn attach(&self, run_on: RunOn, continuation: Continuation<T, E>) {
        let ready = {
            let mut slot = lock(&self.inner.slot);
            match outcome(&slot.state) {
                Some(result) => result,
                None => {
                    slot.continuations.push((run_on, continuation));
                    return;
                }
            }
        };
        self.run(run_on, continuation, ready);
    }

    /// Map the fulfilled value.
    pub fn then<U, F>(&self, f: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> U + Send + 'static,
    {
        self.then_result(move |result| result.map(f))
    }

    /// Map the outcome, success or failure.
    pub fn then_result<U, F>(&self, f: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T, E>) -> Result<U, E> + Send + 'static,
    {
        let next = self.derive();
        let target = next.clone();
        self.on_settled(move |result| {
            target.settle(f(result));
        });
        next
    }

    /// Chain another asynchronous step on the fulfilled value.
    pub fn and_then<U, F>(&self, f: F) -> Promise<U, E>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Promise<U, E> + Send + 'static,
    {
        let next = self.derive();
        let target = next.clone();
        self.on_settled(move |result| match result {
            Ok(value) => target.complete_with(&f(value)),
            Err(error) => {
                target.reject(error);
            }
        });
        next
    }

    /// Reject with `E::timed_out(timeout)` unless settled before the deadline.
    pub fn or_timeout(self, timeout: Duration, scheduler: &Scheduler) -> Self {
        if self.is_pending() {
            let weak = self.downgrade();
            scheduler.schedule_after(timeout, move || {
                if let Some(promise) = weak.upgrade() {
                    promise.reject(E::timed_out(timeout));
                }
            });
        }
        self
    }

    /// Fulfil with `value` unless settled before the deadline.
    pub fn complete_on_timeout(self, value: T, timeout: Duration, scheduler: &Scheduler) -> Self {
        if self.is_pending() {
            let weak = self.downgrade();
            scheduler.schedule_after(timeout, move || {
                if let Some(promise) = weak.upgrade() {
                    promise.fulfil(value);
                }
            });
        }
        self
    }

    /// A promise that fulfils `delay` after this one fulfils.
    ///
    /// Failures pass through at once. If the scheduler has shut down the
    /// result is cancelled.
    pub fn delay(&self, delay: Duration, scheduler: &Arc<Scheduler>) -> Self {
        let next = self.derive();
        let target = next.clone();
        let scheduler = Arc::clone(scheduler);
        self.on_settled(move |result| match result {
            Ok(value) => {
                let delayed = target.clone();
                if !scheduler.schedule_after(delay, move || {
                    delayed.fulfil(value);
                }) {
                    target.cancel();
                }
            }
            Err(error) => {
                target.reject(error);
            }
        });
        next
    }

    /// Fulfils with every value, in input order, once all of `promises`
    /// fulfil. The first failure rejects it. An empty slice fulfils at once.
    pub fn all_of(promises: &[Promise<T, E>]) -> Promise<Vec<T>, E> {
        let all: Promise<Vec<T>, E> = Promise::new();
        if promises.is_empty() {
            all.fulfil(Vec::new());
            return all;
        }

        let gathered = Arc::new(Mutex::new(Gathered {
            values: vec![None; promises.len()],
            remaining: promises.len(),
        }));
        for (index, promise) in promises.iter().enumerate() {
            let all = all.clone();
            let gathered = Arc::clone(&gathered);
            promise.on_settled(move |result| match result {
                Ok(value) => {
                    let complete: Option<Vec<T>> = {
                        let mut gathered = lock(&gathered);
                        gathered.values[index] = Some(value);
                        gathered.remaining -= 1;
                        (gathered.remaining == 0).then(|| {
                            gathered.values.iter_mut().filter_map(Option::take).collect()
                        })
                    };
                    if let Some(values) = complete {
                        all.fulfil(values);
                    }
                }
                Err(error) => {
                    all.reject(error);
                }
            });
        }
        all
    }

    /// Settles like whichever of `promises` settles first. An empty slice
    /// never settles.
    pub fn any_of(promises: &[Promise<T, E>]) -> Promise<T, E> {
        let any: Promise<T, E> = Promise::new();
        for promise in promises {
            any.complete_with(promise);
        }
        any
    }

    /// True if both handles refer to the same slot.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn downgrade(&self) -> WeakPromise<T, E> {
        WeakPromise {
            inner: Arc::downgrade(&self.inner),
        }
    }

    fn transition(&self, next: State<T, E>) -> bool {
        let (continuations, result) = {
            let mut slot = lock(&self.inner.slot);
            if !matches!(slot.state, State::Pending) {
                return false;
            }
            slot.state = next;
            let Some(result) = outcome(&slot.state) else {
                return false;
            };
            (std::mem::take(&mut slot.continuations), result)
        };
        self.inner.settled.notify_all();

        for (run_on, continuation) in continuations {
            self.run(run_on, continuation, result.clone());
        }
        true
    }

    fn run(&self, run_on: RunOn, continuation: Continuation<T, E>, result: Result<T, E>) {
        match (run_on, &self.inner.executor) {
            (RunOn::Executor, Some(executor)) => {
                executor.execute(Box::new(move || continuation(result)))
            }
            _ => continuation(result),
        }
    }
}

struct Gathered<T> {
    values: Vec<Option<T>>,
    remaining: usize,
}

impl<T, E> Default for Promise<T, E>
where
    T: Clone + Send + 'static,
    E: Rejection,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for Promise<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = lock(&self.inner.slot).state.name();
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

fn outcome<T: Clone, E: Rejection>(state: &State<T, E>) -> Option<Result<T, E>> {
    match state {
        State::Pending => None,
        State::Fulfilled(value) => Some(Ok(value.clone())),
        State::Rejected(error) => Some(Err(error.clone())),
        State::Cancelled => Some(Err(E::cancelled())),
    }
}
