use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use tracing::{debug, error, warn};

use crate::error::{ExecutorError, Result};
use crate::lock;

const JOIN_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// A unit of deferred work.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Something that runs tasks, now or later, on some thread.
pub trait Executor: Send + Sync {
    /// Run `task`. Implementations must not drop it silently.
    fn execute(&self, task: Task);
}

/// Runs every task immediately on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct Inline;

impl Executor for Inline {
    fn execute(&self, task: Task) {
        task();
    }
}

/// Fixed-size worker pool fed by a bounded queue.
///
/// `execute` blocks while the queue is full, which pushes back on whichever
/// thread is producing work (a connection reader, typically).
pub struct ThreadPool {
    name: String,
    capacity: usize,
    sender: Mutex<Option<Sender<Task>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawn `threads` workers sharing a queue of `capacity` tasks.
    pub fn new(name: &str, threads: usize, capacity: usize) -> Result<Self> {
        if threads == 0 {
            return Err(ExecutorError::InvalidConfig(
                "thread count must be greater than zero".to_string(),
            ));
        }
        if capacity == 0 {
            return Err(ExecutorError::InvalidConfig(
                "queue capacity must be greater than zero".to_string(),
            ));
        }

        let (sender, receiver) = bounded::<Task>(capacity);
        let mut workers = Vec::with_capacity(threads);
        for index in 0..threads {
            let thread_name = format!("{name}-{index}");
            let receiver = receiver.clone();
            let handle = std::thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || worker_loop(receiver))
                .map_err(|source| ExecutorError::Spawn {
                    name: thread_name,
                    source,
                })?;
            workers.push(handle);
        }
        debug!(pool = name, threads, capacity, "thread pool started");

        Ok(Self {
            name: name.to_string(),
            capacity,
            sender: Mutex::new(Some(sender)),
            workers: Mutex::new(workers),
        })
    }

    /// Queue a task without blocking.
    pub fn try_execute(&self, task: Task) -> Result<()> {
        let sender = lock(&self.sender).clone().ok_or(ExecutorError::Shutdown)?;
        sender.try_send(task).map_err(|err| match err {
            TrySendError::Full(_) => ExecutorError::QueueFull {
                capacity: self.capacity,
            },
            TrySendError::Disconnected(_) => ExecutorError::Shutdown,
        })
    }

    /// Number of worker threads still owned by the pool.
    pub fn threads(&self) -> usize {
        lock(&self.workers).len()
    }

    /// Stop accepting tasks, let workers drain the queue and join them.
    ///
    /// Returns `false` if some worker did not exit within `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        lock(&self.sender).take();
        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        let deadline = Instant::now() + timeout;
        let mut clean = true;
        for handle in workers {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !join_bounded(handle, remaining) {
                clean = false;
            }
        }
        if !clean {
            warn!(pool = %self.name, "worker threads did not exit before timeout");
        }
        clean
    }
}

impl Executor for ThreadPool {
    fn execute(&self, task: Task) {
        let sender = lock(&self.sender).clone();
        match sender {
            Some(sender) => {
                if let Err(err) = sender.send(task) {
                    warn!(pool = %self.name, "pool closed while queueing; running task inline");
                    (err.into_inner())();
                }
            }
            None => {
                warn!(pool = %self.name, "pool shut down; running task inline");
                task();
            }
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(1));
    }
}

impl std::fmt::Debug for ThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadPool")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .finish()
    }
}

fn worker_loop(receiver: Receiver<Task>) {
    while let Ok(task) = receiver.recv() {
        if catch_unwind(AssertUnwindSafe(task)).is_err() {
            error!("task panicked on worker thread");
        }
    }
}

/// Join a thread, giving up after `timeout`.
///
/// A handle for the calling thread itself is never joined. Returns `true`
/// only if the thread finished and was joined.
pub fn join_bounded(handle: JoinHandle<()>, timeout: Duration) -> bool {
    if handle.thread().id() == std::thread::current().id() {
        return false;
    }
    let deadline = Instant::now() + timeout;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(JOIN_POLL_INTERVAL);
    }
    handle.join().is_ok()
}
