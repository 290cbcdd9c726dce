use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, error};

use crate::error::{ExecutorError, Result};
use crate::executor::{join_bounded, Task};
use crate::lock;

/// Runs tasks at (or shortly after) a deadline on one dedicated thread.
///
/// Used for transaction timeouts: scheduling is cheap, and a task whose
/// promise already settled simply finds nothing to do.
pub struct Scheduler {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    queue: Mutex<Queue>,
    wakeup: Condvar,
}

struct Queue {
    entries: BinaryHeap<Entry>,
    next_seq: u64,
    stopped: bool,
}

struct Entry {
    deadline: Instant,
    seq: u64,
    task: Task,
}

// Min-heap on (deadline, seq): earliest deadline first, FIFO among equals.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl Scheduler {
    /// Start the timer thread.
    pub fn new(name: &str) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                entries: BinaryHeap::new(),
                next_seq: 0,
                stopped: false,
            }),
            wakeup: Condvar::new(),
        });

        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || timer_loop(&thread_shared))
            .map_err(|source| ExecutorError::Spawn {
                name: name.to_string(),
                source,
            })?;

        Ok(Self {
            shared,
            thread: Mutex::new(Some(handle)),
        })
    }

    /// Run `task` once `deadline` has passed.
    ///
    /// Returns `false` (and drops the task) if the scheduler was shut down.
    pub fn schedule_at<F>(&self, deadline: Instant, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut queue = lock(&self.shared.queue);
        if queue.stopped {
            return false;
        }
        let seq = queue.next_seq;
        queue.next_seq = queue.next_seq.wrapping_add(1);
        queue.entries.push(Entry {
            deadline,
            seq,
            task: Box::new(task),
        });
        drop(queue);
        self.shared.wakeup.notify_one();
        true
    }

    /// Run `task` after `delay`.
    pub fn schedule_after<F>(&self, delay: Duration, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.schedule_at(Instant::now() + delay, task)
    }

    /// Number of tasks waiting for their deadline.
    pub fn pending(&self) -> usize {
        lock(&self.shared.queue).entries.len()
    }

    /// Stop the timer thread. Tasks that have not fired are dropped.
    pub fn shutdown(&self, timeout: Duration) {
        {
            let mut queue = lock(&self.shared.queue);
            queue.stopped = true;
            queue.entries.clear();
        }
        self.shared.wakeup.notify_all();
        if let Some(handle) = lock(&self.thread).take() {
            if !join_bounded(handle, timeout) {
                error!("scheduler thread did not exit before timeout");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shutdown(Duration::from_secs(1));
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

fn timer_loop(shared: &Shared) {
    let mut queue = lock(&shared.queue);
    loop {
        if queue.stopped {
            debug!("scheduler stopped");
            return;
        }

        let now = Instant::now();
        let next_deadline = queue.entries.peek().map(|entry| entry.deadline);
        match next_deadline {
            None => {
                queue = shared
                    .wakeup
                    .wait(queue)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            Some(deadline) if deadline <= now => {
                if let Some(entry) = queue.entries.pop() {
                    drop(queue);
                    if catch_unwind(AssertUnwindSafe(entry.task)).is_err() {
                        error!("scheduled task panicked");
                    }
                    queue = lock(&shared.queue);
                }
            }
            Some(deadline) => {
                let (guard, _) = shared
                    .wakeup
                    .wait_timeout(queue, deadline - now)
                    .unwrap_or_else(PoisonError::into_inner);
                queue = guard;
            }
        }
    }
}
