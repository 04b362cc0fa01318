use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

pub type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(u64);

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("scheduler `{0}` is shut down")]
    ShutDown(String),

    #[error("failed to spawn scheduler worker: {0}")]
    Spawn(#[from] io::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub total_scheduled: u64,
    pub total_executed: u64,
    pub total_cancelled: u64,
    pub total_panicked: u64,
    pub currently_scheduled: usize,
}

struct ScheduledTask {
    id: TaskId,
    deadline: Instant,
    task: Task,
}

#[derive(Default)]
struct Queue {
    // sorted by deadline, ties in scheduling order
    tasks: Vec<ScheduledTask>,
    next_id: u64,
    shutdown: bool,
    stats: SchedulerStats,
}

#[derive(Default)]
struct Inner {
    queue: Mutex<Queue>,
    wake: Condvar,
}

/// Runs deferred one-shot tasks on a single worker thread.
///
/// Pending tasks can be cancelled individually or all at once on shutdown.
/// A task that panics is counted and logged; the worker keeps going.
pub struct DelayScheduler {
    name: String,
    inner: Arc<Inner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl DelayScheduler {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Arc::new(Inner::default()),
            worker: Mutex::new(None),
        }
    }

    /// Queues `task` to run once `delay` has elapsed.
    pub fn schedule(&self, delay: Duration, task: Task) -> Result<TaskId, SchedulerError> {
        if self.inner.queue.lock().shutdown {
            return Err(SchedulerError::ShutDown(self.name.clone()));
        }
        self.ensure_worker()?;

        let deadline = Instant::now() + delay;
        let id = {
            let mut queue = self.inner.queue.lock();
            if queue.shutdown {
                return Err(SchedulerError::ShutDown(self.name.clone()));
            }
            let id = TaskId(queue.next_id);
            queue.next_id += 1;

            let at = queue.tasks.partition_point(|t| t.deadline <= deadline);
            queue.tasks.insert(at, ScheduledTask { id, deadline, task });
            queue.stats.total_scheduled += 1;
            queue.stats.currently_scheduled = queue.tasks.len();
            id
        };
        self.inner.wake.notify_one();
        Ok(id)
    }

    /// Removes a pending task. Returns false if it already ran or was never queued.
    pub fn cancel(&self, id: TaskId) -> bool {
        let mut queue = self.inner.queue.lock();
        match queue.tasks.iter().position(|t| t.id == id) {
            Some(index) => {
                queue.tasks.remove(index);
                queue.stats.total_cancelled += 1;
                queue.stats.currently_scheduled = queue.tasks.len();
                true
            }
            None => false,
        }
    }

    /// Drops every pending task and joins the worker. Idempotent.
    pub fn shutdown(&self) {
        let dropped: Vec<ScheduledTask> = {
            let mut queue = self.inner.queue.lock();
            queue.shutdown = true;
            let dropped: Vec<ScheduledTask> = queue.tasks.drain(..).collect();
            queue.stats.total_cancelled += dropped.len() as u64;
            queue.stats.currently_scheduled = 0;
            dropped
        };
        self.inner.wake.notify_all();
        if !dropped.is_empty() {
            debug!(scheduler = %self.name, count = dropped.len(), "dropped pending tasks");
        }
        drop(dropped);

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(scheduler = %self.name, "worker exited abnormally");
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.inner.queue.lock().tasks.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.inner.queue.lock().stats.clone()
    }

    fn ensure_worker(&self) -> Result<(), SchedulerError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let inner = Arc::clone(&self.inner);
        let name = self.name.clone();
        let handle = thread::Builder::new()
            .name(format!("{}-sched", self.name))
            .spawn(move || run_worker(&inner, &name))?;
        *worker = Some(handle);
        Ok(())
    }
}

impl Drop for DelayScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_worker(inner: &Inner, name: &str) {
    let mut queue = inner.queue.lock();
    loop {
        if queue.shutdown {
            break;
        }
        let next = queue.tasks.first().map(|t| t.deadline);
        match next {
            None => inner.wake.wait(&mut queue),
            Some(deadline) if deadline > Instant::now() => {
                inner.wake.wait_until(&mut queue, deadline);
            }
            Some(_) => {
                let due = queue.tasks.remove(0);
                queue.stats.currently_scheduled = queue.tasks.len();
                let outcome = MutexGuard::unlocked(&mut queue, || {
                    panic::catch_unwind(AssertUnwindSafe(due.task))
                });
                match outcome {
                    Ok(()) => queue.stats.total_executed += 1,
                    Err(_) => {
                        queue.stats.total_panicked += 1;
                        warn!(scheduler = %name, "scheduled task panicked");
                    }
                }
            }
        }
    }
    debug!(scheduler = %name, "worker exiting");
}
