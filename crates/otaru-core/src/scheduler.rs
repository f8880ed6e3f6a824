//! Background task submission.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;

use tracing::{debug, warn};

use otaru_storage::CancelToken;

use crate::error::Result;

pub type TaskId = u64;

/// A unit of background work. It should poll the token between blocking
/// steps and return `Cancelled` once it fires.
pub type Task = Box<dyn FnOnce(&CancelToken) -> Result<()> + Send + 'static>;

pub trait Scheduler: Send + Sync {
    /// Start `task` right away. Failures are logged by the scheduler.
    fn run_immediately(&self, name: &str, task: Task) -> TaskId;
}

/// Runs every task on its own OS thread.
pub struct ThreadScheduler {
    token: CancelToken,
    next_id: AtomicU64,
    running: Mutex<Vec<(TaskId, JoinHandle<()>)>>,
}

impl ThreadScheduler {
    pub fn new() -> Self {
        Self {
            token: CancelToken::new(),
            next_id: AtomicU64::new(1),
            running: Mutex::new(Vec::new()),
        }
    }

    /// Block until every submitted task (including ones submitted while
    /// waiting) has returned.
    pub fn wait_all(&self) {
        loop {
            let handles = std::mem::take(&mut *self.running.lock().unwrap());
            if handles.is_empty() {
                return;
            }
            for (id, handle) in handles {
                if handle.join().is_err() {
                    warn!(task_id = id, "background task panicked");
                }
            }
        }
    }

    /// Cancel all tasks and wait for them. Tasks submitted afterwards see a
    /// cancelled token.
    pub fn abort_all(&self) {
        self.token.cancel();
        self.wait_all();
    }

    pub fn num_running(&self) -> usize {
        self.running
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, h)| !h.is_finished())
            .count()
    }
}

impl Default for ThreadScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler for ThreadScheduler {
    fn run_immediately(&self, name: &str, task: Task) -> TaskId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = self.token.clone();
        let task_name = name.to_string();
        let spawned = std::thread::Builder::new()
            .name(format!("otaru-task-{id}"))
            .spawn(move || {
                debug!(task_id = id, task = %task_name, "task started");
                match task(&token) {
                    Ok(()) => debug!(task_id = id, task = %task_name, "task finished"),
                    Err(e) => warn!(task_id = id, task = %task_name, error = %e, "task failed"),
                }
            });

        let mut running = self.running.lock().unwrap();
        running.retain(|(_, h)| !h.is_finished());
        match spawned {
            Ok(handle) => running.push((id, handle)),
            Err(e) => warn!(task_id = id, task = name, error = %e, "failed to spawn task thread"),
        }
        id
    }
}

impl Drop for ThreadScheduler {
    fn drop(&mut self) {
        self.wait_all();
    }
}
