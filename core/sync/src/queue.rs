//! Serial execution of async tasks.

use std::future::Future;
use tokio::sync::Mutex;
use tracing::trace;

/// Runs async tasks one at a time, in submission order.
///
/// A task starts only after every task submitted before it has settled. A
/// task that fails does not affect the ones queued after it. Separate queues
/// are independent of each other.
pub struct SerialTaskQueue {
    name: String,
    // tokio's mutex hands out the lock in FIFO order.
    gate: Mutex<()>,
}

impl SerialTaskQueue {
    /// Create an empty queue.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            gate: Mutex::new(()),
        }
    }

    /// Name used in trace output.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `task` once all previously submitted tasks have settled.
    ///
    /// The future is not polled before its turn comes.
    pub async fn run<Fut, T>(&self, task: Fut) -> T
    where
        Fut: Future<Output = T>,
    {
        let _guard = self.gate.lock().await;
        trace!("Queue {}: task started", self.name());
        let output = task.await;
        trace!("Queue {}: task finished", self.name());
        output
    }
}
