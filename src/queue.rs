use std::collections::{HashMap, VecDeque};

use tokio::sync::{Mutex, Notify};

use crate::task::Task;

/// A task handed out by [`TaskQueue::receive`], identified by its delivery tag
#[derive(Debug)]
pub struct Delivery {
    pub tag: u64,
    pub task: Task,
}

/// In-process task queue with acknowledge-on-completion semantics
///
/// A received task stays in flight until it is acknowledged. A negative
/// acknowledgement puts it back at the front of the queue for redelivery.
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
}

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<Task>,
    in_flight: HashMap<u64, Task>,
    next_tag: u64,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, task: Task) {
        self.inner.lock().await.ready.push_back(task);
        self.notify.notify_one();
    }

    /// Waits until at least one task is ready, then takes up to `max` of them
    pub async fn receive(&self, max: usize) -> Vec<Delivery> {
        if max == 0 {
            return Vec::new();
        }

        loop {
            {
                let mut inner = self.inner.lock().await;
                if !inner.ready.is_empty() {
                    let count = max.min(inner.ready.len());
                    let mut deliveries = Vec::with_capacity(count);
                    for _ in 0..count {
                        let Some(task) = inner.ready.pop_front() else {
                            break;
                        };
                        inner.next_tag += 1;
                        let tag = inner.next_tag;
                        inner.in_flight.insert(tag, task.clone());
                        deliveries.push(Delivery { tag, task });
                    }
                    if !inner.ready.is_empty() {
                        // Leftovers may be picked up by another receiver
                        self.notify.notify_one();
                    }
                    return deliveries;
                }
            }
            self.notify.notified().await;
        }
    }

    /// Marks a delivery as done; unknown tags are ignored
    pub async fn ack(&self, tag: u64) {
        self.inner.lock().await.in_flight.remove(&tag);
    }

    /// Returns an unfinished delivery to the front of the queue
    pub async fn nack(&self, tag: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(task) = inner.in_flight.remove(&tag) {
            inner.ready.push_front(task);
            drop(inner);
            self.notify.notify_one();
        }
    }

    /// Number of tasks waiting to be received
    pub async fn len(&self) -> usize {
        self.inner.lock().await.ready.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of received but unacknowledged tasks
    pub async fn in_flight(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }
}
