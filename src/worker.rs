use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::database::StoreError;
use crate::executor::Executor;
use crate::judge::Judge;
use crate::queue::{Delivery, TaskQueue};
use crate::sandbox::{Isolation, SandboxError, SlotId};
use crate::task::Task;

/// Fixed set of slot tokens
///
/// Holding a [`SlotLease`] is the right to use that slot; dropping it hands the
/// token back. The pool never holds more tokens than it was created with.
pub struct SlotPool {
    tx: mpsc::Sender<SlotId>,
    rx: mpsc::Receiver<SlotId>,
    capacity: usize,
}

impl SlotPool {
    pub fn new(slots: impl IntoIterator<Item = SlotId>) -> Self {
        let slots: Vec<SlotId> = slots.into_iter().collect();
        let capacity = slots.len();
        let (tx, rx) = mpsc::channel(capacity.max(1));
        for slot in slots {
            // Cannot fail: the channel is sized for every slot
            let _ = tx.try_send(slot);
        }
        Self { tx, rx, capacity }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Waits for a free slot
    pub async fn acquire(&mut self) -> Option<SlotLease> {
        let slot = self.rx.recv().await?;
        Some(self.lease(slot))
    }

    pub fn try_acquire(&mut self) -> Option<SlotLease> {
        let slot = self.rx.try_recv().ok()?;
        Some(self.lease(slot))
    }

    fn lease(&self, slot: SlotId) -> SlotLease {
        SlotLease {
            slot,
            tx: self.tx.clone(),
        }
    }
}

/// Exclusive use of one slot until dropped
pub struct SlotLease {
    slot: SlotId,
    tx: mpsc::Sender<SlotId>,
}

impl SlotLease {
    pub fn slot(&self) -> SlotId {
        self.slot
    }
}

impl Drop for SlotLease {
    fn drop(&mut self) {
        if self.tx.try_send(self.slot).is_err() {
            log::error!("Slot {} could not be returned to the pool", self.slot);
        }
    }
}

/// Pulls tasks off the queue and runs each one in its own slot
pub struct Dispatcher {
    judge: Arc<Judge>,
    executor: Arc<Executor>,
    queue: Arc<TaskQueue>,
    pool: SlotPool,
}

impl Dispatcher {
    /// Resets slots `1..=slot_count` and registers them as free
    pub async fn start(
        judge: Arc<Judge>,
        executor: Arc<Executor>,
        queue: Arc<TaskQueue>,
        slot_count: u32,
    ) -> Self {
        for slot in 1..=slot_count {
            // Leftovers of a crashed run; a slot that never existed is fine too
            if let Err(e) = executor.isolation().destroy(slot).await {
                log::debug!("Reset of slot {slot} reported: {e}");
            }
        }
        log::info!("Dispatcher ready with {slot_count} slots");

        Self {
            judge,
            executor,
            queue,
            pool: SlotPool::new(1..=slot_count),
        }
    }

    /// Dispatch loop; returns once `token` is cancelled and running tasks have finished
    pub async fn run(mut self, token: CancellationToken) {
        let mut running = JoinSet::new();

        loop {
            let lease = tokio::select! {
                _ = token.cancelled() => break,
                Some(res) = running.join_next(), if !running.is_empty() => {
                    if let Err(e) = res {
                        log::error!("Task supervisor failed: {e:?}");
                    }
                    continue;
                }
                lease = self.pool.acquire() => lease,
            };
            let Some(lease) = lease else {
                log::error!("Slot pool closed unexpectedly");
                break;
            };

            // Never take more messages than there are free slots
            let mut leases = vec![lease];
            while let Some(lease) = self.pool.try_acquire() {
                leases.push(lease);
            }

            let deliveries = tokio::select! {
                _ = token.cancelled() => break,
                deliveries = self.queue.receive(leases.len()) => deliveries,
            };

            for delivery in deliveries {
                let Some(lease) = leases.pop() else {
                    self.queue.nack(delivery.tag).await;
                    continue;
                };
                running.spawn(supervise(
                    self.judge.clone(),
                    self.executor.clone(),
                    self.queue.clone(),
                    delivery,
                    lease,
                ));
            }
        }

        log::info!(
            "Dispatcher stopping, waiting for {} running tasks",
            running.len()
        );
        while let Some(res) = running.join_next().await {
            if let Err(e) = res {
                log::error!("Task supervisor failed: {e:?}");
            }
        }
        log::info!("Dispatcher has shut down gracefully");
    }
}

/// Owns one delivery and its slot from start to release
///
/// The task body runs in a separate tokio task so that a panic inside it is
/// observed here: the delivery is then requeued and the slot still destroyed.
async fn supervise(
    judge: Arc<Judge>,
    executor: Arc<Executor>,
    queue: Arc<TaskQueue>,
    delivery: Delivery,
    lease: SlotLease,
) {
    let slot = lease.slot();
    let Delivery { tag, task } = delivery;

    let body = tokio::spawn(run_task(judge, executor.clone(), task, slot));
    match body.await {
        Ok(Ok(())) => queue.ack(tag).await,
        // Nothing left to update, redelivery would fail the same way
        Ok(Err(StoreError::NotFound(id))) => {
            log::warn!("Dropping task from slot {slot} for unknown submission {id}");
            queue.ack(tag).await;
        }
        Ok(Err(e)) => {
            log::error!("Failed to record result from slot {slot}, requeueing: {e}");
            queue.nack(tag).await;
        }
        Err(e) => {
            log::error!("Task on slot {slot} aborted, requeueing: {e}");
            queue.nack(tag).await;
        }
    }

    if let Err(e) = executor.isolation().destroy(slot).await {
        log::error!("{e}");
    }
    drop(lease);
}

async fn run_task(
    judge: Arc<Judge>,
    executor: Arc<Executor>,
    task: Task,
    slot: SlotId,
) -> Result<(), StoreError> {
    let submission_id = task.submission_id();
    log::info!(
        "Running {} task of submission {submission_id} on slot {slot}",
        task.kind()
    );

    let outcome = match init_slot(executor.isolation().as_ref(), slot).await {
        Ok(work_dir) => executor.execute(&task, slot, &work_dir).await,
        Err(e) => Err(e.into()),
    };

    match outcome {
        Ok(result) => judge.handle_result(result).await,
        Err(e) => {
            log::error!(
                "{} task of submission {submission_id} failed on slot {slot}: {e}",
                task.kind()
            );
            match judge.abandon(submission_id, e.to_string()).await {
                Err(StoreError::NotFound(id)) => {
                    log::warn!("Submission {id} vanished before it could be terminated");
                    Ok(())
                }
                other => other.map(|_| ()),
            }
        }
    }
}

/// Initializes a slot, clearing stale state left behind by an earlier occupant
async fn init_slot(isolation: &dyn Isolation, slot: SlotId) -> Result<PathBuf, SandboxError> {
    match isolation.init(slot).await {
        Err(SandboxError::Conflict(_)) => {
            log::warn!("Slot {slot} was still live, destroying it first");
            isolation.destroy(slot).await?;
            isolation.init(slot).await
        }
        other => other,
    }
}
