//! Background scheduler and worker pool.
//!
//! One scheduler task polls for due cursors of active loadouts and feeds a
//! bounded queue; `workers` tasks drain it. A cursor sits in the queue at
//! most once; the claim's compare-and-swap still guards against other
//! processes polling the same store.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use loadout_core::config::EngineConfig;
use loadout_core::domain::execution::{CursorId, ExecutionCursor};

use crate::runner::ChainRunner;

#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub workers: usize,
    pub poll_interval: Duration,
    pub batch_size: u32,
    pub queue_capacity: usize,
}

impl From<&EngineConfig> for PoolSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            workers: config.workers.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(10)),
            batch_size: config.batch_size.max(1),
            queue_capacity: config.queue_capacity.max(1),
        }
    }
}

/// Cursor ids handed to the queue and not yet released by a worker.
#[derive(Clone, Default)]
struct QueuedCursors {
    ids: Arc<Mutex<HashSet<CursorId>>>,
}

impl QueuedCursors {
    /// Returns false when the cursor is already queued or being processed.
    async fn admit(&self, id: &CursorId) -> bool {
        self.ids.lock().await.insert(id.clone())
    }

    async fn release(&self, id: &CursorId) {
        self.ids.lock().await.remove(id);
    }
}

/// Running engine tasks. Dropping the handle without calling
/// [`EngineHandle::shutdown`] leaves the tasks running.
pub struct EngineHandle {
    runner: Arc<ChainRunner>,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn worker_count(&self) -> usize {
        self.tasks.len().saturating_sub(1)
    }

    /// Stops scheduling and tells workers to halt before their next step.
    /// Tasks still busy when `grace` runs out are logged and awaited, never
    /// aborted: a dispatch cut off mid-call would strand a reserved ledger
    /// entry.
    pub async fn shutdown(self, grace: Duration) {
        self.runner.begin_shutdown();
        let deadline = tokio::time::Instant::now() + grace;
        let mut overdue = 0;

        for mut task in self.tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                overdue += 1;
                warn!(
                    event_name = "engine.pool.shutdown_overdue",
                    grace_ms = grace.as_millis() as u64,
                    "worker still finishing a step after the grace period"
                );
                if let Err(error) = task.await {
                    warn!(event_name = "engine.pool.task_failed", error = %error, "task failed");
                }
            }
        }

        info!(event_name = "engine.pool.stopped", overdue, "engine worker pool stopped");
    }
}

pub fn spawn(runner: Arc<ChainRunner>, settings: PoolSettings) -> EngineHandle {
    let shutdown_rx = runner.shutdown_signal();
    let (queue, receiver) = mpsc::channel(settings.queue_capacity);
    let receiver = Arc::new(Mutex::new(receiver));
    let queued = QueuedCursors::default();

    let mut tasks = Vec::with_capacity(settings.workers + 1);
    tasks.push(tokio::spawn(schedule(
        runner.clone(),
        queue,
        queued.clone(),
        shutdown_rx.clone(),
        settings.poll_interval,
        settings.batch_size,
    )));
    for index in 0..settings.workers {
        tasks.push(tokio::spawn(work(
            format!("worker-{}-{index}", std::process::id()),
            runner.clone(),
            receiver.clone(),
            queued.clone(),
            shutdown_rx.clone(),
        )));
    }

    info!(
        event_name = "engine.pool.started",
        workers = settings.workers,
        poll_interval_ms = settings.poll_interval.as_millis() as u64,
        batch_size = settings.batch_size,
        "engine worker pool started"
    );
    EngineHandle { runner, tasks }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

async fn schedule(
    runner: Arc<ChainRunner>,
    queue: mpsc::Sender<ExecutionCursor>,
    queued: QueuedCursors,
    mut shutdown: watch::Receiver<bool>,
    poll_interval: Duration,
    batch_size: u32,
) {
    let mut ticker = tokio::time::interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        match runner.recover_leases().await {
            Ok(0) => {}
            Ok(recovered) => {
                info!(event_name = "engine.lease.recovered_batch", recovered, "leases recovered")
            }
            Err(error) => {
                warn!(
                    event_name = "engine.scheduler.error",
                    error = %error,
                    "lease recovery failed"
                )
            }
        }

        let due = match runner.due_cursors(batch_size).await {
            Ok(due) => due,
            Err(error) => {
                warn!(
                    event_name = "engine.scheduler.error",
                    error = %error,
                    "could not list due cursors"
                );
                continue;
            }
        };

        let mut handed_out = 0;
        for cursor in due {
            let id = cursor.id.clone();
            if !queued.admit(&id).await {
                continue;
            }
            tokio::select! {
                _ = stopped(&mut shutdown) => {
                    queued.release(&id).await;
                    return;
                }
                sent = queue.send(cursor) => {
                    if sent.is_err() {
                        queued.release(&id).await;
                        return;
                    }
                    handed_out += 1;
                }
            }
        }
        if handed_out > 0 {
            debug!(event_name = "engine.scheduler.tick", queued = handed_out, "queued due cursors");
        }
    }
}

async fn work(
    worker_id: String,
    runner: Arc<ChainRunner>,
    receiver: Arc<Mutex<mpsc::Receiver<ExecutionCursor>>>,
    queued: QueuedCursors,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let next = {
            let mut receiver = receiver.lock().await;
            tokio::select! {
                biased;
                _ = stopped(&mut shutdown) => None,
                cursor = receiver.recv() => cursor,
            }
        };
        let Some(cursor) = next else {
            break;
        };

        let cursor_id = cursor.id.clone();
        match runner.process(cursor, &worker_id).await {
            Ok(report) => debug!(
                event_name = "engine.worker.processed",
                worker_id = %worker_id,
                cursor_id = %report.cursor_id.0,
                steps = report.outcomes.len(),
                halted = ?report.halted,
                "cursor processed"
            ),
            Err(error) => warn!(
                event_name = "engine.worker.error",
                worker_id = %worker_id,
                error = %error,
                "cursor processing failed"
            ),
        }
        queued.release(&cursor_id).await;
    }
}
