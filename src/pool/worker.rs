//! Pool worker: advertises its slot, executes one task at a time.

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::WorkerError;
use crate::pool::handler::TaskHandler;
use crate::pool::stats::PoolStats;
use crate::pool::task::Task;

/// Observable worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Slot published, waiting for a task or a stop request.
    Advertising,
    /// Running a task's handler.
    Executing,
    /// Exited; never advertises again.
    Stopped,
}

impl WorkerState {
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Advertising, Executing) | (Advertising, Stopped) | (Executing, Advertising) |
            // a stop request queued during execution is honoured before re-advertising
            (Executing, Stopped)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Advertising => "advertising",
            Self::Executing => "executing",
            Self::Stopped => "stopped",
        };
        write!(f, "{s}")
    }
}

/// A ready worker's private slot, published on the shared advertisement channel.
#[derive(Debug)]
pub struct Advertisement {
    worker_id: usize,
    slot: mpsc::Sender<Task>,
}

impl Advertisement {
    pub fn worker_id(&self) -> usize {
        self.worker_id
    }

    /// Hand a task to the advertised worker.
    ///
    /// Gives the task back if the worker stopped after advertising.
    pub async fn deliver(self, task: Task) -> Result<(), Task> {
        self.slot
            .send(task)
            .await
            .map_err(|mpsc::error::SendError(task)| task)
    }
}

/// Summary returned when a worker exits.
#[derive(Debug, Default)]
pub struct WorkerReport {
    pub id: usize,
    pub completed: usize,
    pub failed: usize,
    /// Tasks delivered to the slot but never started because of a stop.
    pub unstarted: Vec<Task>,
}

/// One concurrent execution slot of the pool.
pub struct Worker {
    id: usize,
    handler: Arc<dyn TaskHandler>,
    stats: Arc<PoolStats>,
    slot_tx: mpsc::Sender<Task>,
    slot_rx: mpsc::Receiver<Task>,
    stop_tx: mpsc::Sender<()>,
    stop_rx: mpsc::Receiver<()>,
    state_tx: watch::Sender<WorkerState>,
}

enum Wake {
    Task(Task),
    Stop,
}

impl Worker {
    /// Create a worker with a fresh slot and stop signal.
    pub fn new(id: usize, handler: Arc<dyn TaskHandler>) -> Self {
        let (slot_tx, slot_rx) = mpsc::channel(1);
        let (stop_tx, stop_rx) = mpsc::channel(1);
        let (state_tx, _) = watch::channel(WorkerState::Advertising);
        Self {
            id,
            handler,
            stats: Arc::new(PoolStats::new()),
            slot_tx,
            slot_rx,
            stop_tx,
            stop_rx,
            state_tx,
        }
    }

    /// Share counters with the rest of the pool.
    pub fn with_stats(mut self, stats: Arc<PoolStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn id(&self) -> usize {
        self.id
    }

    /// Run the worker on the current runtime.
    pub fn spawn(self, ads: mpsc::Sender<Advertisement>) -> WorkerHandle {
        let id = self.id;
        let stop_tx = self.stop_tx.clone();
        let state_rx = self.state_tx.subscribe();
        let join = tokio::spawn(self.run(ads));
        WorkerHandle {
            id,
            stop_tx,
            state_rx,
            join,
        }
    }

    /// Advertise, wait, execute, repeat until stopped or the pool goes away.
    pub async fn run(mut self, ads: mpsc::Sender<Advertisement>) -> WorkerReport {
        debug!(worker_id = self.id, "Worker starting");
        let mut report = WorkerReport {
            id: self.id,
            ..Default::default()
        };

        loop {
            if self.stop_rx.try_recv().is_ok() {
                break;
            }

            self.set_state(WorkerState::Advertising);
            self.stats.advertise();
            let ad = Advertisement {
                worker_id: self.id,
                slot: self.slot_tx.clone(),
            };
            if ads.send(ad).await.is_err() {
                self.stats.withdraw();
                debug!(worker_id = self.id, "Advertisement channel closed");
                break;
            }

            let wake = tokio::select! {
                task = self.slot_rx.recv() => match task {
                    Some(task) => Wake::Task(task),
                    None => Wake::Stop,
                },
                _ = self.stop_rx.recv() => Wake::Stop,
            };

            match wake {
                // A stop issued before the task started wins; the task goes back unstarted.
                Wake::Task(task) if self.stop_rx.try_recv().is_ok() => {
                    warn!(
                        worker_id = self.id,
                        parcel_id = %task.parcel_id(),
                        "Stop requested before task started"
                    );
                    report.unstarted.push(task);
                    break;
                }
                Wake::Task(task) => {
                    if self.execute(task).await {
                        report.completed += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                Wake::Stop => break,
            }
        }

        self.slot_rx.close();
        while let Ok(task) = self.slot_rx.try_recv() {
            warn!(
                worker_id = self.id,
                parcel_id = %task.parcel_id(),
                "Task reached a stopped worker"
            );
            report.unstarted.push(task);
        }

        self.set_state(WorkerState::Stopped);
        info!(
            worker_id = self.id,
            completed = report.completed,
            failed = report.failed,
            "Worker stopped"
        );
        report
    }

    fn set_state(&self, next: WorkerState) {
        let prev = self.state_tx.send_replace(next);
        debug_assert!(
            prev == next || prev.can_transition_to(next),
            "worker {} moved from {prev} to {next}",
            self.id
        );
    }

    /// Run one task to completion. Returns whether it succeeded.
    async fn execute(&self, task: Task) -> bool {
        self.set_state(WorkerState::Executing);
        self.stats.begin_execution();
        debug!(worker_id = self.id, parcel_id = %task.parcel_id(), "Received task");

        let outcome = AssertUnwindSafe(self.handler.complete(&task))
            .catch_unwind()
            .await;
        let latency_ms = task.latency().as_millis() as u64;

        let succeeded = match outcome {
            Ok(Ok(())) => {
                info!(
                    worker_id = self.id,
                    parcel_id = %task.parcel_id(),
                    handler = self.handler.name(),
                    latency_ms,
                    "Task completed"
                );
                true
            }
            Ok(Err(e)) => {
                warn!(
                    worker_id = self.id,
                    parcel_id = %task.parcel_id(),
                    handler = self.handler.name(),
                    latency_ms,
                    error = %e,
                    "Task failed"
                );
                false
            }
            Err(payload) => {
                error!(
                    worker_id = self.id,
                    parcel_id = %task.parcel_id(),
                    handler = self.handler.name(),
                    latency_ms,
                    reason = %panic_message(payload.as_ref()),
                    "Task handler panicked"
                );
                false
            }
        };

        self.stats.end_execution(succeeded);
        succeeded
    }
}

/// Control handle for a spawned worker.
#[derive(Debug)]
pub struct WorkerHandle {
    id: usize,
    stop_tx: mpsc::Sender<()>,
    state_rx: watch::Receiver<WorkerState>,
    join: JoinHandle<WorkerReport>,
}

impl WorkerHandle {
    pub fn id(&self) -> usize {
        self.id
    }

    pub fn state(&self) -> WorkerState {
        *self.state_rx.borrow()
    }

    /// Watch state changes.
    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state_rx.clone()
    }

    /// Request a stop and wait for the worker to exit.
    ///
    /// A task already running finishes first. A task delivered to the slot
    /// but not yet started comes back in [`WorkerReport::unstarted`].
    pub async fn stop(self) -> Result<WorkerReport, WorkerError> {
        // Fails only if the worker has already exited.
        let _ = self.stop_tx.send(()).await;
        self.join.await.map_err(|e| {
            if e.is_panic() {
                WorkerError::Panicked {
                    id: self.id,
                    reason: e.to_string(),
                }
            } else {
                WorkerError::JoinFailed {
                    id: self.id,
                    reason: e.to_string(),
                }
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
