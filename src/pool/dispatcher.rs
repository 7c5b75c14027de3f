//! Dispatcher — matches intake tasks to whichever worker advertises first.
//!
//! Workers publish a handle to their private slot on a shared advertisement
//! channel sized to the pool. For every task taken off the intake queue the
//! dispatcher spawns a short-lived handoff that waits for one advertisement
//! and delivers the task into that slot, so a slow match never stalls the
//! loop that drains intake.
//!
//! At most `size` tasks are off the intake queue and unfinished at once:
//! each dequeue takes a permit that travels with the task and is released
//! when the worker drops it. Beyond that, work waits in intake, whose
//! capacity is the admission layer's backpressure bound.
//!
//! When intake closes, in-flight handoffs are drained, every handed-off task
//! runs to completion, the workers are stopped, and
//! [`Dispatcher::dispatch`] returns a [`DispatchReport`].

use std::sync::Arc;

use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{ConfigError, Result};
use crate::pool::handler::TaskHandler;
use crate::pool::stats::{PoolStats, StatsSnapshot};
use crate::pool::task::Task;
use crate::pool::worker::{Advertisement, Worker, WorkerHandle, WorkerReport};

type SharedAds = Arc<Mutex<mpsc::Receiver<Advertisement>>>;

/// Outcome of a finished [`Dispatcher::dispatch`] run.
#[derive(Debug)]
pub struct DispatchReport {
    /// One report per worker, ordered by worker id.
    pub workers: Vec<WorkerReport>,
    pub stats: StatsSnapshot,
}

/// Binds a fixed number of workers into a pool.
///
/// [`Dispatcher::dispatch`] consumes the dispatcher, so each pool run owns
/// its counters.
#[derive(Debug)]
pub struct Dispatcher {
    size: usize,
    stats: Arc<PoolStats>,
}

enum Event {
    Task(Task),
    Handoff(std::result::Result<(), JoinError>),
    IntakeClosed,
}

impl Dispatcher {
    /// Create a dispatcher for `size` workers. Nothing is spawned yet.
    pub fn new(size: usize) -> std::result::Result<Self, ConfigError> {
        if size == 0 {
            return Err(ConfigError::invalid(
                crate::config::MAX_WORKERS_ENV,
                "pool size must be at least 1",
            ));
        }
        Ok(Self {
            size,
            stats: Arc::new(PoolStats::new()),
        })
    }

    pub fn from_config(config: &PoolConfig) -> std::result::Result<Self, ConfigError> {
        Self::new(config.max_workers)
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Counters shared with the running pool.
    pub fn stats(&self) -> Arc<PoolStats> {
        Arc::clone(&self.stats)
    }

    /// Start the workers and distribute tasks until `intake` closes.
    pub async fn dispatch(
        self,
        mut intake: mpsc::Receiver<Task>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<DispatchReport> {
        let (ads_tx, ads_rx) = mpsc::channel(self.size);
        let ads: SharedAds = Arc::new(Mutex::new(ads_rx));

        let workers: Vec<WorkerHandle> = (0..self.size)
            .map(|id| {
                Worker::new(id, Arc::clone(&handler))
                    .with_stats(Arc::clone(&self.stats))
                    .spawn(ads_tx.clone())
            })
            .collect();
        // The channel now closes once every worker has exited.
        drop(ads_tx);

        info!(
            workers = self.size,
            handler = handler.name(),
            "Dispatcher started"
        );

        let in_flight = Arc::new(Semaphore::new(self.size));
        let mut handoffs = JoinSet::new();
        loop {
            let event = tokio::select! {
                biased;
                Some(joined) = handoffs.join_next(), if !handoffs.is_empty() => Event::Handoff(joined),
                event = admit(&mut intake, &in_flight) => event,
            };

            match event {
                Event::Task(task) => {
                    self.stats.record_received();
                    handoffs.spawn(hand_off(task, Arc::clone(&ads), Arc::clone(&self.stats)));
                }
                Event::Handoff(joined) => reap(joined),
                Event::IntakeClosed => break,
            }
        }

        info!(
            pending_handoffs = handoffs.len(),
            "Intake closed, draining handoffs"
        );
        while let Some(joined) = handoffs.join_next().await {
            reap(joined);
        }
        // Stop must not strand tasks that are delivered but not yet started.
        self.stats.wait_idle().await;

        let mut reports = Vec::with_capacity(workers.len());
        for worker in workers {
            reports.push(worker.stop().await?);
        }

        for report in &mut reports {
            for task in report.unstarted.drain(..) {
                error!(
                    worker_id = report.id,
                    parcel_id = %task.parcel_id(),
                    "Task stranded in a stopped worker, dropping"
                );
                self.stats.record_dropped();
            }
        }

        // Advertisements left behind by stopped workers.
        let mut ads = ads.lock().await;
        while ads.try_recv().is_ok() {
            self.stats.withdraw();
        }

        let stats = self.stats.snapshot();
        info!(
            received = stats.received,
            completed = stats.completed,
            failed = stats.failed,
            dropped = stats.dropped,
            "Dispatcher stopped"
        );
        Ok(DispatchReport {
            workers: reports,
            stats,
        })
    }
}

/// Take an in-flight permit, then the next task from intake.
async fn admit(intake: &mut mpsc::Receiver<Task>, in_flight: &Arc<Semaphore>) -> Event {
    let Ok(permit) = Arc::clone(in_flight).acquire_owned().await else {
        return Event::IntakeClosed;
    };
    match intake.recv().await {
        Some(mut task) => {
            task.hold_lease(permit);
            Event::Task(task)
        }
        None => Event::IntakeClosed,
    }
}

/// Wait for one advertisement and deliver `task` to that worker.
async fn hand_off(mut task: Task, ads: SharedAds, stats: Arc<PoolStats>) {
    loop {
        // Waiting handoffs queue on the lock in arrival order.
        let ad = ads.lock().await.recv().await;
        let Some(ad) = ad else {
            error!(parcel_id = %task.parcel_id(), "No live worker, dropping task");
            stats.record_dropped();
            return;
        };
        stats.withdraw();

        let worker_id = ad.worker_id();
        match ad.deliver(task).await {
            Ok(()) => {
                stats.record_handed_off();
                debug!(worker_id, "Task handed off");
                return;
            }
            Err(returned) => {
                debug!(
                    worker_id,
                    parcel_id = %returned.parcel_id(),
                    "Stale advertisement, retrying"
                );
                task = returned;
            }
        }
    }
}

fn reap(joined: std::result::Result<(), JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "Handoff task failed");
    }
}
