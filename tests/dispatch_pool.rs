//! End-to-end tests for the dispatch pool.
//!
//! Each test builds an intake queue and a dispatcher, runs `dispatch` on a
//! spawned task with a stub handler, and checks delivery, concurrency and
//! failure isolation through the public API.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};

use parcel_dispatch::error::IntakeError;
use parcel_dispatch::intake::{self, Intake};
use parcel_dispatch::pool::{DispatchReport, Dispatcher, Parcel, PoolStats, Task, TaskHandler};

/// Maximum time any test is allowed to run before we consider it hung.
const TEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Records every execution and the highest concurrency observed.
#[derive(Default)]
struct Recorder {
    runs: Mutex<HashMap<String, usize>>,
    spans: Mutex<HashMap<String, (Instant, Instant)>>,
    current: AtomicUsize,
    peak: AtomicUsize,
    delay: Duration,
    fail_ids: HashSet<String>,
}

impl Recorder {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    fn failing(mut self, ids: &[&str]) -> Self {
        self.fail_ids = ids.iter().map(|s| s.to_string()).collect();
        self
    }

    fn runs(&self) -> HashMap<String, usize> {
        self.runs.lock().unwrap().clone()
    }

    fn span(&self, id: &str) -> (Instant, Instant) {
        self.spans.lock().unwrap()[id]
    }
}

#[async_trait]
impl TaskHandler for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn complete(&self, task: &Task) -> anyhow::Result<()> {
        let id = task.parcel_id().to_string();
        let started = Instant::now();
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        self.current.fetch_sub(1, Ordering::SeqCst);
        *self.runs.lock().unwrap().entry(id.clone()).or_default() += 1;
        self.spans
            .lock()
            .unwrap()
            .insert(id.clone(), (started, Instant::now()));

        if self.fail_ids.contains(&id) || self.fail_ids.contains("*") {
            anyhow::bail!("downstream rejected parcel {id}");
        }
        Ok(())
    }
}

/// Blocks every task on a gate until the test releases permits.
struct Gate {
    permits: Arc<Semaphore>,
    started: AtomicUsize,
}

#[async_trait]
impl TaskHandler for Gate {
    async fn complete(&self, _task: &Task) -> anyhow::Result<()> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.permits.acquire().await?.forget();
        Ok(())
    }
}

struct Pool {
    intake: Intake,
    stats: Arc<PoolStats>,
    running: JoinHandle<parcel_dispatch::Result<DispatchReport>>,
}

fn start_pool(workers: usize, queue: usize, handler: Arc<dyn TaskHandler>) -> Pool {
    let (intake, rx) = intake::channel(queue).unwrap();
    let dispatcher = Dispatcher::new(workers).unwrap();
    let stats = dispatcher.stats();
    let running = tokio::spawn(async move { dispatcher.dispatch(rx, handler).await });
    Pool {
        intake,
        stats,
        running,
    }
}

impl Pool {
    async fn finish(self) -> DispatchReport {
        drop(self.intake);
        timeout(TEST_TIMEOUT, self.running)
            .await
            .expect("dispatch did not return")
            .expect("dispatch task panicked")
            .expect("dispatch failed")
    }
}

async fn wait_until(stats: &PoolStats, cond: impl Fn(&parcel_dispatch::pool::StatsSnapshot) -> bool) {
    timeout(TEST_TIMEOUT, async {
        while !cond(&stats.snapshot()) {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition never reached");
}

fn parcel(id: &str) -> Parcel {
    Parcel::new(id, format!("data for {id}"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn every_task_runs_exactly_once() {
    let recorder = Arc::new(Recorder::with_delay(Duration::from_millis(1)));
    let pool = start_pool(4, 16, recorder.clone());

    let ids: Vec<String> = (0..200).map(|i| format!("parcel-{i}")).collect();
    for id in &ids {
        pool.intake.submit(parcel(id)).await.unwrap();
    }
    let report = pool.finish().await;

    let runs = recorder.runs();
    assert_eq!(runs.len(), ids.len());
    assert!(ids.iter().all(|id| runs.get(id) == Some(&1)));
    assert_eq!(report.stats.received, 200);
    assert_eq!(report.stats.handed_off, 200);
    assert_eq!(report.stats.completed, 200);
    assert_eq!(report.stats.dropped, 0);
    assert!(report.stats.settled());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrency_never_exceeds_pool_size() {
    let recorder = Arc::new(Recorder::with_delay(Duration::from_millis(3)));
    let pool = start_pool(3, 64, recorder.clone());

    let batch = (0..60).map(|i| parcel(&format!("p{i}")));
    pool.intake.submit_batch(batch).await.unwrap();
    let report = pool.finish().await;

    assert!(recorder.peak.load(Ordering::SeqCst) <= 3);
    assert!(report.stats.peak_executing <= 3);
    assert_eq!(report.stats.completed, 60);
}

#[tokio::test]
async fn dequeued_tasks_bounded_by_pool_size() {
    let permits = Arc::new(Semaphore::new(0));
    let gate = Arc::new(Gate {
        permits: Arc::clone(&permits),
        started: AtomicUsize::new(0),
    });
    let pool = start_pool(2, 8, gate.clone());

    for i in 0..5 {
        pool.intake.submit(parcel(&format!("g{i}"))).await.unwrap();
    }
    wait_until(&pool.stats, |s| s.executing == 2).await;
    tokio::time::sleep(Duration::from_millis(20)).await;

    // The three tasks no worker can take yet stay in intake.
    let snap = pool.stats.snapshot();
    assert_eq!(gate.started.load(Ordering::SeqCst), 2);
    assert_eq!(snap.received, 2);
    assert_eq!(snap.handed_off, 2);
    assert_eq!(snap.ready, 0);
    assert_eq!(pool.intake.available(), 5);

    permits.add_permits(5);
    let report = pool.finish().await;
    assert_eq!(report.stats.completed, 5);
}

#[tokio::test]
async fn try_submit_rejects_once_pool_and_queue_are_saturated() {
    let permits = Arc::new(Semaphore::new(0));
    let gate = Arc::new(Gate {
        permits: Arc::clone(&permits),
        started: AtomicUsize::new(0),
    });
    let pool = start_pool(1, 1, gate.clone());

    pool.intake.try_submit(parcel("a")).unwrap();
    wait_until(&pool.stats, |s| s.executing == 1).await;

    pool.intake.try_submit(parcel("b")).unwrap();
    let mut rejected = 0;
    for i in 0..100 {
        match pool.intake.try_submit(parcel(&format!("c{i}"))) {
            Err(IntakeError::Full { .. }) => rejected += 1,
            other => panic!("expected a full queue, got {other:?}"),
        }
    }
    assert_eq!(rejected, 100);
    assert_eq!(pool.stats.snapshot().received, 1);

    permits.add_permits(2);
    let report = pool.finish().await;
    assert_eq!(report.stats.received, 2);
    assert_eq!(report.stats.completed, 2);
    assert!(report.stats.settled());
}

#[tokio::test]
async fn failures_do_not_block_the_pipeline() {
    let recorder = Arc::new(Recorder::default().failing(&["*"]));
    let pool = start_pool(2, 4, recorder.clone());

    for i in 0..25 {
        pool.intake.submit(parcel(&format!("f{i}"))).await.unwrap();
    }
    let report = pool.finish().await;

    assert_eq!(report.stats.failed, 25);
    assert_eq!(report.stats.completed, 0);
    assert_eq!(recorder.runs().len(), 25);
    let per_worker: usize = report.workers.iter().map(|w| w.failed).sum();
    assert_eq!(per_worker, 25);
}

#[tokio::test(start_paused = true)]
async fn two_workers_three_tasks() {
    let d = Duration::from_millis(100);
    let recorder = Arc::new(Recorder::with_delay(d));
    let pool = start_pool(2, 8, recorder.clone());

    let t0 = Instant::now();
    for id in ["A", "B", "C"] {
        pool.intake.submit(parcel(id)).await.unwrap();
    }
    let report = pool.finish().await;
    let elapsed = t0.elapsed();

    let (a_start, a_end) = recorder.span("A");
    let (b_start, b_end) = recorder.span("B");
    let (c_start, _c_end) = recorder.span("C");

    assert_eq!(a_start, b_start);
    assert!(c_start >= a_end.min(b_end));
    assert!(elapsed <= d * 2 + Duration::from_millis(10), "took {elapsed:?}");
    assert_eq!(report.stats.completed, 3);
}

#[tokio::test]
async fn single_worker_survives_failed_task() {
    let recorder = Arc::new(Recorder::with_delay(Duration::from_millis(5)).failing(&["A"]));
    let pool = start_pool(1, 4, recorder.clone());

    pool.intake.submit(parcel("A")).await.unwrap();
    pool.intake.submit(parcel("B")).await.unwrap();
    let report = pool.finish().await;

    let (_, a_end) = recorder.span("A");
    let (b_start, _) = recorder.span("B");
    assert!(b_start >= a_end);
    assert_eq!(report.stats.failed, 1);
    assert_eq!(report.stats.completed, 1);
    assert_eq!(report.workers[0].completed, 1);
    assert_eq!(report.workers[0].failed, 1);
}

#[tokio::test]
async fn idle_pool_keeps_every_worker_advertised() {
    let recorder = Arc::new(Recorder::default());
    let pool = start_pool(3, 4, recorder.clone());

    wait_until(&pool.stats, |s| s.ready == 3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(!pool.running.is_finished());
    let snap = pool.stats.snapshot();
    assert_eq!(snap.ready, 3);
    assert_eq!(snap.executing, 0);
    assert_eq!(snap.received, 0);

    let report = pool.finish().await;
    assert_eq!(report.workers.len(), 3);
    assert!(report.workers.iter().all(|w| w.completed == 0 && w.failed == 0));
    assert_eq!(report.stats.ready, 0);
    assert!(recorder.runs().is_empty());
}

#[tokio::test]
async fn intake_closure_drains_queued_tasks() {
    let recorder = Arc::new(Recorder::with_delay(Duration::from_millis(2)));
    let (intake, rx) = intake::channel(32).unwrap();
    for i in 0..32 {
        intake.try_submit(parcel(&format!("q{i}"))).unwrap();
    }
    // Closed before the dispatcher ever runs.
    drop(intake);

    let dispatcher = Dispatcher::new(4).unwrap();
    let report = timeout(TEST_TIMEOUT, dispatcher.dispatch(rx, recorder.clone()))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(report.stats.completed, 32);
    assert_eq!(recorder.runs().len(), 32);
    assert!(report.workers.iter().all(|w| w.unstarted.is_empty()));
}
