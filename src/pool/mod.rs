//! Worker pool — pull-based dispatch of tasks to a fixed set of workers.
//!
//! Core components:
//! - `task` — Parcel payload and the Task that carries it
//! - `handler` — pluggable work operation (`TaskHandler`)
//! - `worker` — advertise / wait / execute loop with cooperative stop
//! - `dispatcher` — matches intake tasks to advertised workers
//! - `stats` — shared counters for the running pool

pub mod dispatcher;
pub mod handler;
pub mod stats;
pub mod task;
pub mod worker;

pub use dispatcher::{DispatchReport, Dispatcher};
pub use handler::{SimulatedUpload, TaskHandler};
pub use stats::{PoolStats, StatsSnapshot};
pub use task::{Parcel, Task};
pub use worker::{Advertisement, Worker, WorkerHandle, WorkerReport, WorkerState};
