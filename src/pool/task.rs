//! Task and parcel types.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::OwnedSemaphorePermit;
use tokio::time::Instant;

/// Opaque payload carried by a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Parcel {
    #[serde(rename = "ID")]
    pub id: String,
    /// Timestamp supplied by the originating request.
    #[serde(rename = "Time")]
    pub time: DateTime<Utc>,
    #[serde(rename = "Data")]
    pub data: String,
}

impl Parcel {
    pub fn new(id: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            time: Utc::now(),
            data: data.into(),
        }
    }
}

/// One unit of deferred work.
///
/// Deliberately not `Clone`: a task moves from the intake queue to the
/// dispatcher and then to exactly one worker, which drops it when done.
#[derive(Debug)]
pub struct Task {
    /// Admission instant, used for latency at completion.
    pub arrived_at: Instant,
    pub parcel: Parcel,
    /// Dispatcher in-flight slot, released when the task is dropped.
    lease: Option<OwnedSemaphorePermit>,
}

impl Task {
    /// Admit a parcel now.
    pub fn new(parcel: Parcel) -> Self {
        Self::with_arrival(parcel, Instant::now())
    }

    /// Admit a parcel with an explicit arrival instant (shared across a batch).
    pub fn with_arrival(parcel: Parcel, arrived_at: Instant) -> Self {
        Self {
            arrived_at,
            parcel,
            lease: None,
        }
    }

    pub(crate) fn hold_lease(&mut self, permit: OwnedSemaphorePermit) {
        self.lease = Some(permit);
    }

    pub fn parcel_id(&self) -> &str {
        &self.parcel.id
    }

    /// Time elapsed since admission.
    pub fn latency(&self) -> Duration {
        self.arrived_at.elapsed()
    }
}
