//! Intake queue — the bounded buffer between admission and the dispatcher.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{ConfigError, IntakeError};
use crate::pool::task::{Parcel, Task};

/// Create an intake queue holding at most `capacity` pending tasks.
///
/// The receiver goes to [`crate::pool::Dispatcher::dispatch`]. Dropping every
/// [`Intake`] closes the queue.
pub fn channel(capacity: usize) -> Result<(Intake, mpsc::Receiver<Task>), ConfigError> {
    if capacity == 0 {
        return Err(ConfigError::invalid(
            crate::config::MAX_QUEUE_ENV,
            "queue capacity must be at least 1",
        ));
    }
    let (tx, rx) = mpsc::channel(capacity);
    Ok((Intake { tx }, rx))
}

/// Producer side of the intake queue.
#[derive(Debug, Clone)]
pub struct Intake {
    tx: mpsc::Sender<Task>,
}

impl Intake {
    /// Admit a parcel, waiting for room in the queue.
    pub async fn submit(&self, parcel: Parcel) -> Result<(), IntakeError> {
        self.send(Task::new(parcel)).await
    }

    /// Admit a parcel or reject it immediately when the queue is full.
    pub fn try_submit(&self, parcel: Parcel) -> Result<(), IntakeError> {
        debug!(parcel_id = %parcel.id, "Received parcel");
        self.tx
            .try_send(Task::new(parcel))
            .map_err(|e| match e {
                TrySendError::Full(task) => IntakeError::Full {
                    parcel_id: task.parcel.id,
                },
                TrySendError::Closed(task) => IntakeError::Closed {
                    parcel_id: task.parcel.id,
                },
            })
    }

    /// Admit parcels that arrived together; they share one arrival instant.
    ///
    /// Returns the number admitted. Stops at the first rejection.
    pub async fn submit_batch<I>(&self, parcels: I) -> Result<usize, IntakeError>
    where
        I: IntoIterator<Item = Parcel>,
    {
        let arrived_at = Instant::now();
        let mut admitted = 0;
        for parcel in parcels {
            self.send(Task::with_arrival(parcel, arrived_at)).await?;
            admitted += 1;
        }
        Ok(admitted)
    }

    /// Enqueue an already-built task.
    pub async fn send(&self, task: Task) -> Result<(), IntakeError> {
        debug!(parcel_id = %task.parcel_id(), "Received parcel");
        self.tx
            .send(task)
            .await
            .map_err(|mpsc::error::SendError(task)| IntakeError::Closed {
                parcel_id: task.parcel.id,
            })
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }

    pub fn max_capacity(&self) -> usize {
        self.tx.max_capacity()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
