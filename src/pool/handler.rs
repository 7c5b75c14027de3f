//! Pluggable work operation executed by workers.

use std::ops::Range;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::task::Task;

/// The work a worker performs for one task.
///
/// Failures are reported through the returned error and stay inside the
/// worker that ran the task. Retry or dead-letter policies belong in the
/// implementation, not in the pool.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Handler name for log output.
    fn name(&self) -> &str {
        "task"
    }

    /// Perform the external effect for this task.
    async fn complete(&self, task: &Task) -> anyhow::Result<()>;
}

/// Stand-in for an upload to object storage or a publish to a topic.
///
/// Sleeps for a random duration and succeeds.
#[derive(Debug, Clone)]
pub struct SimulatedUpload {
    delay_ms: Range<u64>,
}

impl SimulatedUpload {
    pub fn new() -> Self {
        Self { delay_ms: 10..60 }
    }

    /// Override the delay range in milliseconds. Empty ranges collapse to `start`.
    pub fn with_delay_ms(mut self, delay_ms: Range<u64>) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    fn pick_delay(&self) -> Duration {
        let ms = if self.delay_ms.is_empty() {
            self.delay_ms.start
        } else {
            rand::thread_rng().gen_range(self.delay_ms.clone())
        };
        Duration::from_millis(ms)
    }
}

impl Default for SimulatedUpload {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskHandler for SimulatedUpload {
    fn name(&self) -> &str {
        "simulated_upload"
    }

    async fn complete(&self, task: &Task) -> anyhow::Result<()> {
        tokio::time::sleep(self.pick_delay()).await;
        tracing::debug!(parcel_id = %task.parcel_id(), bytes = task.parcel.data.len(), "Upload simulated");
        Ok(())
    }
}
