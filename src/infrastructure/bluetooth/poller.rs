//! Periodic wake-up primitive.
//!
//! One tokio task per running poller; the callback runs on that task, so
//! invocations never overlap. Late ticks are skipped rather than queued.

use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tracing::debug;

/// Default poll period.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Default)]
pub struct Poller {
    task: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn new() -> Self {
        Self { task: None }
    }

    /// Start invoking `tick` every `period`, the first time immediately.
    /// Does nothing if already running. Must be called from within a tokio
    /// runtime.
    pub fn start<F>(&mut self, period: Duration, mut tick: F)
    where
        F: FnMut() + Send + 'static,
    {
        if self.is_running() {
            return;
        }

        let period = period.max(Duration::from_millis(1));
        debug!("Poller starting with period {:?}", period);
        self.task = Some(tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                tick();
            }
        }));
    }

    /// Cancel future ticks. A tick already executing runs to completion.
    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("Poller stopping");
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        self.stop();
    }
}
