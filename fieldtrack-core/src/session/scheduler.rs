//! Cancellable periodic tasks.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// A tokio task that runs a handler on a fixed period.
///
/// The handler returns [`ControlFlow::Break`] to end the task on its own.
/// Dropping the handle aborts the task.
#[derive(Debug)]
pub struct PeriodicTask {
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Spawn `tick` every `period`, the first run after `start_after`.
    ///
    /// Ticks never overlap: a slow handler delays the next one and missed
    /// ticks are skipped rather than bunched up.
    pub fn spawn<F, Fut>(name: &'static str, start_after: Duration, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(Instant::now() + start_after, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                if tick().await.is_break() {
                    tracing::debug!(task = name, "Periodic task finished");
                    break;
                }
            }
        });

        Self { handle }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
