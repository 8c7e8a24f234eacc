//! Periodic refresh tasks.

use std::future::Future;
use std::ops::ControlFlow;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// A running periodic task. Dropping the handle stops it.
#[derive(Debug)]
pub struct PollHandle {
    task: JoinHandle<()>,
    period: Duration,
}

impl PollHandle {
    /// Spawn `tick` every `period`.
    ///
    /// With `immediate` the first tick fires right away; otherwise after one
    /// full period. A tick that overruns delays the next one instead of
    /// bursting. The task ends when `tick` returns [`ControlFlow::Break`].
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn<F, Fut>(period: Duration, immediate: bool, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ControlFlow<()>> + Send + 'static,
    {
        let period = period.max(Duration::from_millis(1));
        let start = if immediate {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tick().await.is_break() {
                    break;
                }
            }
        });
        Self { task, period }
    }

    /// Interval between ticks.
    #[must_use]
    pub const fn period(&self) -> Duration {
        self.period
    }

    /// Whether the task has ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}
