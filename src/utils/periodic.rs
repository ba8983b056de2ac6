use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// A cancellable periodic background task.
///
/// Owns the spawned timer loop; `stop` (or dropping the handle) aborts it
/// deterministically instead of leaving the timer to outlive its owner.
/// The first tick fires one full period after spawning.
pub struct PeriodicTask {
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send,
    {
        let handle = tokio::spawn(async move {
            let mut timer = interval(period);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // An interval's first tick completes immediately; skip it so the
            // loop fires on period boundaries only.
            timer.tick().await;
            loop {
                timer.tick().await;
                tick().await;
            }
        });
        Self { handle }
    }

    pub fn stop(&self) {
        self.handle.abort();
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
