use std::{future::Future, time::Duration};

use tokio::task::JoinHandle;

/// Handle to a spawned background task that is aborted when dropped.
#[derive(Debug)]
pub struct ScheduledTask {
    handle: JoinHandle<()>,
}

impl ScheduledTask {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
        }
    }

    /// Runs `tick` every `interval`, starting one interval from now.
    pub fn repeating<F, Fut>(interval: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick().await;
            }
        })
    }

}

impl Drop for ScheduledTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// `base · 1.5^attempt`, where `attempt` counts failed reconnect attempts so far.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let factor = 1.5_f64.powi(attempt.min(64) as i32);
    base.mul_f64(factor)
}
