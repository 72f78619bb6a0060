use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Repeating job owned by a session. Dropping the handle aborts the job, so
/// replacing a timer can never leave the old one running.
#[derive(Debug)]
pub struct PeriodicTask {
    generation: u64,
    period: Duration,
    handle: JoinHandle<()>,
}

impl PeriodicTask {
    /// Runs `job` after `first_delay` and then every `period` until it
    /// returns `false`. A tick that overruns the period is skipped rather
    /// than queued.
    pub fn spawn<F, Fut>(
        generation: u64,
        first_delay: Duration,
        period: Duration,
        mut job: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = bool> + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + first_delay, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if !job().await {
                    break;
                }
            }
        });
        Self {
            generation,
            period,
            handle,
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Push-channel reader owned by a session.
#[derive(Debug)]
pub struct ChannelTask {
    generation: u64,
    handle: JoinHandle<()>,
}

impl ChannelTask {
    pub fn spawn<Fut>(generation: u64, reader: Fut) -> Self
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        Self {
            generation,
            handle: tokio::spawn(reader),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ChannelTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
