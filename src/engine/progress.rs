use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Default)]
pub struct Progress {
    dispatched: AtomicU64,
    completed: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    pub dispatched: u64,
    pub completed: u64,
}

impl Snapshot {
    pub fn in_flight(&self) -> u64 {
        self.dispatched.saturating_sub(self.completed)
    }
}

impl Progress {
    pub fn dispatched(&self) {
        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    pub fn completed(&self) {
        self.completed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            dispatched: self.dispatched.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

/// Logs a progress line every `every` until `stop` fires.
pub struct Reporter {
    progress: Arc<Progress>,
    started: Instant,
    last: Snapshot,
    last_at: Instant,
}

impl Reporter {
    pub fn new(progress: Arc<Progress>) -> Self {
        let now = Instant::now();
        let last = progress.snapshot();
        Self {
            progress,
            started: now,
            last,
            last_at: now,
        }
    }

    pub async fn run(mut self, every: Duration, stop: CancellationToken) -> Self {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = stop.cancelled() => break,
                _ = ticker.tick() => {
                    self.report("progress");
                }
            }
        }
        self
    }

    pub fn report(&mut self, label: &'static str) -> Snapshot {
        let now = Instant::now();
        let current = self.progress.snapshot();
        let since_last = current.dispatched.saturating_sub(self.last.dispatched);
        let window = now.saturating_duration_since(self.last_at).as_secs_f64();
        let rate_per_sec = if window > 0.0 {
            since_last as f64 / window
        } else {
            0.0
        };
        info!(
            in_total = current.dispatched,
            since_last,
            completed = current.completed,
            in_flight = current.in_flight(),
            rate_per_sec = (rate_per_sec * 10.0).round() / 10.0,
            elapsed_secs = now.saturating_duration_since(self.started).as_secs(),
            "{label}"
        );
        self.last = current;
        self.last_at = now;
        current
    }
}
