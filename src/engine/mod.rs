pub mod pipeline;
pub mod progress;
pub mod rate;

use crate::model::{Config, TargetDescriptor};
use crate::output::OutputChannel;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, Stream, StreamExt};
use pipeline::TargetProcessor;
use progress::{Progress, Reporter};
use rate::RateLimiter;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub dispatched: u64,
    pub completed: u64,
}

pub struct Engine {
    processor: Arc<dyn TargetProcessor>,
    sink: OutputChannel,
    limiter: RateLimiter,
    sem: Arc<Semaphore>,
    progress: Arc<Progress>,
    progress_interval: Duration,
}

impl Engine {
    pub fn new(cfg: &Config, processor: Arc<dyn TargetProcessor>, sink: OutputChannel) -> Self {
        let ceiling = cfg.max_in_flight.clamp(1, Semaphore::MAX_PERMITS);
        Self {
            processor,
            sink,
            limiter: RateLimiter::new(cfg.bucket_size, cfg.bucket_refill),
            sem: Arc::new(Semaphore::new(ceiling)),
            progress: Arc::new(Progress::default()),
            progress_interval: cfg.progress_interval,
        }
    }

    /// Dispatches one probe task per target until the input is exhausted or
    /// `cancel` fires, then waits for every dispatched task to finish.
    #[instrument(skip(self, targets, cancel))]
    pub async fn run<S>(&self, mut targets: S, cancel: CancellationToken) -> anyhow::Result<RunSummary>
    where
        S: Stream<Item = TargetDescriptor> + Unpin + Send,
    {
        let reporter_stop = CancellationToken::new();
        let reporter = tokio::spawn(
            Reporter::new(self.progress.clone()).run(self.progress_interval, reporter_stop.clone()),
        );
        let mut tasks = FuturesUnordered::new();

        loop {
            let target = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = targets.next() => match next {
                    Some(target) => target,
                    None => break,
                },
            };

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = self.limiter.acquire(1) => {}
            }
            let permit = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                permit = self.sem.clone().acquire_owned() => permit?,
            };

            let processor = self.processor.clone();
            let sink = self.sink.clone();
            let progress = self.progress.clone();
            self.progress.dispatched();
            debug!(target_id = target.id, %target, "dispatching");
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                let target_id = target.id;
                let session = processor.process_target(target).await;
                if let Err(err) = sink.emit(session).await {
                    error!(target_id, error = %err, "failed to hand session to output");
                }
                progress.completed();
            }));

            // reap finished tasks so the set only holds in-flight work
            while let Some(Some(joined)) = tasks.next().now_or_never() {
                log_join(joined);
            }
        }

        if cancel.is_cancelled() {
            info!(in_flight = tasks.len(), "shutdown requested, draining in-flight probes");
        }
        while let Some(joined) = tasks.next().await {
            log_join(joined);
        }

        reporter_stop.cancel();
        match reporter.await {
            Ok(mut reporter) => {
                reporter.report("final progress");
            }
            Err(err) => warn!(error = %err, "progress reporter failed"),
        }

        let snapshot = self.progress.snapshot();
        Ok(RunSummary {
            dispatched: snapshot.dispatched,
            completed: snapshot.completed,
        })
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(err) = joined {
        error!(error = %err, "probe task failed");
    }
}
