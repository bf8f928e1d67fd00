//! Periodic job scheduler with overlap-skip
//!
//! Every scheduled job gets its own ticker task. On each tick the job runs on
//! a fresh task unless its previous run is still in flight, in which case the
//! tick is dropped and counted as skipped. Ticks are never queued.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace};

/// How a fired run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    /// The job declined the tick, e.g. because its target was busy
    Skipped,
}

#[async_trait]
pub trait Job: Send + Sync + 'static {
    fn name(&self) -> String;

    async fn run(&self) -> JobOutcome;
}

/// Tick counters for one scheduled job
///
/// `fired` counts runs started; `skipped` counts ticks dropped because a run
/// was in flight plus runs the job itself declined.
#[derive(Debug, Default)]
pub struct JobStats {
    fired: AtomicU64,
    skipped: AtomicU64,
    completed: AtomicU64,
}

impl JobStats {
    pub fn fired(&self) -> u64 {
        self.fired.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

/// Clears the in-flight flag even if the job panics
struct RunningGuard(Arc<AtomicBool>);

impl Drop for RunningGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

pub struct Scheduler {
    cancel: CancellationToken,
    tickers: Mutex<Vec<JoinHandle<()>>>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            tickers: Mutex::new(Vec::new()),
        }
    }

    /// Run `job` every `period`, first firing one period from now
    pub fn schedule(&self, job: Arc<dyn Job>, period: Duration) -> Arc<JobStats> {
        let stats = Arc::new(JobStats::default());
        let running = Arc::new(AtomicBool::new(false));
        let cancel = self.cancel.clone();
        let task_stats = stats.clone();
        let name = job.name();

        let ticker = tokio::spawn(async move {
            let mut interval = interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if running.swap(true, Ordering::AcqRel) {
                            task_stats.skipped.fetch_add(1, Ordering::Relaxed);
                            debug!(job = %name, "Previous run still in flight, skipping tick");
                            continue;
                        }
                        task_stats.fired.fetch_add(1, Ordering::Relaxed);
                        trace!(job = %name, "Firing");

                        let guard = RunningGuard(running.clone());
                        let job = job.clone();
                        let run_stats = task_stats.clone();
                        tokio::spawn(async move {
                            let _guard = guard;
                            match job.run().await {
                                JobOutcome::Completed => run_stats.completed.fetch_add(1, Ordering::Relaxed),
                                JobOutcome::Skipped => run_stats.skipped.fetch_add(1, Ordering::Relaxed),
                            };
                        });
                    }
                    () = cancel.cancelled() => {
                        debug!(job = %name, "Ticker stopped");
                        break;
                    }
                }
            }
        });

        if let Ok(mut tickers) = self.tickers.lock() {
            tickers.push(ticker);
        }
        stats
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop every ticker; runs already in flight finish on their own
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let tickers = match self.tickers.lock() {
            Ok(mut tickers) => std::mem::take(&mut *tickers),
            Err(_) => Vec::new(),
        };
        let count = tickers.len();
        for ticker in tickers {
            let _ = ticker.await;
        }
        info!("Scheduler stopped ({} jobs)", count);
    }
}
