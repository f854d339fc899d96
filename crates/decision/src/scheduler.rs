//! Periodic sweep over active experiments
//!
//! Every tick lists `active` experiments and, for each one, refreshes its
//! metrics, evaluates significance and auto-completes it when a winner
//! emerges. Experiments are processed independently: a store failure or
//! malformed data on one experiment is logged and the sweep moves on.
//!
//! Ticks never overlap. A tick that runs past its budget stops at the next
//! boundary between experiments; the remaining ones are picked up by the
//! next tick.

use experiment_config::EngineConfig;
use experiment_types::{Experiment, ExperimentStatus};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::{
    clock::Clock,
    errors::Result,
    lifecycle::LifecycleController,
    metrics::MetricsAggregator,
    statistical::SignificanceEngine,
    store::{ExperimentFilter, ExperimentStore, SessionStore},
};

/// Summary of a single sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Experiments refreshed and evaluated
    pub evaluated: usize,
    /// Experiments auto-completed by this tick
    pub completed: usize,
    /// Completions lost to a concurrent writer
    pub conflicts: usize,
    /// Experiments that failed with an error
    pub failed: usize,
    /// Experiments left for the next tick because the budget ran out
    pub deferred: usize,
    /// The tick did not run because another was still in progress
    pub skipped: bool,
}

/// Cumulative scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    pub ticks_run: u64,
    pub ticks_skipped: u64,
    pub experiments_completed: u64,
    pub experiment_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    ticks_run: AtomicU64,
    ticks_skipped: AtomicU64,
    experiments_completed: AtomicU64,
    experiment_failures: AtomicU64,
}

enum Outcome {
    Completed(String),
    Pending,
}

/// Resets the in-progress flag however the tick ends
struct RunGuard<'a>(&'a AtomicBool);

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Background task composing aggregation, evaluation and auto-completion
pub struct BackgroundScheduler {
    store: Arc<dyn ExperimentStore>,
    aggregator: MetricsAggregator,
    engine: SignificanceEngine,
    lifecycle: LifecycleController,
    clock: Arc<dyn Clock>,
    interval: Duration,
    tick_budget: Duration,
    running: AtomicBool,
    counters: Counters,
}

impl BackgroundScheduler {
    pub fn new(
        store: Arc<dyn ExperimentStore>,
        sessions: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
        engine: SignificanceEngine,
        interval: Duration,
        tick_budget: Duration,
    ) -> Self {
        Self {
            aggregator: MetricsAggregator::new(sessions),
            lifecycle: LifecycleController::new(store.clone(), clock.clone()),
            store,
            engine,
            clock,
            interval,
            tick_budget,
            running: AtomicBool::new(false),
            counters: Counters::default(),
        }
    }

    /// Build a scheduler from engine configuration
    pub fn from_config(
        config: &EngineConfig,
        store: Arc<dyn ExperimentStore>,
        sessions: Arc<dyn SessionStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self::new(
            store,
            sessions,
            clock,
            SignificanceEngine::new(config.significance.winner_policy),
            Duration::from_secs(config.scheduler.interval_secs),
            Duration::from_secs(config.scheduler.tick_budget_secs),
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Snapshot of cumulative counters
    pub fn stats(&self) -> SchedulerStats {
        SchedulerStats {
            ticks_run: self.counters.ticks_run.load(Ordering::Relaxed),
            ticks_skipped: self.counters.ticks_skipped.load(Ordering::Relaxed),
            experiments_completed: self.counters.experiments_completed.load(Ordering::Relaxed),
            experiment_failures: self.counters.experiment_failures.load(Ordering::Relaxed),
        }
    }

    /// Whether a tick is currently in progress
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Run one sweep over all active experiments
    pub async fn run_tick(&self) -> TickReport {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("Previous experiment sweep still running, skipping tick");
            self.counters.ticks_skipped.fetch_add(1, Ordering::Relaxed);
            return TickReport {
                skipped: true,
                ..Default::default()
            };
        }
        let _guard = RunGuard(&self.running);
        self.counters.ticks_run.fetch_add(1, Ordering::Relaxed);

        // A budget too large to represent means no deadline
        let deadline = Instant::now().checked_add(self.tick_budget);
        let mut report = TickReport::default();

        let active = match self
            .store
            .list(&ExperimentFilter::with_status(ExperimentStatus::Active))
            .await
        {
            Ok(active) => active,
            Err(e) => {
                error!(error = %e, "Failed to list active experiments");
                return report;
            }
        };

        debug!(count = active.len(), "Starting experiment sweep");
        let total = active.len();

        for (index, experiment) in active.into_iter().enumerate() {
            if deadline.is_some_and(|d| Instant::now() >= d) {
                report.deferred = total - index;
                warn!(
                    deferred = report.deferred,
                    budget_secs = self.tick_budget.as_secs(),
                    "Experiment sweep exceeded its budget, deferring remaining experiments"
                );
                break;
            }

            let id = experiment.id;
            report.evaluated += 1;
            match self.process(experiment).await {
                Ok(Outcome::Completed(winner)) => {
                    report.completed += 1;
                    self.counters
                        .experiments_completed
                        .fetch_add(1, Ordering::Relaxed);
                    info!(experiment_id = %id, winner = %winner, "Experiment auto-completed");
                }
                Ok(Outcome::Pending) => {}
                Err(e) if e.is_conflict() => {
                    report.conflicts += 1;
                    info!(
                        experiment_id = %id,
                        error = %e,
                        "Experiment changed during evaluation, leaving it to the next sweep"
                    );
                }
                Err(e) => {
                    report.failed += 1;
                    self.counters
                        .experiment_failures
                        .fetch_add(1, Ordering::Relaxed);
                    error!(experiment_id = %id, error = %e, "Failed to evaluate experiment");
                }
            }
        }

        info!(
            evaluated = report.evaluated,
            completed = report.completed,
            failed = report.failed,
            deferred = report.deferred,
            "Finished experiment sweep"
        );
        report
    }

    async fn process(&self, mut experiment: Experiment) -> Result<Outcome> {
        if experiment.exceeded_max_duration(self.clock.now()) {
            warn!(
                experiment_id = %experiment.id,
                max_duration_days = experiment.settings.max_duration_days,
                "Experiment has run past its planned duration without a winner"
            );
        }

        self.aggregator.refresh_metrics(&mut experiment).await?;

        match self.engine.evaluate(&experiment) {
            Some(result) => {
                let winner = result.winner.clone();
                self.lifecycle.auto_complete(experiment, result).await?;
                Ok(Outcome::Completed(winner))
            }
            None => {
                experiment.results = None;
                self.lifecycle.record_snapshot(experiment).await?;
                Ok(Outcome::Pending)
            }
        }
    }

    /// Tick on the configured interval until a shutdown signal arrives
    ///
    /// Shutdown is only observed between ticks, so an in-flight sweep always
    /// finishes its current experiment.
    pub async fn run_until(self: Arc<Self>, mut shutdown: mpsc::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Starting experiment scheduler");
        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
                _ = shutdown.recv() => {
                    info!("Shutting down experiment scheduler");
                    break;
                }
            }
        }
    }

    /// Spawn the scheduler loop on the current runtime
    pub fn spawn(self: Arc<Self>) -> SchedulerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let handle = tokio::spawn(self.run_until(shutdown_rx));
        SchedulerHandle {
            shutdown_tx,
            handle,
        }
    }
}

/// Handle to a spawned scheduler loop
pub struct SchedulerHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Signal shutdown and wait for the loop to exit
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            error!(error = %e, "Experiment scheduler task panicked");
        }
    }
}
