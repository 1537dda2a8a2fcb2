//! Drives reconciliation cycles on a fixed, drift-corrected interval.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bidtrack_adapters::ListingSource;
use bidtrack_storage::EntityStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, Instrument};
use uuid::Uuid;

use crate::reconcile::{BatchReport, CompletionReport, Reconciler};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Running,
    ShuttingDown,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CycleSettings {
    pub pattern: String,
    pub lookahead_hours: u32,
    pub lookback_hours: u32,
    pub interval: Duration,
    /// Wait after a failed cycle, independent of `interval`.
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub active: BatchReport,
    pub completed: CompletionReport,
}

/// Sleep that keeps cycle starts `interval` apart.
pub fn compute_sleep(interval: Duration, elapsed: Duration) -> Duration {
    interval.saturating_sub(elapsed)
}

pub struct CycleScheduler {
    settings: CycleSettings,
    source: Arc<dyn ListingSource>,
    reconciler: Reconciler,
    state: watch::Sender<SchedulerState>,
}

impl CycleScheduler {
    pub fn new(settings: CycleSettings, source: Arc<dyn ListingSource>, store: Arc<dyn EntityStore>) -> Self {
        let (state, _) = watch::channel(SchedulerState::Running);
        Self {
            settings,
            source,
            reconciler: Reconciler::new(store),
            state,
        }
    }

    pub fn state(&self) -> SchedulerState {
        *self.state.borrow()
    }

    fn set_state(&self, next: SchedulerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = ?previous, to = ?next, "scheduler state changed");
        }
    }

    /// Run exactly one cycle: fetch and apply active listings, then
    /// completions.
    pub async fn run_once(&self) -> Result<CycleReport> {
        let run_id = Uuid::new_v4();
        self.run_cycle(run_id)
            .instrument(info_span!("cycle", %run_id, source = self.source.source_id()))
            .await
    }

    async fn run_cycle(&self, run_id: Uuid) -> Result<CycleReport> {
        let clock = Instant::now();
        let started_at = Utc::now();
        let source_id = self.source.source_id();

        let listings = self
            .source
            .fetch_active(&self.settings.pattern, self.settings.lookahead_hours)
            .await
            .with_context(|| format!("fetching active listings from {source_id}"))?;
        let active = self
            .reconciler
            .apply_active_batch(&listings)
            .await
            .context("applying active listings")?;

        let completions = self
            .source
            .fetch_completed(self.settings.lookback_hours)
            .await
            .with_context(|| format!("fetching completed listings from {source_id}"))?;
        let completed = self
            .reconciler
            .apply_completed_batch(&completions)
            .await
            .context("applying completed listings")?;

        let elapsed_ms = u64::try_from(clock.elapsed().as_millis()).unwrap_or(u64::MAX);
        info!(
            active_seen = active.seen,
            inserted = active.inserted,
            updated = active.updated,
            unchanged = active.unchanged,
            active_skipped = active.skipped,
            finalized = completed.finalized,
            untracked = completed.untracked,
            winning_bids = completed.winning_bids,
            completed_skipped = completed.skipped,
            elapsed_ms,
            "cycle complete"
        );

        Ok(CycleReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            elapsed_ms,
            active,
            completed,
        })
    }

    /// Let an in-flight cycle finish, flipping to `ShuttingDown` as soon as a
    /// shutdown is requested.
    async fn drive_cycle(&self, shutdown: &CancellationToken) -> Result<CycleReport> {
        let cycle = self.run_once();
        tokio::pin!(cycle);
        let mut requested = false;
        loop {
            tokio::select! {
                biased;
                outcome = &mut cycle => return outcome,
                _ = shutdown.cancelled(), if !requested => {
                    requested = true;
                    self.set_state(SchedulerState::ShuttingDown);
                    info!("shutdown requested; finishing current cycle");
                }
            }
        }
    }

    /// Repeat cycles until `shutdown` is cancelled. A failed cycle is logged
    /// and retried after `retry_delay`; nothing else ends the loop.
    pub async fn run_continuous(&self, shutdown: CancellationToken) -> SchedulerState {
        info!(
            interval_secs = self.settings.interval.as_secs(),
            retry_delay_secs = self.settings.retry_delay.as_secs(),
            "scheduler started"
        );

        while !shutdown.is_cancelled() {
            let started = Instant::now();
            let delay = match self.drive_cycle(&shutdown).await {
                Ok(_) => {
                    let sleep = compute_sleep(self.settings.interval, started.elapsed());
                    info!(sleep_secs = sleep.as_secs(), "next cycle scheduled");
                    sleep
                }
                Err(err) => {
                    error!(
                        error = %format!("{err:#}"),
                        delay_secs = self.settings.retry_delay.as_secs(),
                        "cycle failed; applying fallback delay"
                    );
                    self.settings.retry_delay
                }
            };

            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.set_state(SchedulerState::ShuttingDown);
        self.set_state(SchedulerState::Stopped);
        info!("scheduler stopped");
        SchedulerState::Stopped
    }
}
