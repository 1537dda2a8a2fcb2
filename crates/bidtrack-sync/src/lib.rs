//! Reconciliation orchestration: settings resolution, the per-item reconciler
//! and the cycle scheduler.

mod config;
mod reconcile;
mod scheduler;

use std::sync::Arc;

use anyhow::{Context, Result};
use bidtrack_adapters::source_from_settings;
use bidtrack_storage::EntityStore;

pub use config::{
    DaemonSettings, DatabaseSettings, LoggingSettings, SearchSettings, Settings, SettingsError,
    SettingsOverrides, LOG_LEVELS,
};
pub use reconcile::{BatchReport, CompletionReport, ReconcileError, Reconciler};
pub use scheduler::{compute_sleep, CycleReport, CycleScheduler, CycleSettings, SchedulerState};

pub const CRATE_NAME: &str = "bidtrack-sync";

/// Wire the configured listing source and `store` into a scheduler.
pub fn scheduler_from_settings(settings: &Settings, store: Arc<dyn EntityStore>) -> Result<CycleScheduler> {
    let source = source_from_settings(&settings.source).context("building listing source")?;
    Ok(CycleScheduler::new(settings.cycle_settings(), source, store))
}
