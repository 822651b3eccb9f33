//! Scheduled Sweep Background Task
//!
//! Runs [`GarbageCollector::sweep`] on a fixed interval until shut down.
//! A sweep that runs out of budget is not an error; the next cycle picks up
//! where it left off because expired rows are always swept oldest first.
//!
//! # Configuration
//!
//! ```rust
//! use tierstore_storage::jobs::SweepTaskConfig;
//! use std::time::Duration;
//!
//! let config = SweepTaskConfig {
//!     interval: Duration::from_secs(15 * 60), // Sweep every 15 minutes
//! };
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tierstore_core::constants::DEFAULT_SWEEP_INTERVAL_SECS;
use tokio::sync::watch;
use tokio::time::{interval, MissedTickBehavior};

use crate::durable::DurableStore;
use crate::gc::GarbageCollector;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the sweep background task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepTaskConfig {
    /// How often to sweep (default: 15 minutes)
    pub interval: Duration,
}

impl Default for SweepTaskConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
        }
    }
}

impl SweepTaskConfig {
    /// Create SweepTaskConfig from environment variables.
    ///
    /// # Environment Variables
    /// - `TIERSTORE_SWEEP_INTERVAL_SECS`: How often to sweep (default: 900)
    pub fn from_env() -> Self {
        let interval = Duration::from_secs(
            std::env::var("TIERSTORE_SWEEP_INTERVAL_SECS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|secs| *secs > 0)
                .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS),
        );
        Self { interval }
    }

    /// Create a configuration for development/testing with a short interval.
    pub fn development() -> Self {
        Self {
            interval: Duration::from_secs(10),
        }
    }
}

// ============================================================================
// METRICS
// ============================================================================

/// Counters for sweep task activity.
#[derive(Debug, Default)]
pub struct SweepMetrics {
    /// Sweep cycles started since startup
    pub cycles: AtomicU64,

    /// Expired rows deleted since startup
    pub rows_deleted: AtomicU64,

    /// Sweeps that ran out of budget
    pub timeouts: AtomicU64,

    /// Sweeps that failed
    pub errors: AtomicU64,
}

impl SweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get current snapshot of all metrics.
    pub fn snapshot(&self) -> SweepSnapshot {
        SweepSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            rows_deleted: self.rows_deleted.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of sweep metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepSnapshot {
    pub cycles: u64,
    pub rows_deleted: u64,
    pub timeouts: u64,
    pub errors: u64,
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Background task that sweeps expired rows every `config.interval`.
///
/// The first sweep runs immediately. Runs until the shutdown signal is
/// received and returns the metrics collected during its lifetime.
///
/// # Example
///
/// ```ignore
/// use tokio::sync::watch;
/// use std::sync::Arc;
///
/// let (shutdown_tx, shutdown_rx) = watch::channel(false);
/// let collector = Arc::new(GarbageCollector::new(durable, SweepConfig::from_env()));
///
/// let handle = tokio::spawn(sweep_task(collector, SweepTaskConfig::from_env(), shutdown_rx));
///
/// // Later, trigger shutdown
/// let _ = shutdown_tx.send(true);
/// let metrics = handle.await?;
/// ```
pub async fn sweep_task<D>(
    collector: Arc<GarbageCollector<D>>,
    config: SweepTaskConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) -> Arc<SweepMetrics>
where
    D: DurableStore + ?Sized,
{
    let metrics = Arc::new(SweepMetrics::new());

    let mut sweep_interval = interval(config.interval);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(
        interval_secs = config.interval.as_secs(),
        budget_secs = collector.config().budget.as_secs(),
        batch_size = collector.config().batch_size,
        "Sweep task started"
    );

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                // A dropped sender also means shut down.
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Sweep task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                run_cycle(&collector, &metrics).await;
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        cycles = snapshot.cycles,
        rows_deleted = snapshot.rows_deleted,
        timeouts = snapshot.timeouts,
        errors = snapshot.errors,
        "Sweep task completed"
    );

    metrics
}

/// Perform one sweep cycle.
async fn run_cycle<D>(collector: &GarbageCollector<D>, metrics: &SweepMetrics)
where
    D: DurableStore + ?Sized,
{
    metrics.cycles.fetch_add(1, Ordering::Relaxed);

    match collector.sweep().await {
        Ok(report) => {
            metrics
                .rows_deleted
                .fetch_add(report.deleted, Ordering::Relaxed);
            if report.timed_out() {
                metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    deleted = report.deleted,
                    "Sweep ran out of budget, continuing next cycle"
                );
            } else if report.deleted == 0 {
                tracing::trace!("Sweep cycle completed with nothing to delete");
            }
        }
        Err(e) => {
            tracing::error!(error = %e, "Sweep cycle failed");
            metrics.errors.fetch_add(1, Ordering::Relaxed);
        }
    }
}
