//! Time-boxed sweep of expired KV rows.
//!
//! Rows whose indexed expiration is older than `now - leeway` are deleted in
//! batches, oldest first. The wall-clock budget is checked before each batch,
//! so a sweep never starts a batch after its deadline but may finish one that
//! started just before it. Cache entries are left alone: they expire on their
//! own TTL, which never outlives the row's expiration.

use std::sync::Arc;
use std::time::Duration;

use tierstore_core::{Clock, ConfigError, SweepConfig, SystemClock, TierError, TierResult};
use tracing::{debug, info, warn};

use crate::durable::{DurableStore, RangeQuery};
use crate::kv::{EXPIRES_FIELD, KV_KIND};

/// How a sweep ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SweepOutcome {
    /// No eligible rows were left.
    Exhausted,
    /// The budget ran out; eligible rows may remain.
    TimedOut,
}

/// Result of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub deleted: u64,
    pub batches: u64,
    pub outcome: SweepOutcome,
}

impl SweepReport {
    pub fn timed_out(&self) -> bool {
        self.outcome == SweepOutcome::TimedOut
    }

    /// Convert a timed-out sweep into [`TierError::TimedOut`].
    pub fn into_result(self) -> TierResult<u64> {
        match self.outcome {
            SweepOutcome::Exhausted => Ok(self.deleted),
            SweepOutcome::TimedOut => Err(TierError::TimedOut {
                deleted: self.deleted,
            }),
        }
    }
}

/// Deletes expired rows of one kind from a durable store.
pub struct GarbageCollector<D: ?Sized> {
    durable: Arc<D>,
    clock: Arc<dyn Clock>,
    config: SweepConfig,
    kind: String,
    field: String,
}

impl<D> GarbageCollector<D>
where
    D: DurableStore + ?Sized,
{
    /// Collector for the KV table's `kvs` rows.
    pub fn new(durable: Arc<D>, config: SweepConfig) -> Self {
        Self {
            durable,
            clock: Arc::new(SystemClock),
            config,
            kind: KV_KIND.to_string(),
            field: EXPIRES_FIELD.to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sweep another kind by its indexed expiration field.
    pub fn for_kind(mut self, kind: impl Into<String>, field: impl Into<String>) -> Self {
        self.kind = kind.into();
        self.field = field.into();
        self
    }

    pub fn config(&self) -> &SweepConfig {
        &self.config
    }

    /// Sweep with the configured budget and leeway.
    pub async fn sweep(&self) -> TierResult<SweepReport> {
        self.sweep_expired(self.config.budget, self.config.leeway)
            .await
    }

    /// Delete rows that expired more than `leeway` ago, spending at most
    /// `budget` before starting a new batch.
    ///
    /// A zero budget starts no batch at all. A budget too large to represent
    /// is unbounded.
    ///
    /// # Errors
    ///
    /// Durable store failures abort the sweep; rows deleted by earlier batches
    /// stay deleted.
    pub async fn sweep_expired(&self, budget: Duration, leeway: Duration) -> TierResult<SweepReport> {
        self.config.validate()?;
        let started = self.clock.now();
        let deadline = chrono::Duration::from_std(budget)
            .ok()
            .and_then(|budget| started.checked_add_signed(budget));
        let cutoff = chrono::Duration::from_std(leeway)
            .ok()
            .and_then(|leeway| started.checked_sub_signed(leeway))
            .ok_or_else(|| ConfigError::InvalidValue {
                field: "leeway".to_string(),
                value: format!("{:?}", leeway),
                reason: "out of range for timestamp arithmetic".to_string(),
            })?;

        let batch_size = self.config.batch_size;
        let mut report = SweepReport {
            deleted: 0,
            batches: 0,
            outcome: SweepOutcome::Exhausted,
        };
        let mut cursor = None;

        loop {
            if deadline.is_some_and(|deadline| self.clock.now() >= deadline) {
                report.outcome = SweepOutcome::TimedOut;
                break;
            }

            let query = RangeQuery::new(&self.kind, &self.field, cutoff, batch_size).after(cursor);
            let page = match self.durable.range_query(&query).await {
                Ok(page) => page,
                Err(e) => {
                    warn!(kind = %self.kind, deleted = report.deleted, error = %e, "Sweep query failed");
                    return Err(e);
                }
            };

            let found = page.keys.len();
            if found > 0 {
                if let Err(e) = self.durable.delete_multi(&page.keys).await {
                    warn!(kind = %self.kind, deleted = report.deleted, error = %e, "Sweep delete failed");
                    return Err(e);
                }
                report.deleted += found as u64;
                report.batches += 1;
                debug!(kind = %self.kind, batch = report.batches, found, "Deleted expired batch");
            }

            if found < batch_size || page.cursor.is_none() {
                break;
            }
            cursor = page.cursor;
        }

        info!(
            kind = %self.kind,
            deleted = report.deleted,
            batches = report.batches,
            timed_out = report.timed_out(),
            "Sweep finished"
        );
        Ok(report)
    }
}
