//! Best-effort side effects.
//!
//! Cache repopulation after a durable read and cleanup of undecodable cache
//! entries must never change the outcome of the operation that triggered
//! them. They go through [`run_advisory`], which awaits the work, logs a
//! failure and returns nothing a caller could propagate.

use std::future::Future;

use tierstore_core::TierResult;
use tracing::warn;

/// Await `work`, logging instead of returning its failure.
pub async fn run_advisory<F>(operation: &'static str, key: &str, work: F)
where
    F: Future<Output = TierResult<()>>,
{
    if let Err(e) = work.await {
        warn!(operation, key, error = %e, "Advisory cache operation failed");
    }
}
