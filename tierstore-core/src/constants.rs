//! Default values shared by configuration types.

/// Maximum transaction attempts before a conflict is reported as failure.
pub const DEFAULT_TXN_MAX_ATTEMPTS: u32 = 10;

/// First backoff between conflicting transaction attempts, in milliseconds.
pub const DEFAULT_TXN_INITIAL_BACKOFF_MS: u64 = 10;

/// Upper bound on backoff between transaction attempts, in milliseconds.
pub const DEFAULT_TXN_MAX_BACKOFF_MS: u64 = 1_000;

/// Backoff growth factor between transaction attempts.
pub const DEFAULT_TXN_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Ceiling on cache TTLs, also used by entities without a natural lifetime.
pub const DEFAULT_CACHE_TTL_SECS: u64 = 3_600;

/// Wall-clock budget for one sweep invocation.
pub const DEFAULT_SWEEP_BUDGET_SECS: u64 = 50;

/// Grace period past expiration before a row may be swept (24 hours).
pub const DEFAULT_SWEEP_LEEWAY_SECS: u64 = 86_400;

/// Rows deleted per sweep batch; matches typical backend batch-delete limits.
pub const DEFAULT_SWEEP_BATCH_SIZE: usize = 400;

/// How often the background sweep task runs (15 minutes).
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 900;
