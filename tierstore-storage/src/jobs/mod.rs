//! Background jobs.
//!
//! - `sweep`: periodically deletes expired KV rows
//!
//! # Usage
//!
//! ```ignore
//! use tierstore_storage::jobs::{sweep_task, SweepTaskConfig};
//! use tokio::sync::watch;
//!
//! let (shutdown_tx, shutdown_rx) = watch::channel(false);
//! tokio::spawn(sweep_task(collector, SweepTaskConfig::from_env(), shutdown_rx));
//!
//! // On shutdown
//! let _ = shutdown_tx.send(true);
//! ```

pub mod sweep;

pub use sweep::{sweep_task, SweepMetrics, SweepSnapshot, SweepTaskConfig};
