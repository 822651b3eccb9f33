//! Shared LMDB environment handling for the heed-backed tiers.

use std::path::Path;

use heed::{Env, EnvOpenOptions};
use tierstore_core::{CacheError, StorageError, TierError};

/// Error type for LMDB operations.
#[derive(Debug, thiserror::Error)]
pub enum LmdbError {
    /// Failed to open or create the LMDB environment.
    #[error("Failed to open LMDB environment: {0}")]
    EnvOpen(String),

    /// Failed to open a database within the environment.
    #[error("Failed to open database: {0}")]
    DbOpen(String),

    /// Transaction error.
    #[error("Transaction error: {0}")]
    Transaction(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LmdbError {
    pub(crate) fn txn(e: heed::Error) -> Self {
        LmdbError::Transaction(e.to_string())
    }

    /// Report as a cache tier failure.
    pub fn into_cache_error(self) -> CacheError {
        CacheError::Backend {
            reason: self.to_string(),
        }
    }
}

/// Durable-side conversion: LMDB failures are backend storage errors.
impl From<LmdbError> for TierError {
    fn from(e: LmdbError) -> Self {
        TierError::Storage(StorageError::Backend {
            reason: e.to_string(),
        })
    }
}

/// Open (creating if needed) an environment at `path`.
///
/// # Arguments
///
/// * `path` - Directory where LMDB files will be stored
/// * `max_size_mb` - Maximum size of the memory map in megabytes
/// * `max_dbs` - Number of named databases the caller will create
pub(crate) fn open_env<P: AsRef<Path>>(
    path: P,
    max_size_mb: usize,
    max_dbs: u32,
) -> Result<Env, LmdbError> {
    std::fs::create_dir_all(&path)?;

    unsafe {
        EnvOpenOptions::new()
            .map_size(max_size_mb * 1024 * 1024)
            .max_dbs(max_dbs)
            .open(path.as_ref())
    }
    .map_err(|e| LmdbError::EnvOpen(e.to_string()))
}
