//! Cache maintenance: rebuilding the log from storage and auditing it.

use std::sync::Arc;

use serde::Serialize;
use tracing::instrument;

use gridharvest_shared::{HarvestError, Result};
use gridharvest_storage::{CacheIndex, CacheRebuilder, FsStore, RebuildReport};

use crate::pipeline::RunConfig;

/// Outcome of [`verify_cache`].
#[derive(Debug, Clone, Serialize)]
pub struct VerifyReport {
    pub entries: usize,
    /// Logged entries with no payload in storage, sorted.
    pub missing: Vec<String>,
}

/// Replace the cache log with a fresh scan of the data directory.
#[instrument(skip_all, fields(data_dir = %config.data_dir.display()))]
pub fn rebuild_cache(config: &RunConfig) -> Result<RebuildReport> {
    let store = Arc::new(FsStore::open(&config.data_dir)?);
    CacheRebuilder::new(store, &config.log_file).rebuild()
}

/// List logged entries whose payload is gone. Changes nothing.
///
/// A missing log or data directory is an error rather than an empty report.
#[instrument(skip_all, fields(data_dir = %config.data_dir.display()))]
pub fn verify_cache(config: &RunConfig) -> Result<VerifyReport> {
    let Some((entries, _)) = CacheIndex::read_existing(&config.log_file)? else {
        return Err(HarvestError::config(format!(
            "cache log {} does not exist",
            config.log_file.display()
        )));
    };
    if !config.data_dir.is_dir() {
        return Err(HarvestError::config(format!(
            "data directory {} does not exist",
            config.data_dir.display()
        )));
    }

    let store = Arc::new(FsStore::open(&config.data_dir)?);
    let missing = CacheRebuilder::new(store, &config.log_file).verify(&entries);
    Ok(VerifyReport {
        entries: entries.len(),
        missing,
    })
}
