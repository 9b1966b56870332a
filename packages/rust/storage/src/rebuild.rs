//! Regenerating and auditing the cache log from payload storage.

use std::collections::{BTreeMap, BTreeSet};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gridharvest_shared::{CacheEntry, HarvestError, Result};
use tracing::{info, instrument, warn};

use crate::store::PayloadStore;

/// Summary of a completed rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildReport {
    /// Entries written to the new log.
    pub entries: usize,
    /// Entry counts per kind prefix.
    pub by_prefix: BTreeMap<String, usize>,
    /// Stored files that are not conforming payload names.
    pub skipped: usize,
    /// Leftover temp files from interrupted payload writes, removed.
    pub swept_temp: usize,
}

/// Rebuilds the cache log from a full scan of payload storage.
pub struct CacheRebuilder {
    store: Arc<dyn PayloadStore>,
    log_path: PathBuf,
}

impl CacheRebuilder {
    pub fn new(store: Arc<dyn PayloadStore>, log_path: impl Into<PathBuf>) -> Self {
        Self {
            store,
            log_path: log_path.into(),
        }
    }

    /// Scan storage and atomically replace the log with what is actually there.
    ///
    /// The new log is written to a sibling temp file and renamed over the old
    /// one, so a crash mid-rebuild leaves the previous log intact. Any
    /// [`CacheIndex`](crate::CacheIndex) already open on the old log keeps writing to the replaced
    /// file; reload it afterwards.
    #[instrument(skip_all, fields(log = %self.log_path.display()))]
    pub fn rebuild(&self) -> Result<RebuildReport> {
        info!("rebuilding cache log from payload storage");

        let mut report = RebuildReport {
            swept_temp: self.store.sweep_temp()?,
            ..RebuildReport::default()
        };
        if report.swept_temp > 0 {
            warn!(count = report.swept_temp, "removed stale temp files from storage");
        }
        let mut names = BTreeSet::new();
        for name in self.store.list()? {
            match CacheEntry::parse(&name).and_then(|e| e.components()) {
                Some(parsed) => {
                    if names.insert(name) {
                        *report.by_prefix.entry(parsed.prefix).or_default() += 1;
                    }
                }
                None => report.skipped += 1,
            }
        }
        report.entries = names.len();

        let tmp_path = tmp_path_for(&self.log_path);
        if let Err(e) = write_lines(&tmp_path, &names) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(e);
        }
        std::fs::rename(&tmp_path, &self.log_path).map_err(|e| {
            let _ = std::fs::remove_file(&tmp_path);
            HarvestError::io(&self.log_path, e)
        })?;

        info!(
            entries = report.entries,
            skipped = report.skipped,
            "cache log rebuilt"
        );
        Ok(report)
    }

    /// Rebuild only when the log is missing or empty and storage has payloads.
    ///
    /// Returns `None` when nothing needed doing.
    pub fn rebuild_if_missing(&self) -> Result<Option<RebuildReport>> {
        if log_has_content(&self.log_path)? {
            return Ok(None);
        }

        let has_payloads = self
            .store
            .list()?
            .iter()
            .any(|name| CacheEntry::parse(name).is_some());
        if !has_payloads {
            return Ok(None);
        }

        warn!(
            log = %self.log_path.display(),
            "cache log missing or empty but payloads exist, rebuilding"
        );
        self.rebuild().map(Some)
    }

    /// Every logged entry whose payload is no longer in storage, sorted.
    ///
    /// Reads storage only.
    #[instrument(skip_all)]
    pub fn verify(&self, entries: &[String]) -> Vec<String> {
        let mut missing: Vec<String> = entries
            .iter()
            .filter(|name| !self.store.exists(name))
            .cloned()
            .collect();
        missing.sort_unstable();

        if missing.is_empty() {
            info!(entries = entries.len(), "all cached entries present");
        } else {
            warn!(
                missing = missing.len(),
                entries = entries.len(),
                "cached entries missing from storage"
            );
        }
        missing
    }
}

fn tmp_path_for(log_path: &Path) -> PathBuf {
    let file_name = log_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "cache_log".into());
    log_path.with_file_name(format!(".{file_name}.rebuild.tmp"))
}

fn write_lines(path: &Path, names: &BTreeSet<String>) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|e| HarvestError::io(parent, e))?;
        }
    }

    let file = File::create(path).map_err(|e| HarvestError::io(path, e))?;
    let mut writer = BufWriter::new(file);
    for name in names {
        writeln!(writer, "{name}").map_err(|e| HarvestError::io(path, e))?;
    }
    let file = writer
        .into_inner()
        .map_err(|e| HarvestError::io(path, e.into_error()))?;
    file.sync_all().map_err(|e| HarvestError::io(path, e))
}

fn log_has_content(path: &Path) -> Result<bool> {
    match std::fs::read(path) {
        Ok(raw) => Ok(raw.iter().any(|b| !b.is_ascii_whitespace())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(HarvestError::io(path, e)),
    }
}
