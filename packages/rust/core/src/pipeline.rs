//! End-to-end acquisition: mask → working set → cache diff → fetch pool → summary.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{info, instrument, warn};

use gridharvest_enumerator::{Mask, Raster, enumerate};
use gridharvest_fetcher::{
    ConsensusValidator, FailureRecord, FetchWorkerPool, PoolProgress, RetryPolicy, Sleeper,
    StopSignal, Upstream,
};
use gridharvest_shared::{
    AppConfig, ConsensusConfig, HarvestError, ResourceKind, Result, RetryConfig, WorkItem,
};
use gridharvest_storage::{CacheIndex, CacheRebuilder, FsStore, PayloadStore, RebuildReport};

/// Everything one acquisition run needs, resolved from config and CLI flags.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub mask_path: PathBuf,
    pub region_path: Option<PathBuf>,
    pub downsample: usize,
    /// Mask cells with data below this value are excluded.
    pub min_value: f64,
    pub kinds: Vec<ResourceKind>,
    pub data_dir: PathBuf,
    pub log_file: PathBuf,
    /// Rebuild a missing or empty log from the data directory before loading.
    pub auto_rebuild: bool,
    pub workers: usize,
    pub retry: RetryConfig,
    pub consensus: ConsensusConfig,
}

impl From<&AppConfig> for RunConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            mask_path: PathBuf::from(&config.grid.mask_path),
            region_path: config.grid.region_path.as_ref().map(PathBuf::from),
            downsample: config.grid.downsample,
            min_value: config.grid.min_value,
            kinds: config.resources.kinds.clone(),
            data_dir: PathBuf::from(&config.cache.data_dir),
            log_file: PathBuf::from(&config.cache.log_file),
            auto_rebuild: config.cache.auto_rebuild,
            workers: config.pool.workers,
            retry: config.retry.clone(),
            consensus: config.consensus.clone(),
        }
    }
}

/// Required/cached/pending counts for one resource kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KindStatus {
    pub kind: String,
    pub required: usize,
    pub cached: usize,
    pub pending: usize,
}

/// Dry-run view of what a run would do.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub coordinates: usize,
    pub required: usize,
    pub cached: usize,
    pub pending: usize,
    pub by_kind: Vec<KindStatus>,
    /// Set when the log had to be rebuilt from storage first.
    pub rebuilt_entries: Option<usize>,
    /// Log entries outside the current working set.
    pub extraneous: usize,
}

/// Result of [`run_acquisition`].
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub required: usize,
    pub already_cached: usize,
    pub pending: usize,
    pub succeeded: usize,
    pub failed: Vec<FailureRecord>,
    pub abandoned: usize,
    pub rebuilt_entries: Option<usize>,
    /// Entries in the cache log once the run finished.
    pub cache_entries: usize,
    pub elapsed_secs: f64,
}

impl RunSummary {
    /// Whether every required item is now cached.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty() && self.abandoned == 0
    }
}

/// Progress callback for reporting pipeline status.
pub trait ProgressReporter: Send + Sync {
    /// Called when entering a new phase.
    fn phase(&self, name: &str);
    /// Called once the pending set is known.
    fn items_planned(&self, total: usize);
    /// Called as each pending item finishes.
    fn item_finished(&self, done: usize, total: usize, entry: &str, succeeded: bool);
    /// Called when the run completes.
    fn done(&self, summary: &RunSummary);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn phase(&self, _name: &str) {}
    fn items_planned(&self, _total: usize) {}
    fn item_finished(&self, _done: usize, _total: usize, _entry: &str, _succeeded: bool) {}
    fn done(&self, _summary: &RunSummary) {}
}

// ---------------------------------------------------------------------------
// Planning
// ---------------------------------------------------------------------------

/// The working set and its split against the cache.
#[derive(Debug, Clone)]
pub struct Plan {
    pub coordinates: usize,
    pub required: Vec<WorkItem>,
    pub pending: Vec<WorkItem>,
}

impl Plan {
    /// Diff `required` against `index`.
    pub fn new(coordinates: usize, required: Vec<WorkItem>, index: &CacheIndex) -> Self {
        let pending = required
            .iter()
            .filter(|item| !index.contains(item.cache_entry().as_str()))
            .copied()
            .collect();
        Self {
            coordinates,
            required,
            pending,
        }
    }

    pub fn cached(&self) -> usize {
        self.required.len() - self.pending.len()
    }

    fn by_kind(&self, kinds: &[ResourceKind]) -> Vec<KindStatus> {
        unique_kinds(kinds)
            .iter()
            .map(|kind| {
                let required = self.required.iter().filter(|i| i.kind == *kind).count();
                let pending = self.pending.iter().filter(|i| i.kind == *kind).count();
                KindStatus {
                    kind: kind.to_string(),
                    required,
                    cached: required - pending,
                    pending,
                }
            })
            .collect()
    }
}

/// `kinds` without repeats, first occurrence kept.
fn unique_kinds(kinds: &[ResourceKind]) -> Vec<ResourceKind> {
    let mut seen = HashSet::new();
    kinds.iter().copied().filter(|k| seen.insert(*k)).collect()
}

fn load_mask(path: &Path, min_value: f64) -> Result<Mask> {
    Ok(Raster::load(path)?.to_mask(min_value))
}

/// Enumerate coordinates and cross them with the configured kinds.
///
/// Returns the coordinate count and the required items, coordinate-major.
pub fn required_items(config: &RunConfig) -> Result<(usize, Vec<WorkItem>)> {
    if config.kinds.is_empty() {
        return Err(HarvestError::validation("no resource kinds configured"));
    }

    let mask = load_mask(&config.mask_path, config.min_value)?;
    let region = config
        .region_path
        .as_deref()
        .map(|p| load_mask(p, config.min_value))
        .transpose()?;

    let coordinates = enumerate(&mask, config.downsample, region.as_ref())?;
    let kinds = unique_kinds(&config.kinds);

    let required = coordinates
        .iter()
        .flat_map(|c| kinds.iter().map(move |k| WorkItem::new(*c, *k)))
        .collect();
    Ok((coordinates.len(), required))
}

/// Open payload storage and the cache index.
///
/// With `auto_rebuild`, a missing or empty log is rebuilt from storage first,
/// and an unreadable one is rebuilt once before giving up with
/// [`HarvestError::CacheCorruption`].
pub fn open_cache(
    config: &RunConfig,
) -> Result<(Arc<FsStore>, CacheIndex, Option<RebuildReport>)> {
    let store = Arc::new(FsStore::open(&config.data_dir)?);

    let rebuilder = CacheRebuilder::new(store.clone(), &config.log_file);
    let mut rebuilt = None;
    let loaded = if config.auto_rebuild {
        rebuilder.rebuild_if_missing().and_then(|report| {
            rebuilt = report;
            CacheIndex::load(&config.log_file)
        })
    } else {
        CacheIndex::load(&config.log_file)
    };

    let index = match loaded {
        Ok(index) => index,
        Err(e) if config.auto_rebuild => {
            warn!(error = %e, "cache log unreadable, rebuilding from storage");
            let report = rebuilder.rebuild().map_err(|re| {
                HarvestError::CacheCorruption(format!(
                    "cache log unreadable ({e}) and rebuild failed: {re}"
                ))
            })?;
            rebuilt = Some(report);
            CacheIndex::load(&config.log_file).map_err(|e| {
                HarvestError::CacheCorruption(format!("cache log unreadable after rebuild: {e}"))
            })?
        }
        Err(e) => return Err(e),
    };
    Ok((store, index, rebuilt))
}

/// Report required/cached/pending per kind without fetching anything.
#[instrument(skip_all, fields(mask = %config.mask_path.display()))]
pub fn status(config: &RunConfig) -> Result<StatusReport> {
    let (coordinates, required) = required_items(config)?;
    let (_store, index, rebuilt) = open_cache(config)?;
    let plan = Plan::new(coordinates, required, &index);

    let required_names: HashSet<String> = plan
        .required
        .iter()
        .map(|i| i.cache_entry().into_string())
        .collect();
    let extraneous = index
        .entries()
        .iter()
        .filter(|e| !required_names.contains(*e))
        .count();

    Ok(StatusReport {
        coordinates: plan.coordinates,
        required: plan.required.len(),
        cached: plan.cached(),
        pending: plan.pending.len(),
        by_kind: plan.by_kind(&config.kinds),
        rebuilt_entries: rebuilt.map(|r| r.entries),
        extraneous,
    })
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

/// Acquire every required item not already cached.
///
/// 1. Enumerate the working set from the mask
/// 2. Open storage and the cache index (rebuilding a lost log)
/// 3. Diff required against cached
/// 4. Fetch, validate, persist and record the pending items
///
/// Re-running only attempts what is still missing. Per-item failures are
/// reported in the summary; only run-level problems (bad mask, unreadable
/// cache) return an error.
#[instrument(skip_all, fields(mask = %config.mask_path.display(), workers = config.workers))]
pub async fn run_acquisition<U: Upstream, S: Sleeper>(
    config: &RunConfig,
    upstream: Arc<U>,
    sleeper: Arc<S>,
    stop: StopSignal,
    progress: &dyn ProgressReporter,
) -> Result<RunSummary> {
    let start = Instant::now();

    // --- Phase 1: Working set ---
    progress.phase("Enumerating coordinates");
    let (coordinates, required) = required_items(config)?;
    info!(
        coordinates,
        required = required.len(),
        kinds = config.kinds.len(),
        "working set built"
    );

    // --- Phase 2: Cache ---
    progress.phase("Loading cache index");
    let (store, index, rebuilt) = open_cache(config)?;
    let index = Arc::new(index);
    let plan = Plan::new(coordinates, required, &index);
    info!(
        required = plan.required.len(),
        cached = plan.cached(),
        pending = plan.pending.len(),
        "cache diff computed"
    );

    // --- Phase 3: Fetch ---
    let validator =
        ConsensusValidator::from_config(&config.consensus, RetryPolicy::from(&config.retry))?;
    let store: Arc<dyn PayloadStore> = store;
    let pool = FetchWorkerPool::new(
        config.workers,
        validator,
        upstream,
        sleeper,
        store,
        index.clone(),
        stop,
    );

    let pending_count = plan.pending.len();
    progress.phase("Fetching");
    progress.items_planned(pending_count);
    let adapter = PipelinePoolProgress { inner: progress };
    let report = pool.run(plan.pending, &adapter).await;

    if report.abandoned > 0 {
        warn!(abandoned = report.abandoned, "run stopped before all items were attempted");
    }

    let summary = RunSummary {
        required: plan.required.len(),
        already_cached: plan.required.len() - pending_count,
        pending: pending_count,
        succeeded: report.succeeded,
        failed: report.failed,
        abandoned: report.abandoned,
        rebuilt_entries: rebuilt.map(|r| r.entries),
        cache_entries: index.len(),
        elapsed_secs: start.elapsed().as_secs_f64(),
    };

    info!(
        succeeded = summary.succeeded,
        failed = summary.failed.len(),
        abandoned = summary.abandoned,
        elapsed_secs = summary.elapsed_secs,
        "acquisition run finished"
    );
    progress.done(&summary);
    Ok(summary)
}

// ---------------------------------------------------------------------------
// Pool progress adapter
// ---------------------------------------------------------------------------

/// Adapts a `ProgressReporter` to the `PoolProgress` interface.
struct PipelinePoolProgress<'a> {
    inner: &'a dyn ProgressReporter,
}

impl PoolProgress for PipelinePoolProgress<'_> {
    fn item_finished(&self, done: usize, total: usize, entry: &str, succeeded: bool) {
        self.inner.item_finished(done, total, entry, succeeded);
    }
}
