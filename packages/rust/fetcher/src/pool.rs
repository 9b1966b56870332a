//! Fixed-size pool of fetch workers.
//!
//! Workers pull items from one shared queue, so no item is handed to two
//! workers. Per item: validate, persist the payload, then append to the
//! cache index. The append is the only cross-worker serialization point.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, instrument, warn};

use gridharvest_shared::{CacheEntry, WorkItem};
use gridharvest_storage::{CacheIndex, PayloadStore};

use crate::consensus::{ConsensusValidator, Rejection, Verdict};
use crate::retry::Sleeper;
use crate::upstream::Upstream;

// ---------------------------------------------------------------------------
// StopSignal
// ---------------------------------------------------------------------------

/// Cooperative cancellation flag shared with the workers.
///
/// Once tripped, workers take no further items; whatever is in flight
/// finishes normally.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Upstream rejected the request (non-retryable 4xx).
    Fatal,
    /// No quorum of matching signatures.
    Divergence,
    /// Transient failures outlasted the retry budget.
    Exhausted,
    /// The payload or its cache entry could not be written.
    DiskWrite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureRecord {
    pub entry: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Outcome of one pool run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolReport {
    pub succeeded: usize,
    /// Sorted by entry.
    pub failed: Vec<FailureRecord>,
    /// Items never finished, because of a stop request or a crashed worker.
    pub abandoned: usize,
}

/// Per-item progress callback.
pub trait PoolProgress: Send + Sync {
    /// Called as each item finishes, `done` out of `total`.
    fn item_finished(&self, done: usize, total: usize, entry: &str, succeeded: bool);
}

/// No-op pool progress.
pub struct SilentPoolProgress;

impl PoolProgress for SilentPoolProgress {
    fn item_finished(&self, _done: usize, _total: usize, _entry: &str, _succeeded: bool) {}
}

// ---------------------------------------------------------------------------
// FetchWorkerPool
// ---------------------------------------------------------------------------

struct PoolShared<U, S> {
    validator: ConsensusValidator,
    upstream: Arc<U>,
    sleeper: Arc<S>,
    store: Arc<dyn PayloadStore>,
    index: Arc<CacheIndex>,
    stop: StopSignal,
}

type ItemResult = std::result::Result<CacheEntry, FailureRecord>;

pub struct FetchWorkerPool<U, S> {
    workers: usize,
    shared: Arc<PoolShared<U, S>>,
}

impl<U: Upstream, S: Sleeper> FetchWorkerPool<U, S> {
    pub fn new(
        workers: usize,
        validator: ConsensusValidator,
        upstream: Arc<U>,
        sleeper: Arc<S>,
        store: Arc<dyn PayloadStore>,
        index: Arc<CacheIndex>,
        stop: StopSignal,
    ) -> Self {
        Self {
            workers: workers.max(1),
            shared: Arc::new(PoolShared {
                validator,
                upstream,
                sleeper,
                store,
                index,
                stop,
            }),
        }
    }

    /// Process every item in `pending` and report the outcome.
    ///
    /// Per-item errors become [`FailureRecord`]s; the run itself never fails.
    #[instrument(skip_all, fields(pending = pending.len(), workers = self.workers))]
    pub async fn run(&self, pending: Vec<WorkItem>, progress: &dyn PoolProgress) -> PoolReport {
        let total = pending.len();
        if total == 0 {
            return PoolReport::default();
        }

        let queue = Arc::new(Mutex::new(VecDeque::from(pending)));
        let (tx, mut rx) = mpsc::unbounded_channel::<ItemResult>();

        let worker_count = self.workers.min(total);
        info!(total, workers = worker_count, "starting fetch workers");

        let mut handles = Vec::with_capacity(worker_count);
        for id in 0..worker_count {
            let shared = self.shared.clone();
            let queue = queue.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                shared.work(id, queue, tx).await;
            }));
        }
        drop(tx);

        let mut report = PoolReport::default();
        let mut done = 0usize;
        while let Some(result) = rx.recv().await {
            done += 1;
            match result {
                Ok(entry) => {
                    report.succeeded += 1;
                    progress.item_finished(done, total, entry.as_str(), true);
                }
                Err(failure) => {
                    progress.item_finished(done, total, &failure.entry, false);
                    report.failed.push(failure);
                }
            }
        }

        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "fetch worker terminated abnormally");
            }
        }

        report.abandoned = total - done;
        report.failed.sort_by(|a, b| a.entry.cmp(&b.entry));

        info!(
            succeeded = report.succeeded,
            failed = report.failed.len(),
            abandoned = report.abandoned,
            "fetch workers finished"
        );
        report
    }
}

impl<U: Upstream, S: Sleeper> PoolShared<U, S> {
    async fn work(
        &self,
        id: usize,
        queue: Arc<Mutex<VecDeque<WorkItem>>>,
        tx: mpsc::UnboundedSender<ItemResult>,
    ) {
        loop {
            if self.stop.is_stopped() {
                debug!(worker = id, "stop requested, worker exiting");
                break;
            }
            let Some(item) = queue.lock().await.pop_front() else {
                break;
            };
            let result = self.process(item).await;
            if tx.send(result).is_err() {
                break;
            }
        }
    }

    async fn process(&self, item: WorkItem) -> ItemResult {
        let entry = item.cache_entry();

        let accepted = match self
            .validator
            .validate(&item, self.upstream.as_ref(), self.sleeper.as_ref())
            .await
        {
            Verdict::Accepted(accepted) => accepted,
            Verdict::Rejected(rejection) => {
                let kind = match &rejection {
                    Rejection::Fatal(_) => FailureKind::Fatal,
                    Rejection::Divergence { .. } => FailureKind::Divergence,
                    Rejection::Exhausted(_) => FailureKind::Exhausted,
                };
                return Err(failure(&entry, kind, rejection.to_string()));
            }
        };

        // Persist before append so the log never names a missing payload.
        let store = self.store.clone();
        let name = entry.as_str().to_owned();
        let payload = accepted.payload;
        let write_task = tokio::task::spawn_blocking(move || store.write(&name, &payload));
        let written = match write_task.await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(format!("write task failed: {e}")),
        };
        if let Err(message) = written {
            warn!(%entry, error = %message, "failed to persist payload");
            return Err(failure(&entry, FailureKind::DiskWrite, message));
        }

        let index = self.index.clone();
        let logged = entry.clone();
        let appended = match tokio::task::spawn_blocking(move || index.append(&logged)).await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(e) => Err(format!("append task failed: {e}")),
        };
        match appended {
            Ok(_) => {
                debug!(
                    %entry,
                    round = accepted.round,
                    requests = accepted.requests,
                    "item cached"
                );
                Ok(entry)
            }
            Err(message) => {
                warn!(%entry, error = %message, "failed to record cache entry");
                Err(failure(&entry, FailureKind::DiskWrite, message))
            }
        }
    }
}

fn failure(entry: &CacheEntry, kind: FailureKind, message: String) -> FailureRecord {
    FailureRecord {
        entry: entry.to_string(),
        kind,
        message,
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    use super::*;
    use crate::retry::{RecordingSleeper, RetryPolicy};
    use crate::signature::Canonicalizer;
    use crate::test_support::ScriptedUpstream;
    use crate::upstream::FetchOutcome;
    use gridharvest_shared::{ConsensusConfig, Coordinate, HarvestError, ResourceKind, Result};
    use gridharvest_storage::FsStore;
    use uuid::Uuid;

    struct Fixture {
        dir: PathBuf,
        store: Arc<FsStore>,
        index: Arc<CacheIndex>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = std::env::temp_dir().join(format!("gh-pool-test-{}", Uuid::now_v7()));
            let store = Arc::new(FsStore::open(dir.join("downloaded")).unwrap());
            let index = Arc::new(CacheIndex::load(&dir.join("successful_downloads.txt")).unwrap());
            Self { dir, store, index }
        }

        fn pool<U: Upstream>(
            &self,
            upstream: Arc<U>,
            stop: StopSignal,
        ) -> FetchWorkerPool<U, RecordingSleeper> {
            self.pool_with_store(upstream, self.store.clone(), stop)
        }

        fn pool_with_store<U: Upstream>(
            &self,
            upstream: Arc<U>,
            store: Arc<dyn PayloadStore>,
            stop: StopSignal,
        ) -> FetchWorkerPool<U, RecordingSleeper> {
            let validator = ConsensusValidator::new(
                1,
                1,
                1,
                RetryPolicy::new(2, Duration::from_millis(1)),
                Canonicalizer::from_config(&ConsensusConfig::default()).unwrap(),
            );
            FetchWorkerPool::new(
                4,
                validator,
                upstream,
                Arc::new(RecordingSleeper::new()),
                store,
                self.index.clone(),
                stop,
            )
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.dir);
        }
    }

    fn items(n: usize) -> Vec<WorkItem> {
        (0..n)
            .map(|i| WorkItem::new(Coordinate::new(i as f64, 0.5), ResourceKind::SiteInfo))
            .collect()
    }

    #[tokio::test]
    async fn every_item_is_persisted_then_indexed() {
        let fx = Fixture::new();
        let upstream = Arc::new(ScriptedUpstream::by_item(|item, _| {
            FetchOutcome::Success(format!("<x>{}</x>", item.coordinate.x_str()).into_bytes())
        }));
        let work = items(10);

        let report = fx
            .pool(upstream.clone(), StopSignal::new())
            .run(work.clone(), &SilentPoolProgress)
            .await;

        assert_eq!(report.succeeded, 10);
        assert!(report.failed.is_empty());
        assert_eq!(report.abandoned, 0);
        assert_eq!(upstream.calls(), 10);
        assert_eq!(fx.index.len(), 10);
        for item in &work {
            let entry = item.cache_entry();
            assert!(fx.index.contains(entry.as_str()));
            let stored = fx.store.read(entry.as_str()).unwrap().unwrap();
            assert_eq!(stored, format!("<x>{}</x>", item.coordinate.x_str()).into_bytes());
        }
    }

    #[tokio::test]
    async fn rejected_items_become_failure_records() {
        let fx = Fixture::new();
        let upstream = Arc::new(ScriptedUpstream::by_item(|item, _| {
            match item.coordinate.x_str().as_str() {
                "1.00" => FetchOutcome::Fatal("HTTP 400".into()),
                "2.00" => FetchOutcome::Transient("HTTP 503".into()),
                _ => FetchOutcome::Success(b"<ok/>".to_vec()),
            }
        }));

        let report = fx
            .pool(upstream, StopSignal::new())
            .run(items(4), &SilentPoolProgress)
            .await;

        assert_eq!(report.succeeded, 2);
        let kinds: Vec<_> = report.failed.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FailureKind::Fatal, FailureKind::Exhausted]);
        assert_eq!(report.failed[0].entry, "siteInfo_1.00_0.50.xml");
        assert!(!fx.index.contains("siteInfo_1.00_0.50.xml"));
        assert!(!fx.store.exists("siteInfo_1.00_0.50.xml"));
        assert!(!fx.index.contains("siteInfo_2.00_0.50.xml"));
    }

    struct BrokenStore;

    impl PayloadStore for BrokenStore {
        fn write(&self, name: &str, _payload: &[u8]) -> Result<()> {
            Err(HarvestError::disk_write(name, std::io::Error::other("disk full")))
        }
        fn exists(&self, _name: &str) -> bool {
            false
        }
        fn read(&self, _name: &str) -> Result<Option<Vec<u8>>> {
            Ok(None)
        }
        fn list(&self) -> Result<Vec<String>> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn disk_write_failure_is_not_indexed() {
        let fx = Fixture::new();
        let upstream = Arc::new(ScriptedUpstream::repeating(FetchOutcome::Success(
            b"<ok/>".to_vec(),
        )));

        let report = fx
            .pool_with_store(upstream, Arc::new(BrokenStore), StopSignal::new())
            .run(items(3), &SilentPoolProgress)
            .await;

        assert_eq!(report.succeeded, 0);
        assert_eq!(report.failed.len(), 3);
        assert!(report.failed.iter().all(|f| f.kind == FailureKind::DiskWrite));
        assert!(fx.index.is_empty());
    }

    #[tokio::test]
    async fn stopped_pool_abandons_remaining_items() {
        let fx = Fixture::new();
        let upstream = Arc::new(ScriptedUpstream::repeating(FetchOutcome::Success(
            b"<ok/>".to_vec(),
        )));
        let stop = StopSignal::new();
        stop.stop();

        let report = fx
            .pool(upstream.clone(), stop)
            .run(items(5), &SilentPoolProgress)
            .await;

        assert_eq!(report.succeeded, 0);
        assert_eq!(report.abandoned, 5);
        assert_eq!(upstream.calls(), 0);
    }

    struct RecordingProgress(StdMutex<Vec<(usize, usize, bool)>>);

    impl PoolProgress for RecordingProgress {
        fn item_finished(&self, done: usize, total: usize, _entry: &str, succeeded: bool) {
            self.0.lock().unwrap().push((done, total, succeeded));
        }
    }

    #[tokio::test]
    async fn progress_counts_up_to_total() {
        let fx = Fixture::new();
        let upstream = Arc::new(ScriptedUpstream::repeating(FetchOutcome::Success(
            b"<ok/>".to_vec(),
        )));
        let progress = RecordingProgress(StdMutex::new(Vec::new()));

        fx.pool(upstream, StopSignal::new())
            .run(items(6), &progress)
            .await;

        let seen = progress.0.into_inner().unwrap();
        let done: Vec<_> = seen.iter().map(|(d, _, _)| *d).collect();
        assert_eq!(done, vec![1, 2, 3, 4, 5, 6]);
        assert!(seen.iter().all(|(_, t, ok)| *t == 6 && *ok));
    }

    #[tokio::test]
    async fn empty_pending_is_a_noop() {
        let fx = Fixture::new();
        let upstream = Arc::new(ScriptedUpstream::repeating(FetchOutcome::Fatal("x".into())));
        let report = fx
            .pool(upstream.clone(), StopSignal::new())
            .run(Vec::new(), &SilentPoolProgress)
            .await;
        assert_eq!(report, PoolReport::default());
        assert_eq!(upstream.calls(), 0);
    }
}
