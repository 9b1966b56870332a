//! Upstream acquisition: HTTP client, retry with backoff, consensus
//! validation and the worker pool that drives them.

mod consensus;
mod pool;
mod retry;
mod signature;
mod upstream;

pub use consensus::{
    Accepted, ConsensusValidator, Rejection, RetriedFetch, Verdict, fetch_with_retry,
};
pub use pool::{
    FailureKind, FailureRecord, FetchWorkerPool, PoolProgress, PoolReport, SilentPoolProgress,
    StopSignal,
};
pub use retry::{RecordingSleeper, RetryPolicy, Sleeper, TokioSleeper};
pub use signature::Canonicalizer;
pub use upstream::{FetchOutcome, HttpUpstream, Upstream, classify_response};

#[cfg(test)]
pub(crate) mod test_support {
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use gridharvest_shared::WorkItem;

    use crate::upstream::{FetchOutcome, Upstream};

    type Responder = Box<dyn Fn(&WorkItem, usize) -> FetchOutcome + Send + Sync>;

    /// Plays back scripted outcomes, then falls back to a responder.
    pub struct ScriptedUpstream {
        script: Mutex<VecDeque<FetchOutcome>>,
        respond: Responder,
        calls: AtomicUsize,
    }

    impl ScriptedUpstream {
        pub fn new(script: impl IntoIterator<Item = FetchOutcome>) -> Self {
            Self {
                script: Mutex::new(script.into_iter().collect()),
                respond: Box::new(|_, _| FetchOutcome::Fatal("script exhausted".into())),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn repeating(outcome: FetchOutcome) -> Self {
            Self::by_item(move |_, _| outcome.clone())
        }

        /// Responds with `f(n)` for the `n`th call (from 0).
        pub fn counting(f: impl Fn(usize) -> FetchOutcome + Send + Sync + 'static) -> Self {
            Self::by_item(move |_, n| f(n))
        }

        pub fn by_item(
            f: impl Fn(&WorkItem, usize) -> FetchOutcome + Send + Sync + 'static,
        ) -> Self {
            Self {
                script: Mutex::new(VecDeque::new()),
                respond: Box::new(f),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Upstream for ScriptedUpstream {
        async fn fetch(&self, item: &WorkItem) -> FetchOutcome {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let scripted = self.script.lock().unwrap().pop_front();
            scripted.unwrap_or_else(|| (self.respond)(item, n))
        }
    }
}
