//! Quorum validation of upstream payloads.
//!
//! The upstream service is not reliably deterministic, so a payload is only
//! accepted once `quorum` independent fetches within one round produce the
//! same canonical signature.

use std::collections::HashMap;

use tracing::{debug, instrument, warn};

use gridharvest_shared::{ConsensusConfig, Result, WorkItem};

use crate::retry::{RetryPolicy, Sleeper};
use crate::signature::Canonicalizer;
use crate::upstream::{FetchOutcome, Upstream};

/// Outcome of one fetch after retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetriedFetch {
    Success { payload: Vec<u8>, attempts: u32 },
    Fatal { message: String, attempts: u32 },
    Exhausted { message: String, attempts: u32 },
}

impl RetriedFetch {
    pub fn attempts(&self) -> u32 {
        match self {
            Self::Success { attempts, .. }
            | Self::Fatal { attempts, .. }
            | Self::Exhausted { attempts, .. } => *attempts,
        }
    }
}

/// Fetch `item`, retrying transient failures with exponential backoff.
///
/// Failed attempt `n` (from 0) is followed by `policy.delay_for_attempt(n)`
/// unless the budget is then used up. Fatal outcomes return immediately.
pub async fn fetch_with_retry<U: Upstream, S: Sleeper>(
    item: &WorkItem,
    upstream: &U,
    sleeper: &S,
    policy: &RetryPolicy,
) -> RetriedFetch {
    let mut attempt = 0u32;
    loop {
        let outcome = upstream.fetch(item).await;
        let made = attempt + 1;
        match outcome {
            FetchOutcome::Success(payload) => {
                return RetriedFetch::Success {
                    payload,
                    attempts: made,
                };
            }
            FetchOutcome::Fatal(message) => {
                return RetriedFetch::Fatal {
                    message,
                    attempts: made,
                };
            }
            FetchOutcome::Transient(message) => {
                if policy.is_exhausted(made) {
                    return RetriedFetch::Exhausted {
                        message,
                        attempts: made,
                    };
                }
                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    %item,
                    attempt = made,
                    error = %message,
                    delay_ms = delay.as_millis() as u64,
                    "transient failure, backing off"
                );
                sleeper.sleep(delay).await;
                attempt = made;
            }
        }
    }
}

/// An accepted payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Accepted {
    /// Body of the first fetch that carried the winning signature.
    pub payload: Vec<u8>,
    pub signature: String,
    /// Round (from 1) in which quorum was reached.
    pub round: u32,
    /// Upstream requests made, retries included.
    pub requests: u32,
}

/// Why an item was not accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// The upstream refused the request outright.
    Fatal(String),
    /// Every round finished without `quorum` matching signatures.
    Divergence { rounds: u32 },
    /// A round produced no payload at all because retries ran out.
    Exhausted(String),
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fatal(msg) => write!(f, "fatal upstream error: {msg}"),
            Self::Divergence { rounds } => {
                write!(f, "no consensus after {rounds} round(s)")
            }
            Self::Exhausted(msg) => write!(f, "retries exhausted: {msg}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accepted(Accepted),
    Rejected(Rejection),
}

/// Issues repeated fetches for an item and accepts on quorum.
#[derive(Debug, Clone)]
pub struct ConsensusValidator {
    samples_per_round: u32,
    quorum: u32,
    round_limit: u32,
    policy: RetryPolicy,
    canonicalizer: Canonicalizer,
}

impl ConsensusValidator {
    pub fn new(
        samples_per_round: u32,
        quorum: u32,
        round_limit: u32,
        policy: RetryPolicy,
        canonicalizer: Canonicalizer,
    ) -> Self {
        Self {
            samples_per_round,
            quorum,
            round_limit,
            policy,
            canonicalizer,
        }
    }

    pub fn from_config(config: &ConsensusConfig, policy: RetryPolicy) -> Result<Self> {
        Ok(Self::new(
            config.samples_per_round,
            config.quorum,
            config.round_limit,
            policy,
            Canonicalizer::from_config(config)?,
        ))
    }

    /// Fetch `item` until `quorum` signatures agree within a round.
    ///
    /// Each round issues up to `samples_per_round` fetches and stops early on
    /// quorum, or once quorum is out of reach for the samples left. Counts do
    /// not carry over between rounds.
    #[instrument(skip_all, fields(item = %item))]
    pub async fn validate<U: Upstream, S: Sleeper>(
        &self,
        item: &WorkItem,
        upstream: &U,
        sleeper: &S,
    ) -> Verdict {
        let mut requests = 0u32;

        for round in 1..=self.round_limit {
            // signature -> (count, first payload)
            let mut tally: HashMap<String, (u32, Vec<u8>)> = HashMap::new();
            let mut best = 0u32;
            let mut successes = 0u32;
            let mut last_error = String::new();

            for sample in 0..self.samples_per_round {
                let remaining = self.samples_per_round - sample;
                if best + remaining < self.quorum {
                    break;
                }

                let fetched = fetch_with_retry(item, upstream, sleeper, &self.policy).await;
                requests += fetched.attempts();
                match fetched {
                    RetriedFetch::Success { payload, .. } => {
                        successes += 1;
                        let signature = self.canonicalizer.signature(&payload);
                        let slot = tally.entry(signature.clone()).or_insert((0, payload));
                        slot.0 += 1;
                        best = best.max(slot.0);
                        if slot.0 >= self.quorum {
                            let payload = std::mem::take(&mut slot.1);
                            debug!(round, requests, "quorum reached");
                            return Verdict::Accepted(Accepted {
                                payload,
                                signature,
                                round,
                                requests,
                            });
                        }
                    }
                    RetriedFetch::Fatal { message, .. } => {
                        warn!(error = %message, "fatal upstream response");
                        return Verdict::Rejected(Rejection::Fatal(message));
                    }
                    RetriedFetch::Exhausted { message, .. } => {
                        last_error = message;
                    }
                }
            }

            if successes == 0 {
                warn!(round, error = %last_error, "round produced no payloads");
                return Verdict::Rejected(Rejection::Exhausted(last_error));
            }

            debug!(
                round,
                distinct = tally.len(),
                best,
                quorum = self.quorum,
                "round ended without quorum"
            );
        }

        warn!(rounds = self.round_limit, "consensus not reached");
        Verdict::Rejected(Rejection::Divergence {
            rounds: self.round_limit,
        })
    }
}
