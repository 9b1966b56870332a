//! Canonical payload signatures.
//!
//! Two responses for the same item agree when, after removing volatile text
//! (server timestamps, request ids), their numeric content rounds to the same
//! series. The signature is the SHA-256 of that series.

use std::fmt::Write as _;
use std::sync::LazyLock;

use regex::Regex;
use sha2::{Digest, Sha256};

use gridharvest_shared::{ConsensusConfig, HarvestError, Result};

static NUMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[-+]?(?:\d+\.?\d*|\.\d+)(?:[eE][-+]?\d+)?").expect("number regex")
});

#[derive(Debug, Clone)]
pub struct Canonicalizer {
    volatile: Vec<Regex>,
    decimals: usize,
}

impl Canonicalizer {
    pub fn new(volatile_patterns: &[String], decimals: u32) -> Result<Self> {
        let volatile = volatile_patterns
            .iter()
            .map(|p| {
                Regex::new(p).map_err(|e| {
                    HarvestError::config(format!("invalid volatile pattern '{p}': {e}"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            volatile,
            decimals: decimals as usize,
        })
    }

    pub fn from_config(config: &ConsensusConfig) -> Result<Self> {
        Self::new(&config.volatile_patterns, config.signature_decimals)
    }

    /// The rounded numeric series of `payload`, one value per line.
    pub fn canonical_form(&self, payload: &[u8]) -> String {
        let mut text = String::from_utf8_lossy(payload).into_owned();
        for re in &self.volatile {
            if re.is_match(&text) {
                text = re.replace_all(&text, "").into_owned();
            }
        }

        let mut out = String::new();
        for token in NUMBER_RE.find_iter(&text) {
            let Ok(value) = token.as_str().parse::<f64>() else {
                continue;
            };
            if !value.is_finite() {
                continue;
            }
            let mut rounded = format!("{value:.prec$}", prec = self.decimals);
            if rounded.starts_with('-') && rounded[1..].bytes().all(|b| b == b'0' || b == b'.') {
                rounded.remove(0);
            }
            let _ = writeln!(out, "{rounded}");
        }
        out
    }

    /// Lowercase hex SHA-256 of [`Self::canonical_form`].
    pub fn signature(&self, payload: &[u8]) -> String {
        let digest = Sha256::digest(self.canonical_form(payload).as_bytes());
        digest.iter().fold(String::with_capacity(64), |mut hex, b| {
            let _ = write!(hex, "{b:02x}");
            hex
        })
    }
}
