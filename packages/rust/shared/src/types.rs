//! Core domain types: coordinates, resource kinds, work items, cache entries.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::HarvestError;

/// Number of decimal places every coordinate is held at.
pub const COORD_DECIMALS: u32 = 2;

/// Scale between degrees and the fixed-point representation.
const COORD_SCALE: f64 = 100.0;

// ---------------------------------------------------------------------------
// Coordinate
// ---------------------------------------------------------------------------

/// A location rounded to [`COORD_DECIMALS`] places.
///
/// Stored as fixed-point hundredths so that equality, hashing and ordering are
/// exact. Two raw positions that round to the same pair are the same
/// coordinate. Ordering is by `x` first, then `y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinate {
    x: i64,
    y: i64,
}

impl Coordinate {
    /// Round a raw `(x, y)` position (longitude, latitude) to fixed precision.
    pub fn new(x: f64, y: f64) -> Self {
        Self {
            x: (x * COORD_SCALE).round() as i64,
            y: (y * COORD_SCALE).round() as i64,
        }
    }

    /// `x` formatted the way it appears in filenames and query strings.
    pub fn x_str(&self) -> String {
        format_fixed(self.x)
    }

    /// `y` formatted the way it appears in filenames and query strings.
    pub fn y_str(&self) -> String {
        format_fixed(self.y)
    }
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.x_str(), self.y_str())
    }
}

/// Format a fixed-point value without float artefacts (and without `-0.00`).
fn format_fixed(scaled: i64) -> String {
    let sign = if scaled < 0 { "-" } else { "" };
    let abs = scaled.unsigned_abs();
    format!("{sign}{}.{:02}", abs / 100, abs % 100)
}

// ---------------------------------------------------------------------------
// ResourceKind
// ---------------------------------------------------------------------------

/// The kind of record fetched for a coordinate.
///
/// Config and CLI spell these as `siteInfo`, `species:<id>` and
/// `regimes:<id>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ResourceKind {
    /// Per-site climate and soil inputs.
    SiteInfo,
    /// Growth parameters for one species.
    Species { spec_id: u32 },
    /// Management regimes available for one species.
    Regimes { spec_id: u32 },
}

impl ResourceKind {
    /// Filename prefix for this kind.
    pub fn prefix(&self) -> &'static str {
        match self {
            Self::SiteInfo => "siteInfo",
            Self::Species { .. } => "species",
            Self::Regimes { .. } => "regimes",
        }
    }

    /// Optional filename discriminator (e.g. `specId_8`).
    pub fn discriminator(&self) -> Option<String> {
        match self {
            Self::SiteInfo => None,
            Self::Species { spec_id } | Self::Regimes { spec_id } => {
                Some(format!("specId_{spec_id}"))
            }
        }
    }

    /// Payload file extension.
    pub fn extension(&self) -> &'static str {
        "xml"
    }

    /// Filter selecting exactly this kind's entries from a cache index.
    pub fn entry_filter(&self) -> EntryFilter {
        EntryFilter {
            prefix: Some(self.prefix().to_string()),
            discriminator: self.discriminator(),
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SiteInfo => f.write_str("siteInfo"),
            Self::Species { spec_id } => write!(f, "species:{spec_id}"),
            Self::Regimes { spec_id } => write!(f, "regimes:{spec_id}"),
        }
    }
}

impl FromStr for ResourceKind {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, arg) = match s.split_once(':') {
            Some((name, arg)) => (name.trim(), Some(arg.trim())),
            None => (s.trim(), None),
        };

        let spec_id = || -> Result<u32, HarvestError> {
            let arg = arg.ok_or_else(|| {
                HarvestError::config(format!(
                    "resource kind '{name}' needs a species id, e.g. '{name}:8'"
                ))
            })?;
            arg.parse::<u32>().map_err(|e| {
                HarvestError::config(format!("invalid species id '{arg}' in '{s}': {e}"))
            })
        };

        match name {
            "siteInfo" | "siteinfo" => match arg {
                None => Ok(Self::SiteInfo),
                Some(_) => Err(HarvestError::config("siteInfo takes no species id")),
            },
            "species" => Ok(Self::Species { spec_id: spec_id()? }),
            "regimes" => Ok(Self::Regimes { spec_id: spec_id()? }),
            other => Err(HarvestError::config(format!(
                "unknown resource kind '{other}': expected siteInfo, species:<id> or regimes:<id>"
            ))),
        }
    }
}

impl TryFrom<String> for ResourceKind {
    type Error = HarvestError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceKind> for String {
    fn from(kind: ResourceKind) -> Self {
        kind.to_string()
    }
}

// ---------------------------------------------------------------------------
// WorkItem
// ---------------------------------------------------------------------------

/// One unit of acquisition work: a coordinate plus the record kind to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkItem {
    pub coordinate: Coordinate,
    pub kind: ResourceKind,
}

impl WorkItem {
    pub fn new(coordinate: Coordinate, kind: ResourceKind) -> Self {
        Self { coordinate, kind }
    }

    /// Canonical cache filename for this item.
    pub fn cache_entry(&self) -> CacheEntry {
        let mut name = format!(
            "{}_{}_{}",
            self.kind.prefix(),
            self.coordinate.x_str(),
            self.coordinate.y_str()
        );
        if let Some(disc) = self.kind.discriminator() {
            name.push('_');
            name.push_str(&disc);
        }
        name.push('.');
        name.push_str(self.kind.extension());
        CacheEntry(name)
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.coordinate)
    }
}

// ---------------------------------------------------------------------------
// CacheEntry
// ---------------------------------------------------------------------------

/// `{kind}_{x}_{y}[_{discriminator}].{ext}`
static ENTRY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([A-Za-z][A-Za-z0-9]*)_(-?\d+\.\d+)_(-?\d+\.\d+)(?:_([A-Za-z0-9_]+))?\.([A-Za-z0-9]+)$")
        .expect("cache entry regex")
});

/// A payload filename (no directory prefix) as recorded in the cache log.
///
/// Identity is plain string equality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheEntry(String);

impl CacheEntry {
    /// Accept `name` only if it follows the filename convention.
    pub fn parse(name: &str) -> Option<Self> {
        ENTRY_RE.is_match(name).then(|| Self(name.to_string()))
    }

    /// Break the filename into its components.
    pub fn components(&self) -> Option<ParsedEntry> {
        ParsedEntry::parse(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for CacheEntry {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// The components of a conforming cache filename.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    pub prefix: String,
    pub coordinate: Coordinate,
    pub discriminator: Option<String>,
    pub extension: String,
}

impl ParsedEntry {
    /// Parse a filename, returning `None` if it does not follow the convention.
    pub fn parse(name: &str) -> Option<Self> {
        let caps = ENTRY_RE.captures(name)?;
        let x: f64 = caps[2].parse().ok()?;
        let y: f64 = caps[3].parse().ok()?;
        Some(Self {
            prefix: caps[1].to_string(),
            coordinate: Coordinate::new(x, y),
            discriminator: caps.get(4).map(|m| m.as_str().to_string()),
            extension: caps[5].to_string(),
        })
    }
}

/// Selects cache entries by kind prefix and/or discriminator.
///
/// A `None` field matches anything; a `Some` field must match exactly.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryFilter {
    pub prefix: Option<String>,
    pub discriminator: Option<String>,
}

impl EntryFilter {
    /// Match every entry with the given kind prefix.
    pub fn by_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: Some(prefix.into()),
            discriminator: None,
        }
    }

    /// Match every entry carrying the given discriminator.
    pub fn by_discriminator(discriminator: impl Into<String>) -> Self {
        Self {
            prefix: None,
            discriminator: Some(discriminator.into()),
        }
    }

    pub fn matches(&self, entry: &ParsedEntry) -> bool {
        if let Some(prefix) = &self.prefix {
            if &entry.prefix != prefix {
                return false;
            }
        }
        match &self.discriminator {
            Some(disc) => entry.discriminator.as_deref() == Some(disc.as_str()),
            None => true,
        }
    }
}
