//! Application configuration for GridHarvest.
//!
//! User config lives at `~/.gridharvest/gridharvest.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};
use crate::types::ResourceKind;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "gridharvest.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".gridharvest";

// ---------------------------------------------------------------------------
// Config structs (matching gridharvest.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Upstream data service.
    #[serde(default)]
    pub upstream: UpstreamConfig,

    /// Worker pool sizing.
    #[serde(default)]
    pub pool: PoolConfig,

    /// Per-request retry budget.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Multi-sample agreement check.
    #[serde(default)]
    pub consensus: ConsensusConfig,

    /// Spatial mask and downsampling.
    #[serde(default)]
    pub grid: GridConfig,

    /// Payload directory and cache log.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Record kinds to acquire for every coordinate.
    #[serde(default)]
    pub resources: ResourcesConfig,
}

impl AppConfig {
    /// Reject settings that cannot drive a run.
    pub fn validate(&self) -> Result<()> {
        if self.pool.workers == 0 {
            return Err(HarvestError::config("pool.workers must be at least 1"));
        }
        if self.retry.max_attempts == 0 {
            return Err(HarvestError::config("retry.max_attempts must be at least 1"));
        }
        if self.grid.downsample == 0 {
            return Err(HarvestError::config("grid.downsample must be at least 1"));
        }
        let c = &self.consensus;
        if c.samples_per_round == 0 || c.round_limit == 0 {
            return Err(HarvestError::config(
                "consensus.samples_per_round and consensus.round_limit must be at least 1",
            ));
        }
        if c.quorum == 0 || c.quorum > c.samples_per_round {
            return Err(HarvestError::config(format!(
                "consensus.quorum must be between 1 and samples_per_round ({}), got {}",
                c.samples_per_round, c.quorum
            )));
        }
        if self.resources.kinds.is_empty() {
            return Err(HarvestError::config("resources.kinds must name at least one kind"));
        }
        Ok(())
    }
}

/// `[upstream]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Base URL of the data-builder API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Header the API key is sent in.
    #[serde(default = "default_api_key_header")]
    pub api_key_header: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Dataset version requested from the service.
    #[serde(default = "default_data_version")]
    pub data_version: u32,

    /// Spatial averaging area.
    #[serde(default = "default_area")]
    pub area: String,

    /// Forest category for site-info and regime requests.
    #[serde(default = "default_site_forest_category")]
    pub site_forest_category: String,

    /// Forest category for species requests.
    #[serde(default = "default_species_forest_category")]
    pub species_forest_category: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            api_key_header: default_api_key_header(),
            timeout_secs: default_timeout_secs(),
            data_version: default_data_version(),
            area: default_area(),
            site_forest_category: default_site_forest_category(),
            species_forest_category: default_species_forest_category(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.dcceew.gov.au/climate/carbon-accounting/2024/data/v1".into()
}
fn default_api_key_env() -> String {
    "FULLCAM_API_KEY".into()
}
fn default_api_key_header() -> String {
    "Ocp-Apim-Subscription-Key".into()
}
fn default_timeout_secs() -> u64 {
    100
}
fn default_data_version() -> u32 {
    2024
}
fn default_area() -> String {
    "OneKm".into()
}
fn default_site_forest_category() -> String {
    "All".into()
}
fn default_species_forest_category() -> String {
    "Plantation".into()
}

/// `[pool]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of concurrent fetch workers.
    #[serde(default = "default_workers")]
    pub workers: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
        }
    }
}

fn default_workers() -> usize {
    20
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per request before giving up on transient errors.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Backoff base; attempt `n` waits `base_delay_ms * 2^n`.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    8
}
fn default_base_delay_ms() -> u64 {
    1000
}

/// `[consensus]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsensusConfig {
    /// Independent fetches issued per round (`N`).
    #[serde(default = "default_samples_per_round")]
    pub samples_per_round: u32,

    /// Matching signatures required to accept (`q`).
    #[serde(default = "default_quorum")]
    pub quorum: u32,

    /// Rounds attempted before rejecting the item.
    #[serde(default = "default_round_limit")]
    pub round_limit: u32,

    /// Decimal places numeric content is rounded to before hashing.
    #[serde(default = "default_signature_decimals")]
    pub signature_decimals: u32,

    /// Regexes whose matches are stripped before hashing (server timestamps etc.).
    #[serde(default = "default_volatile_patterns")]
    pub volatile_patterns: Vec<String>,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            samples_per_round: default_samples_per_round(),
            quorum: default_quorum(),
            round_limit: default_round_limit(),
            signature_decimals: default_signature_decimals(),
            volatile_patterns: default_volatile_patterns(),
        }
    }
}

fn default_samples_per_round() -> u32 {
    3
}
fn default_quorum() -> u32 {
    2
}
fn default_round_limit() -> u32 {
    3
}
fn default_signature_decimals() -> u32 {
    6
}
fn default_volatile_patterns() -> Vec<String> {
    vec![
        r"\d{4}-\d{2}-\d{2}[T ]\d{2}:\d{2}:\d{2}(?:\.\d+)?(?:Z|[+-]\d{2}:?\d{2})?".into(),
        r#"(?i)\b\w*(?:timestamp|generated|requestid)\w*\s*=\s*"[^"]*""#.into(),
    ]
}

/// `[grid]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    /// ESRI ASCII grid whose valid cells define the working set.
    #[serde(default = "default_mask_path")]
    pub mask_path: String,

    /// Optional secondary grid restricting the working set to a sub-area.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region_path: Option<String>,

    /// Keep every `downsample`-th row and column.
    #[serde(default = "default_downsample")]
    pub downsample: usize,

    /// Cells whose value is below this are treated as outside the mask.
    #[serde(default = "default_min_value")]
    pub min_value: f64,
}

impl Default for GridConfig {
    fn default() -> Self {
        Self {
            mask_path: default_mask_path(),
            region_path: None,
            downsample: default_downsample(),
            min_value: default_min_value(),
        }
    }
}

fn default_mask_path() -> String {
    "data/mask.asc".into()
}
fn default_downsample() -> usize {
    10
}
fn default_min_value() -> f64 {
    -1.0
}

/// `[cache]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Directory payload files are written to.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Append-only log of completed filenames.
    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// Rebuild the log from `data_dir` when it is missing or empty.
    #[serde(default = "default_true")]
    pub auto_rebuild: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_file: default_log_file(),
            auto_rebuild: true,
        }
    }
}

fn default_data_dir() -> String {
    "downloaded".into()
}
fn default_log_file() -> String {
    "downloaded/successful_downloads.txt".into()
}
fn default_true() -> bool {
    true
}

/// `[resources]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcesConfig {
    /// Kinds fetched for every coordinate.
    #[serde(default = "default_kinds")]
    pub kinds: Vec<ResourceKind>,
}

impl Default for ResourcesConfig {
    fn default() -> Self {
        Self {
            kinds: default_kinds(),
        }
    }
}

fn default_kinds() -> Vec<ResourceKind> {
    vec![ResourceKind::SiteInfo, ResourceKind::Species { spec_id: 8 }]
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.gridharvest/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| HarvestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.gridharvest/gridharvest.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| HarvestError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| HarvestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| HarvestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| HarvestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the upstream API key from the environment variable named in config.
pub fn read_api_key(config: &UpstreamConfig) -> Result<String> {
    let var_name = &config.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(HarvestError::config(format!(
            "API key not found. Set the {var_name} environment variable."
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("data_dir"));
        assert!(toml_str.contains("FULLCAM_API_KEY"));
        assert!(toml_str.contains("species:8"));
    }

    #[test]
    fn config_roundtrip() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize");
        let parsed: AppConfig = toml::from_str(&toml_str).expect("deserialize");
        assert_eq!(parsed.pool.workers, 20);
        assert_eq!(parsed.retry.max_attempts, 8);
        assert_eq!(parsed.resources.kinds, config.resources.kinds);
        assert_eq!(
            parsed.consensus.volatile_patterns,
            config.consensus.volatile_patterns
        );
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[pool]
workers = 35

[grid]
mask_path = "/tmp/lumap.asc"
region_path = "/tmp/nsw.asc"

[resources]
kinds = ["siteInfo", "regimes:3"]
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.pool.workers, 35);
        assert_eq!(config.grid.downsample, 10);
        assert_eq!(config.grid.region_path.as_deref(), Some("/tmp/nsw.asc"));
        assert_eq!(
            config.resources.kinds,
            vec![ResourceKind::SiteInfo, ResourceKind::Regimes { spec_id: 3 }]
        );
        assert_eq!(config.consensus.quorum, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_resource_kind_is_rejected() {
        let toml_str = r#"
[resources]
kinds = ["weather"]
"#;
        assert!(toml::from_str::<AppConfig>(toml_str).is_err());
    }

    #[test]
    fn validate_rejects_quorum_above_samples() {
        let mut config = AppConfig::default();
        config.consensus.quorum = 4;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("quorum"));

        let mut config = AppConfig::default();
        config.grid.downsample = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn api_key_lookup() {
        let mut upstream = UpstreamConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        upstream.api_key_env = "GH_TEST_NONEXISTENT_KEY_12345".into();
        let result = read_api_key(&upstream);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
