//! Shared types, error model, and configuration for GridHarvest.
//!
//! This crate is the foundation depended on by all other GridHarvest crates.
//! It provides:
//! - [`HarvestError`], the unified error type
//! - Domain types ([`Coordinate`], [`ResourceKind`], [`WorkItem`], [`CacheEntry`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CacheConfig, ConsensusConfig, GridConfig, PoolConfig, ResourcesConfig,
    RetryConfig, UpstreamConfig, config_dir, config_file_path, init_config, load_config,
    load_config_from, read_api_key,
};
pub use error::{HarvestError, Result};
pub use types::{
    COORD_DECIMALS, CacheEntry, Coordinate, EntryFilter, ParsedEntry, ResourceKind, WorkItem,
};
