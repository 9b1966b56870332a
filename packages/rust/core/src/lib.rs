//! Acquisition orchestration for GridHarvest.
//!
//! This crate ties together coordinate enumeration, the cache index and the
//! fetch worker pool into end-to-end workflows (`run_acquisition`, `status`)
//! plus the cache maintenance commands.

pub mod maintenance;
pub mod pipeline;

pub use maintenance::{VerifyReport, rebuild_cache, verify_cache};
pub use pipeline::{
    KindStatus, Plan, ProgressReporter, RunConfig, RunSummary, SilentProgress, StatusReport,
    open_cache, required_items, run_acquisition, status,
};
