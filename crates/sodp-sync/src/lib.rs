//! Job orchestration: registry, destination resolution, fan-out upserts and
//! row-count safety reporting.

pub mod config;
pub mod reconcile;
pub mod report;
pub mod runner;
pub mod safety;

pub use config::{
    env_lookup, resolve_destinations, ConfigError, DatasetConfig, DestinationSpec, JobConfig,
    JobRegistry, RunSettings,
};
pub use report::{DestinationStatus, DestinationSummary, JobSummary, TableResult};
pub use runner::{FetchedUnit, JobRunner, TableCount, Target};
pub use safety::{compare_counts, CountCheckMode, CountVerdict};

pub const CRATE_NAME: &str = "sodp-sync";
