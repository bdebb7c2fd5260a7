//! Job registry (`jobs.yaml`) and explicit destination configuration.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sodp_destination::{
    ConflictKey, DestinationConfig, UpsertSettings, DEFAULT_BATCH_SIZE, DEFAULT_SCHEMA,
};
use sodp_http::{BackoffPolicy, HttpClientConfig};
use sodp_sources::{SourceSpec, PARTITION_PLACEHOLDER};
use thiserror::Error;
use tokio::fs;
use tracing::info;

use crate::safety::CountCheckMode;

pub const FETCH_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("destination {destination} requires environment variable {variable}")]
    MissingVariable {
        destination: String,
        variable: String,
    },
    #[error("unknown job {0:?}")]
    UnknownJob(String),
    #[error("job {0:?} is declared more than once")]
    DuplicateJob(String),
    #[error("dataset {dataset}: invalid conflict key {key:?}")]
    InvalidConflictKey { dataset: String, key: String },
    #[error("dataset {dataset}: url uses {{partition}} but no partitions are listed")]
    MissingPartitions { dataset: String },
    #[error("dataset {dataset}: batch size must be at least 1")]
    InvalidBatchSize { dataset: String },
    #[error("job {job}: dataset {dataset:?} is declared more than once")]
    DuplicateDataset { job: String, dataset: String },
    #[error("dataset {dataset}: delimiter {delimiter:?} is not a single-byte ASCII character")]
    InvalidDelimiter { dataset: String, delimiter: char },
    #[error("parsing job registry: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobRegistry {
    pub jobs: Vec<JobConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub datasets: Vec<DatasetConfig>,
    pub destinations: Vec<DestinationSpec>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatasetConfig {
    pub name: String,
    pub table: String,
    pub source: SourceSpec,
    pub conflict_key: String,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default)]
    pub partitions: Vec<String>,
    #[serde(default)]
    pub field_renames: BTreeMap<String, String>,
    #[serde(default)]
    pub exclude_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationSpec {
    pub name: String,
    #[serde(default)]
    pub env_prefix: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default = "default_schema")]
    pub default_schema: String,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_schema() -> String {
    DEFAULT_SCHEMA.to_string()
}

impl JobRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let registry: JobRegistry = serde_yaml::from_str(text)?;
        registry.validate()?;
        Ok(registry)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for job in &self.jobs {
            if !seen.insert(job.name.as_str()) {
                return Err(ConfigError::DuplicateJob(job.name.clone()));
            }
            let mut datasets = BTreeSet::new();
            for dataset in &job.datasets {
                if !datasets.insert(dataset.name.as_str()) {
                    return Err(ConfigError::DuplicateDataset {
                        job: job.name.clone(),
                        dataset: dataset.name.clone(),
                    });
                }
                dataset.conflict_key()?;
                if let SourceSpec::Csv { delimiter, .. } = &dataset.source {
                    if !delimiter.is_ascii() {
                        return Err(ConfigError::InvalidDelimiter {
                            dataset: dataset.name.clone(),
                            delimiter: *delimiter,
                        });
                    }
                }
                if dataset.batch_size == 0 {
                    return Err(ConfigError::InvalidBatchSize {
                        dataset: dataset.name.clone(),
                    });
                }
                if dataset.partitions.is_empty() && dataset.source.url().contains(PARTITION_PLACEHOLDER) {
                    return Err(ConfigError::MissingPartitions {
                        dataset: dataset.name.clone(),
                    });
                }
            }
        }
        Ok(())
    }

    pub fn job(&self, name: &str) -> Result<&JobConfig, ConfigError> {
        self.jobs
            .iter()
            .find(|j| j.name == name)
            .ok_or_else(|| ConfigError::UnknownJob(name.to_string()))
    }
}

impl DatasetConfig {
    pub fn conflict_key(&self) -> Result<ConflictKey, ConfigError> {
        self.conflict_key
            .parse()
            .map_err(|_| ConfigError::InvalidConflictKey {
                dataset: self.name.clone(),
                key: self.conflict_key.clone(),
            })
    }

    /// Fetch units of this dataset: one per partition, or a single unpartitioned unit.
    pub fn units(&self) -> Vec<Option<&str>> {
        if self.partitions.is_empty() {
            vec![None]
        } else {
            self.partitions.iter().map(|p| Some(p.as_str())).collect()
        }
    }
}

impl DestinationSpec {
    pub fn variable(&self, suffix: &str) -> String {
        if self.env_prefix.is_empty() {
            suffix.to_string()
        } else {
            format!("{}_{}", self.env_prefix, suffix)
        }
    }

    /// Builds the connection parameters from `lookup`; blank values count as missing.
    pub fn resolve_with<F>(&self, lookup: F) -> Result<DestinationConfig, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let fetch = |suffix: &str| {
            let variable = self.variable(suffix);
            lookup(&variable).filter(|v| !v.trim().is_empty()).ok_or(ConfigError::MissingVariable {
                destination: self.name.clone(),
                variable,
            })
        };
        let url = fetch("SUPABASE_URL")?;
        let service_key = fetch("SUPABASE_SERVICE_KEY")?;
        let schema = lookup(&self.variable("SCHEMA"))
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| self.default_schema.clone());
        Ok(DestinationConfig {
            name: self.name.clone(),
            url,
            service_key,
            schema,
        })
    }
}

/// Process environment lookup for [`DestinationSpec::resolve_with`].
pub fn env_lookup(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

#[derive(Debug, Clone)]
pub struct ResolvedDestination {
    pub spec: DestinationSpec,
    pub config: DestinationConfig,
}

#[derive(Debug, Clone, Default)]
pub struct Resolution {
    /// Required destinations first, then optional ones, each in declaration order.
    pub ready: Vec<ResolvedDestination>,
    pub unconfigured: Vec<DestinationSpec>,
}

/// Resolves every destination of `job`, failing on the first required one that
/// lacks configuration. Optional destinations without configuration are skipped.
pub fn resolve_destinations<F>(job: &JobConfig, lookup: F) -> Result<Resolution, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut resolution = Resolution::default();
    let ordered = job
        .destinations
        .iter()
        .filter(|d| d.required)
        .chain(job.destinations.iter().filter(|d| !d.required));

    for spec in ordered {
        match spec.resolve_with(&lookup) {
            Ok(config) => resolution.ready.push(ResolvedDestination {
                spec: spec.clone(),
                config,
            }),
            Err(err) if spec.required => return Err(err),
            Err(err) => {
                info!(destination = %spec.name, reason = %err, "optional destination not configured, skipping");
                resolution.unconfigured.push(spec.clone());
            }
        }
    }
    Ok(resolution)
}

/// Tunables for one job run.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub fetch: HttpClientConfig,
    pub upsert: UpsertSettings,
    pub page_delay: Duration,
    pub partition_delay: Duration,
    pub count_mode: CountCheckMode,
    pub reports_dir: Option<PathBuf>,
}

impl Default for RunSettings {
    fn default() -> Self {
        Self {
            fetch: HttpClientConfig {
                timeout: Duration::from_secs(120),
                backoff: BackoffPolicy::default().with_max_attempts(FETCH_MAX_ATTEMPTS),
                ..HttpClientConfig::default()
            },
            upsert: UpsertSettings::default(),
            page_delay: Duration::from_millis(100),
            partition_delay: Duration::from_millis(500),
            count_mode: CountCheckMode::default(),
            reports_dir: None,
        }
    }
}
