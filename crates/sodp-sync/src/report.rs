//! Run summary: what was fetched, what each destination acknowledged.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sodp_destination::RowCount;
use tokio::fs;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::reconcile::Reconciliation;
use crate::safety::{CountCheckMode, CountVerdict};

#[derive(Debug, Clone, Serialize)]
pub struct FetchResult {
    pub dataset: String,
    pub partition: Option<String>,
    pub records: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableResult {
    pub dataset: String,
    pub partition: Option<String>,
    pub table: String,
    pub submitted: usize,
    pub upserted: usize,
    pub failed_batches: usize,
    pub rows_before: RowCount,
    pub rows_after: RowCount,
    pub verdict: Option<CountVerdict>,
    pub reconciliation: Reconciliation,
    pub error: Option<String>,
}

impl TableResult {
    pub fn failed(&self, mode: CountCheckMode) -> bool {
        self.error.is_some()
            || (self.submitted > 0 && self.upserted == 0)
            || self.verdict.is_some_and(|v| !v.passes(mode))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DestinationStatus {
    Succeeded,
    Failed,
    /// Not attempted because a required destination failed first.
    Skipped,
    Unconfigured,
}

#[derive(Debug, Clone, Serialize)]
pub struct DestinationSummary {
    pub name: String,
    pub required: bool,
    pub schema: Option<String>,
    pub status: DestinationStatus,
    pub tables: Vec<TableResult>,
}

impl DestinationSummary {
    pub fn upserted(&self) -> usize {
        self.tables.iter().map(|t| t.upserted).sum()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JobSummary {
    pub run_id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub count_mode: CountCheckMode,
    pub fetches: Vec<FetchResult>,
    pub destinations: Vec<DestinationSummary>,
    pub success: bool,
}

impl JobSummary {
    /// Closes the run. It succeeds when every fetch succeeded, no required
    /// destination failed and no table lost rows.
    pub fn finish(
        run_id: Uuid,
        job: &str,
        started_at: DateTime<Utc>,
        count_mode: CountCheckMode,
        fetches: Vec<FetchResult>,
        destinations: Vec<DestinationSummary>,
    ) -> Self {
        let fetches_ok = fetches.iter().all(|f| f.error.is_none());
        let required_ok = destinations
            .iter()
            .filter(|d| d.required)
            .all(|d| d.status == DestinationStatus::Succeeded);
        let no_decrease = destinations
            .iter()
            .flat_map(|d| &d.tables)
            .all(|t| !t.verdict.is_some_and(CountVerdict::is_decrease));

        Self {
            run_id,
            job: job.to_string(),
            started_at,
            finished_at: Utc::now(),
            count_mode,
            fetches,
            destinations,
            success: fetches_ok && required_ok && no_decrease,
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }

    pub fn log(&self) {
        let fetched: usize = self.fetches.iter().map(|f| f.records).sum();
        info!(
            run_id = %self.run_id,
            job = %self.job,
            fetched,
            elapsed_s = (self.finished_at - self.started_at).num_seconds(),
            "job summary"
        );
        for fetch in self.fetches.iter().filter(|f| f.error.is_some()) {
            error!(dataset = %fetch.dataset, partition = ?fetch.partition, error = ?fetch.error, "fetch failed");
        }
        for dest in &self.destinations {
            info!(
                destination = %dest.name,
                required = dest.required,
                status = ?dest.status,
                upserted = dest.upserted(),
                "destination result"
            );
            for table in &dest.tables {
                if table.verdict.is_some_and(CountVerdict::is_decrease) {
                    warn!(
                        destination = %dest.name,
                        table = %table.table,
                        rows_before = %table.rows_before,
                        rows_after = %table.rows_after,
                        "ROW COUNT DECREASED"
                    );
                }
            }
        }
        if self.success {
            info!(job = %self.job, "job succeeded");
        } else {
            error!(job = %self.job, "job failed");
        }
    }
}

/// Writes `<root>/<run_id>/summary.json` and returns the run directory.
pub async fn write_summary(root: &Path, summary: &JobSummary) -> Result<PathBuf> {
    let run_dir = root.join(summary.run_id.to_string());
    fs::create_dir_all(&run_dir)
        .await
        .with_context(|| format!("creating {}", run_dir.display()))?;

    let json = serde_json::to_vec_pretty(summary).context("serializing job summary")?;
    fs::write(run_dir.join("summary.json"), json)
        .await
        .context("writing summary.json")?;
    Ok(run_dir)
}
