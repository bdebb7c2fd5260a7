//! Job runner: fetch every dataset once, then fan the records out to each destination.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Serialize;
use sodp_core::Record;
use sodp_destination::{Destination, PostgrestClient, RowCount};
use sodp_http::{politeness_pause, HttpFetcher};
use sodp_sources::{source_for_spec, SourceContext};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{resolve_destinations, DatasetConfig, DestinationSpec, JobConfig, RunSettings};
use crate::reconcile::{reconcile, LiveSchema};
use crate::report::{
    write_summary, DestinationStatus, DestinationSummary, FetchResult, JobSummary, TableResult,
};
use crate::safety::compare_counts;

/// Records of one dataset (or one partition of it), or why they could not be fetched.
#[derive(Debug, Clone)]
pub struct FetchedUnit {
    pub dataset: String,
    pub partition: Option<String>,
    pub records: Vec<Record>,
    pub error: Option<String>,
}

impl FetchedUnit {
    fn result(&self) -> FetchResult {
        FetchResult {
            dataset: self.dataset.clone(),
            partition: self.partition.clone(),
            records: self.records.len(),
            error: self.error.clone(),
        }
    }
}

/// A connected destination together with the spec it was resolved from.
#[derive(Clone)]
pub struct Target {
    pub spec: DestinationSpec,
    pub destination: Arc<dyn Destination>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TableCount {
    pub destination: String,
    pub table: String,
    pub rows: RowCount,
}

#[derive(Debug, Clone, Default)]
pub struct JobRunner {
    settings: RunSettings,
}

impl JobRunner {
    pub fn new(settings: RunSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RunSettings {
        &self.settings
    }

    /// Connects every configured destination of `job`; required ones must resolve.
    pub fn connect<F>(&self, job: &JobConfig, lookup: F) -> Result<(Vec<Target>, Vec<DestinationSpec>)>
    where
        F: Fn(&str) -> Option<String>,
    {
        let resolution = resolve_destinations(job, lookup)?;
        let targets = resolution
            .ready
            .into_iter()
            .map(|resolved| -> Result<Target> {
                let client = PostgrestClient::new(resolved.config, self.settings.upsert.clone())?;
                Ok(Target {
                    spec: resolved.spec,
                    destination: Arc::new(client) as Arc<dyn Destination>,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok((targets, resolution.unconfigured))
    }

    pub async fn run<F>(&self, job: &JobConfig, lookup: F) -> Result<JobSummary>
    where
        F: Fn(&str) -> Option<String>,
    {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let (targets, unconfigured) = self.connect(job, lookup)?;

        let span = info_span!("job", run_id = %run_id, job = %job.name);
        async {
            info!(
                datasets = job.datasets.len(),
                destinations = targets.len(),
                count_mode = ?self.settings.count_mode,
                "job started"
            );
            let fetched = self.fetch(job).await?;
            let mut destinations = self.deliver(job, &fetched, targets).await;
            destinations.extend(unconfigured.into_iter().map(|spec| DestinationSummary {
                name: spec.name,
                required: spec.required,
                schema: None,
                status: DestinationStatus::Unconfigured,
                tables: Vec::new(),
            }));

            let summary = JobSummary::finish(
                run_id,
                &job.name,
                started_at,
                self.settings.count_mode,
                fetched.iter().map(FetchedUnit::result).collect(),
                destinations,
            );
            summary.log();
            if let Some(root) = &self.settings.reports_dir {
                let run_dir = write_summary(root, &summary).await?;
                info!(path = %run_dir.display(), "summary written");
            }
            Ok::<_, anyhow::Error>(summary)
        }
        .instrument(span)
        .await
    }

    /// Fetches each dataset unit sequentially. A failing unit is recorded and
    /// does not stop the others.
    pub async fn fetch(&self, job: &JobConfig) -> Result<Vec<FetchedUnit>> {
        let ctx = SourceContext {
            http: HttpFetcher::new(self.settings.fetch.clone())?,
            page_delay: self.settings.page_delay,
        };

        let mut fetched = Vec::new();
        for dataset in &job.datasets {
            for (idx, partition) in dataset.units().into_iter().enumerate() {
                if idx > 0 {
                    politeness_pause(self.settings.partition_delay).await;
                }
                let source = source_for_spec(&dataset.source, partition, &ctx);
                let span = info_span!("fetch", dataset = %dataset.name, partition = partition.unwrap_or("-"));
                let result = source.fetch().instrument(span).await;

                let unit = match result {
                    Ok(records) => {
                        info!(dataset = %dataset.name, partition, records = records.len(), source = %source.describe(), "fetched");
                        FetchedUnit {
                            dataset: dataset.name.clone(),
                            partition: partition.map(str::to_string),
                            records,
                            error: None,
                        }
                    }
                    Err(err) => {
                        error!(dataset = %dataset.name, partition, error = %err, "fetch failed");
                        FetchedUnit {
                            dataset: dataset.name.clone(),
                            partition: partition.map(str::to_string),
                            records: Vec::new(),
                            error: Some(err.to_string()),
                        }
                    }
                };
                fetched.push(unit);
            }
        }
        Ok(fetched)
    }

    /// Upserts the fetched units into each target in order. Once a required
    /// target fails the remaining targets are skipped.
    pub async fn deliver(
        &self,
        job: &JobConfig,
        fetched: &[FetchedUnit],
        targets: Vec<Target>,
    ) -> Vec<DestinationSummary> {
        let mut summaries = Vec::with_capacity(targets.len());
        let mut aborted = false;

        for target in targets {
            let schema = Some(target.destination.schema().to_string());
            if aborted {
                warn!(destination = %target.spec.name, "skipped after required destination failure");
                summaries.push(DestinationSummary {
                    name: target.spec.name.clone(),
                    required: target.spec.required,
                    schema,
                    status: DestinationStatus::Skipped,
                    tables: Vec::new(),
                });
                continue;
            }

            let span = info_span!("destination", destination = %target.spec.name, required = target.spec.required);
            let tables = self.deliver_to(job, fetched, &target).instrument(span).await;
            let failed = tables.iter().any(|t| t.failed(self.settings.count_mode));
            let status = if failed {
                DestinationStatus::Failed
            } else {
                DestinationStatus::Succeeded
            };

            if failed && target.spec.required {
                error!(destination = %target.spec.name, "required destination failed");
                aborted = true;
            } else if failed {
                warn!(destination = %target.spec.name, "optional destination failed");
            }
            summaries.push(DestinationSummary {
                name: target.spec.name.clone(),
                required: target.spec.required,
                schema,
                status,
                tables,
            });
        }
        summaries
    }

    async fn deliver_to(&self, job: &JobConfig, fetched: &[FetchedUnit], target: &Target) -> Vec<TableResult> {
        let mut tables = Vec::new();
        for unit in fetched.iter().filter(|u| u.error.is_none()) {
            if unit.records.is_empty() {
                info!(dataset = %unit.dataset, partition = ?unit.partition, "no records, nothing to upsert");
                continue;
            }
            let Some(dataset) = job.datasets.iter().find(|d| d.name == unit.dataset) else {
                continue;
            };
            tables.push(self.upsert_unit(dataset, unit, target.destination.as_ref()).await);
        }
        tables
    }

    async fn upsert_unit(
        &self,
        dataset: &DatasetConfig,
        unit: &FetchedUnit,
        destination: &dyn Destination,
    ) -> TableResult {
        let table = dataset.table.as_str();
        let schema = LiveSchema::discover(destination, table).await;
        let (records, reconciliation) = reconcile(unit.records.clone(), dataset, &schema);

        let mut result = TableResult {
            dataset: dataset.name.clone(),
            partition: unit.partition.clone(),
            table: table.to_string(),
            submitted: records.len(),
            upserted: 0,
            failed_batches: 0,
            rows_before: RowCount::Unknown,
            rows_after: RowCount::Unknown,
            verdict: None,
            reconciliation,
            error: None,
        };

        let conflict = match dataset.conflict_key() {
            Ok(conflict) => conflict,
            Err(err) => {
                result.error = Some(err.to_string());
                return result;
            }
        };

        result.rows_before = destination.row_count(table).await;
        match destination
            .upsert(table, &records, &conflict, dataset.batch_size)
            .await
        {
            Ok(report) => {
                result.upserted = report.upserted;
                result.failed_batches = report.failed_batches();
            }
            Err(err) => {
                error!(table, error = %err, "upsert refused");
                result.error = Some(err.to_string());
                return result;
            }
        }
        result.rows_after = destination.row_count(table).await;

        let verdict = compare_counts(result.rows_before, result.rows_after);
        result.verdict = Some(verdict);

        info!(
            table,
            upserted = result.upserted,
            submitted = result.submitted,
            rows_before = %result.rows_before,
            rows_after = %result.rows_after,
            verdict = ?verdict,
            "table upserted"
        );
        if result.failed_batches > 0 {
            warn!(table, failed_batches = result.failed_batches, "some batches failed");
        }
        if verdict.is_decrease() {
            warn!(table, rows_before = %result.rows_before, rows_after = %result.rows_after, "row count decreased");
        } else if result.rows_before.known().is_none() || result.rows_after.known().is_none() {
            warn!(table, count_mode = ?self.settings.count_mode, "row count could not be determined");
        }
        result
    }

    /// Current row count of every table `job` writes, per target.
    pub async fn counts(&self, job: &JobConfig, targets: &[Target]) -> Vec<TableCount> {
        let mut seen = BTreeSet::new();
        let tables: Vec<&str> = job
            .datasets
            .iter()
            .map(|d| d.table.as_str())
            .filter(|table| seen.insert(*table))
            .collect();

        let mut counts = Vec::new();
        for target in targets {
            for table in &tables {
                counts.push(TableCount {
                    destination: target.spec.name.clone(),
                    table: table.to_string(),
                    rows: target.destination.row_count(table).await,
                });
            }
        }
        counts
    }
}
