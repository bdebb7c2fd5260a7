//! PostgREST-backed upsert destinations: batched idempotent writes + table probes.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderValue, AUTHORIZATION};
use serde::Serialize;
use serde_json::{Map, Value};
use sodp_core::{first_key_set_mismatch, Record};
use sodp_http::{politeness_pause, BackoffPolicy, FetchError, HttpClientConfig, HttpFetcher};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};

pub const CRATE_NAME: &str = "sodp-destination";

pub const DEFAULT_SCHEMA: &str = "public";
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const UPSERT_MAX_ATTEMPTS: u32 = 3;

const MERGE_DUPLICATES: &str = "resolution=merge-duplicates";
const COUNT_EXACT: &str = "count=exact";

/// Connection parameters of one upsert target.
#[derive(Clone, PartialEq, Eq)]
pub struct DestinationConfig {
    pub name: String,
    pub url: String,
    pub service_key: String,
    pub schema: String,
}

impl fmt::Debug for DestinationConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationConfig")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("service_key", &"<redacted>")
            .field("schema", &self.schema)
            .finish()
    }
}

impl DestinationConfig {
    /// REST root the tables hang off, e.g. `https://x.supabase.co/rest/v1`.
    pub fn rest_endpoint(&self) -> String {
        format!("{}/rest/v1", self.url.trim_end_matches('/'))
    }

    pub fn table_url(&self, table: &str) -> String {
        format!("{}/{}", self.rest_endpoint(), table)
    }

    fn profile(&self) -> Option<&str> {
        let schema = self.schema.trim();
        (!schema.is_empty() && schema != DEFAULT_SCHEMA).then_some(schema)
    }
}

/// Column (or column set) that identifies an existing row for merge-on-conflict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConflictKey(Vec<String>);

impl ConflictKey {
    pub fn columns(&self) -> &[String] {
        &self.0
    }

    pub fn as_param(&self) -> String {
        self.0.join(",")
    }
}

impl FromStr for ConflictKey {
    type Err = DestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let columns: Vec<String> = s
            .split(',')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .collect();
        if columns.is_empty() {
            return Err(DestinationError::InvalidConflictKey(s.to_string()));
        }
        Ok(Self(columns))
    }
}

impl fmt::Display for ConflictKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_param())
    }
}

/// Row count of a table, or `Unknown` when it could not be determined.
///
/// `Unknown` is never zero: callers must not compare it numerically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowCount {
    Known(u64),
    Unknown,
}

impl Serialize for RowCount {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RowCount::Known(n) => serializer.serialize_u64(*n),
            RowCount::Unknown => serializer.serialize_str("unknown"),
        }
    }
}

impl RowCount {
    pub fn known(self) -> Option<u64> {
        match self {
            RowCount::Known(n) => Some(n),
            RowCount::Unknown => None,
        }
    }
}

impl fmt::Display for RowCount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowCount::Known(n) => write!(f, "{n}"),
            RowCount::Unknown => f.write_str("unknown"),
        }
    }
}

/// Total from a `content-range` header such as `0-24/3573` or `*/0`.
pub fn parse_content_range_total(header: Option<&str>) -> RowCount {
    header
        .and_then(|h| h.rsplit_once('/'))
        .and_then(|(_, total)| total.trim().parse::<u64>().ok())
        .map_or(RowCount::Unknown, RowCount::Known)
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("records must share one key set: record {index} differs from record 0")]
    HeterogeneousKeys { index: usize },
    #[error("batch size must be at least 1")]
    InvalidBatchSize,
    #[error("invalid conflict key {0:?}")]
    InvalidConflictKey(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BatchOutcome {
    Acknowledged { rows: usize },
    /// `rejected` marks a permanent 4xx refusal as opposed to exhausted retries.
    Failed { rejected: bool, reason: String },
}

impl BatchOutcome {
    pub fn rows(&self) -> usize {
        match self {
            BatchOutcome::Acknowledged { rows } => *rows,
            BatchOutcome::Failed { .. } => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub index: usize,
    pub size: usize,
    pub outcome: BatchOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub submitted: usize,
    pub upserted: usize,
    pub batches: Vec<BatchResult>,
}

impl UpsertReport {
    pub fn failed_batches(&self) -> usize {
        self.batches
            .iter()
            .filter(|b| matches!(b.outcome, BatchOutcome::Failed { .. }))
            .count()
    }
}

/// Upsert target seam; the job runner only talks to destinations through it.
#[async_trait]
pub trait Destination: Send + Sync {
    fn name(&self) -> &str;

    fn schema(&self) -> &str;

    /// Upserts `records` in chunks of `batch_size`, returning acknowledged counts.
    ///
    /// A failing chunk counts zero rows and never stops later chunks.
    async fn upsert(
        &self,
        table: &str,
        records: &[Record],
        conflict: &ConflictKey,
        batch_size: usize,
    ) -> Result<UpsertReport, DestinationError>;

    async fn row_count(&self, table: &str) -> RowCount;

    async fn has_column(&self, table: &str, column: &str) -> bool;

    /// Live column set sampled from one row; `None` when the table is empty or unreachable.
    async fn table_columns(&self, table: &str) -> Option<BTreeSet<String>>;
}

#[derive(Debug, Clone)]
pub struct UpsertSettings {
    pub http: HttpClientConfig,
    pub batch_delay: Duration,
    pub probe_timeout: Duration,
}

impl Default for UpsertSettings {
    fn default() -> Self {
        Self {
            http: HttpClientConfig {
                timeout: Duration::from_secs(30),
                backoff: BackoffPolicy::default().with_max_attempts(UPSERT_MAX_ATTEMPTS),
                ..HttpClientConfig::default()
            },
            batch_delay: Duration::from_millis(300),
            probe_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PostgrestClient {
    config: DestinationConfig,
    http: HttpFetcher,
    batch_delay: Duration,
    probe_timeout: Duration,
}

impl PostgrestClient {
    pub fn new(config: DestinationConfig, settings: UpsertSettings) -> anyhow::Result<Self> {
        let http = HttpFetcher::new(settings.http)?;
        Ok(Self {
            config,
            http,
            batch_delay: settings.batch_delay,
            probe_timeout: settings.probe_timeout,
        })
    }

    pub fn config(&self) -> &DestinationConfig {
        &self.config
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let bearer = format!("Bearer {}", self.config.service_key);
        let mut builder = builder.header("apikey", self.config.service_key.as_str());
        match HeaderValue::from_str(&bearer) {
            Ok(mut value) => {
                value.set_sensitive(true);
                builder = builder.header(AUTHORIZATION, value);
            }
            Err(_) => warn!(destination = %self.config.name, "service key is not a valid header value"),
        }
        builder
    }

    fn read_request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let builder = self.authorized(builder).timeout(self.probe_timeout);
        match self.config.profile() {
            Some(schema) => builder.header("Accept-Profile", schema),
            None => builder,
        }
    }

    fn write_request(&self, table: &str, batch: &[Record], conflict: &ConflictKey) -> reqwest::RequestBuilder {
        let builder = self
            .authorized(self.http.client().post(self.config.table_url(table)))
            .query(&[("on_conflict", conflict.as_param())])
            .header("Prefer", MERGE_DUPLICATES)
            .json(batch);
        match self.config.profile() {
            Some(schema) => builder.header("Content-Profile", schema),
            None => builder,
        }
    }

    async fn upsert_batch(&self, table: &str, batch: &[Record], conflict: &ConflictKey) -> BatchOutcome {
        let label = self.config.table_url(table);
        match self
            .http
            .send(&label, || self.write_request(table, batch, conflict))
            .await
        {
            Ok(_) => BatchOutcome::Acknowledged { rows: batch.len() },
            Err(err) => {
                let rejected = err.is_rejection();
                match &err {
                    FetchError::HttpStatus { status, body, .. } => {
                        error!(status, body = %body, "batch rejected")
                    }
                    other => error!(error = %other, "batch failed"),
                }
                BatchOutcome::Failed {
                    rejected,
                    reason: err.to_string(),
                }
            }
        }
    }

    async fn upsert_all(
        &self,
        table: &str,
        records: &[Record],
        conflict: &ConflictKey,
        batch_size: usize,
    ) -> Result<UpsertReport, DestinationError> {
        if batch_size == 0 {
            return Err(DestinationError::InvalidBatchSize);
        }
        if let Some(index) = first_key_set_mismatch(records) {
            return Err(DestinationError::HeterogeneousKeys { index });
        }

        let mut report = UpsertReport {
            submitted: records.len(),
            ..UpsertReport::default()
        };
        let total_batches = records.len().div_ceil(batch_size);

        for (idx, batch) in records.chunks(batch_size).enumerate() {
            if idx > 0 {
                politeness_pause(self.batch_delay).await;
            }
            let outcome = self.upsert_batch(table, batch, conflict).await;
            let rows = outcome.rows();
            report.upserted += rows;
            info!(
                batch = idx + 1,
                total_batches,
                rows,
                size = batch.len(),
                status = if rows > 0 { "OK" } else { "FAIL" },
                "batch upserted"
            );
            report.batches.push(BatchResult {
                index: idx + 1,
                size: batch.len(),
                outcome,
            });
        }

        Ok(report)
    }
}

#[async_trait]
impl Destination for PostgrestClient {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn schema(&self) -> &str {
        &self.config.schema
    }

    async fn upsert(
        &self,
        table: &str,
        records: &[Record],
        conflict: &ConflictKey,
        batch_size: usize,
    ) -> Result<UpsertReport, DestinationError> {
        let span = info_span!("upsert", destination = %self.config.name, table, conflict = %conflict);
        self.upsert_all(table, records, conflict, batch_size)
            .instrument(span)
            .await
    }

    async fn row_count(&self, table: &str) -> RowCount {
        let request = self
            .read_request(self.http.client().head(self.config.table_url(table)))
            .query(&[("select", "count")])
            .header("Prefer", COUNT_EXACT);
        match request.send().await {
            Ok(resp) if resp.status().is_success() => {
                let header = resp
                    .headers()
                    .get("content-range")
                    .and_then(|v| v.to_str().ok());
                parse_content_range_total(header)
            }
            Ok(resp) => {
                warn!(table, status = resp.status().as_u16(), "row count probe refused");
                RowCount::Unknown
            }
            Err(err) => {
                warn!(table, error = %err, "could not get row count");
                RowCount::Unknown
            }
        }
    }

    async fn has_column(&self, table: &str, column: &str) -> bool {
        let request = self
            .read_request(self.http.client().get(self.config.table_url(table)))
            .query(&[("select", column), ("limit", "0")]);
        match request.send().await {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    async fn table_columns(&self, table: &str) -> Option<BTreeSet<String>> {
        let request = self
            .read_request(self.http.client().get(self.config.table_url(table)))
            .query(&[("limit", "1")]);
        let resp = match request.send().await {
            Ok(resp) if resp.status() == reqwest::StatusCode::OK => resp,
            Ok(_) => return None,
            Err(err) => {
                warn!(table, error = %err, "could not discover table columns");
                return None;
            }
        };
        let rows: Vec<Map<String, Value>> = match resp.json().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(table, error = %err, "could not decode sample row");
                return None;
            }
        };
        rows.into_iter()
            .next()
            .map(|row| row.into_iter().map(|(k, _)| k).collect())
    }
}
