//! Record source contracts + the ArcGIS and CSV source implementations.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sodp_core::Record;
use sodp_http::{FetchError, HttpFetcher};
use thiserror::Error;

pub mod arcgis;
pub mod csv_source;
pub mod zefix;

pub use arcgis::{ArcGisFetcher, ArcGisOptions};
pub use csv_source::{parse_csv, CsvSource};

pub const CRATE_NAME: &str = "sodp-sources";

/// Placeholder substituted with the partition value in partitioned source URLs.
pub const PARTITION_PLACEHOLDER: &str = "{partition}";

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("source rejected the query (code {code:?}): {message}")]
    Service { code: Option<i64>, message: String },
    #[error("source did not report a record count: {response}")]
    MissingCount { response: String },
    #[error("parsing csv: {0}")]
    Csv(#[from] csv::Error),
    #[error("csv delimiter {0:?} is not a single-byte ASCII character")]
    Delimiter(char),
}

/// Shared handles every source needs to talk to its remote.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub http: HttpFetcher,
    pub page_delay: Duration,
}

#[async_trait]
pub trait RecordSource: Send + Sync {
    fn describe(&self) -> String;

    /// Retrieves every record of the source, normalized and in source order.
    async fn fetch(&self) -> Result<Vec<Record>, SourceError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsvShape {
    /// Header keys and cell values run through the shared normalization.
    #[default]
    Normalized,
    /// Swiss company registry rows mapped onto the companies table.
    Zefix,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceSpec {
    Arcgis {
        url: String,
        #[serde(default = "default_include_geometry")]
        include_geometry: bool,
        #[serde(default = "default_out_sr")]
        out_sr: u32,
        #[serde(default = "default_page_size")]
        page_size: usize,
    },
    Csv {
        url: String,
        #[serde(default = "default_delimiter")]
        delimiter: char,
        #[serde(default)]
        shape: CsvShape,
    },
}

fn default_include_geometry() -> bool {
    true
}

fn default_out_sr() -> u32 {
    arcgis::DEFAULT_OUT_SR
}

fn default_page_size() -> usize {
    arcgis::DEFAULT_PAGE_SIZE
}

fn default_delimiter() -> char {
    ','
}

impl SourceSpec {
    pub fn url(&self) -> &str {
        match self {
            SourceSpec::Arcgis { url, .. } | SourceSpec::Csv { url, .. } => url,
        }
    }

    pub fn url_for_partition(&self, partition: Option<&str>) -> String {
        match partition {
            Some(value) => self.url().replace(PARTITION_PLACEHOLDER, value),
            None => self.url().to_string(),
        }
    }
}

pub fn source_for_spec(
    spec: &SourceSpec,
    partition: Option<&str>,
    ctx: &SourceContext,
) -> Box<dyn RecordSource> {
    let url = spec.url_for_partition(partition);
    match spec {
        SourceSpec::Arcgis {
            include_geometry,
            out_sr,
            page_size,
            ..
        } => Box::new(arcgis::ArcGisLayer {
            url,
            fetcher: ArcGisFetcher::new(
                ctx.http.clone(),
                ArcGisOptions {
                    include_geometry: *include_geometry,
                    out_sr: *out_sr,
                    page_size: *page_size,
                    page_delay: ctx.page_delay,
                },
            ),
        }),
        SourceSpec::Csv {
            delimiter, shape, ..
        } => Box::new(CsvSource {
            url,
            delimiter: *delimiter,
            shape: *shape,
            partition: partition.map(str::to_string),
            http: ctx.http.clone(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arcgis_spec_defaults() {
        let spec: SourceSpec = serde_json::from_value(serde_json::json!({
            "kind": "arcgis",
            "url": "https://example.test/FeatureServer/0"
        }))
        .unwrap();
        assert_eq!(
            spec,
            SourceSpec::Arcgis {
                url: "https://example.test/FeatureServer/0".into(),
                include_geometry: true,
                out_sr: 4326,
                page_size: 2000,
            }
        );
        assert_eq!(spec.url_for_partition(None), spec.url());
    }

    #[test]
    fn csv_spec_with_partition_placeholder() {
        let spec: SourceSpec = serde_json::from_value(serde_json::json!({
            "kind": "csv",
            "url": "https://example.test/companies_{partition}.csv",
            "shape": "zefix"
        }))
        .unwrap();
        assert_eq!(
            spec.url_for_partition(Some("GE")),
            "https://example.test/companies_GE.csv"
        );
        assert!(matches!(
            spec,
            SourceSpec::Csv {
                delimiter: ',',
                shape: CsvShape::Zefix,
                ..
            }
        ));
    }
}
