//! Paginated retrieval from ArcGIS FeatureServer layers.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value};
use sodp_core::{record_from_attributes, Record, GEOMETRY_FIELD};
use sodp_http::{politeness_pause, HttpFetcher};
use tracing::{info, info_span, warn, Instrument};

use crate::{RecordSource, SourceError};

/// Largest page a FeatureServer returns by default.
pub const DEFAULT_PAGE_SIZE: usize = 2000;
/// WGS84.
pub const DEFAULT_OUT_SR: u32 = 4326;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArcGisOptions {
    pub include_geometry: bool,
    pub out_sr: u32,
    pub page_size: usize,
    pub page_delay: Duration,
}

impl Default for ArcGisOptions {
    fn default() -> Self {
        Self {
            include_geometry: true,
            out_sr: DEFAULT_OUT_SR,
            page_size: DEFAULT_PAGE_SIZE,
            page_delay: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceErrorBody {
    code: Option<i64>,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct CountResponse {
    count: Option<u64>,
    error: Option<ServiceErrorBody>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    features: Vec<Feature>,
    error: Option<ServiceErrorBody>,
}

#[derive(Debug, Deserialize)]
struct Feature {
    attributes: Option<Map<String, Value>>,
    geometry: Option<Value>,
}

impl From<ServiceErrorBody> for SourceError {
    fn from(body: ServiceErrorBody) -> Self {
        SourceError::Service {
            code: body.code,
            message: body.message,
        }
    }
}

/// Offsets of the pages covering `[0, count)`, produced lazily.
pub fn page_offsets(count: u64, page_size: usize) -> impl Iterator<Item = u64> {
    (0..count).step_by(page_size.max(1))
}

/// Number of pages a count implies; the count itself is only a hint.
pub fn page_total(count: u64, page_size: usize) -> u64 {
    count.div_ceil(page_size.max(1) as u64)
}

fn layer_root(base_url: &str) -> &str {
    base_url.trim_end_matches('/')
}

pub fn count_url(base_url: &str) -> String {
    format!(
        "{}/query?where=1%3D1&returnCountOnly=true&f=json",
        layer_root(base_url)
    )
}

pub fn page_url(base_url: &str, options: &ArcGisOptions, offset: u64) -> String {
    format!(
        "{}/query?where=1%3D1&outFields=*&returnGeometry={}&outSR={}&resultOffset={}&resultRecordCount={}&f=json",
        layer_root(base_url),
        options.include_geometry,
        options.out_sr,
        offset,
        options.page_size.max(1),
    )
}

fn has_geometry(geometry: &Value) -> bool {
    match geometry {
        Value::Null => false,
        Value::Object(map) => !map.is_empty(),
        _ => true,
    }
}

fn feature_to_record(feature: Feature, include_geometry: bool) -> Option<Record> {
    let attributes = feature.attributes.filter(|a| !a.is_empty())?;
    let mut record = record_from_attributes(&attributes);
    if include_geometry {
        if let Some(geometry) = feature.geometry.filter(has_geometry) {
            record.insert(GEOMETRY_FIELD.to_string(), Value::String(geometry.to_string()));
        }
    }
    Some(record)
}

#[derive(Debug, Clone)]
pub struct ArcGisFetcher {
    http: HttpFetcher,
    options: ArcGisOptions,
}

impl ArcGisFetcher {
    pub fn new(http: HttpFetcher, options: ArcGisOptions) -> Self {
        Self { http, options }
    }

    pub fn options(&self) -> &ArcGisOptions {
        &self.options
    }

    pub async fn record_count(&self, base_url: &str) -> Result<u64, SourceError> {
        let url = count_url(base_url);
        let value: Value = self.http.get_json(&url).await?;
        let response: CountResponse =
            serde_json::from_value(value.clone()).map_err(|_| SourceError::MissingCount {
                response: truncated(&value),
            })?;
        if let Some(err) = response.error {
            return Err(err.into());
        }
        response.count.ok_or_else(|| SourceError::MissingCount {
            response: truncated(&value),
        })
    }

    /// Fetches every feature of the layer as normalized records.
    ///
    /// A zero count is a legitimate empty result. An empty page ends the walk
    /// early even when the count promised more.
    pub async fn fetch_all(&self, base_url: &str) -> Result<Vec<Record>, SourceError> {
        let count = self.record_count(base_url).await?;
        if count == 0 {
            warn!(layer = base_url, "source reported 0 records");
            return Ok(Vec::new());
        }
        info!(count, "total records in source");

        let total_pages = page_total(count, self.options.page_size);
        let mut records = Vec::new();

        for (page, offset) in (1u64..).zip(page_offsets(count, self.options.page_size)) {
            if page > 1 {
                politeness_pause(self.options.page_delay).await;
            }

            let url = page_url(base_url, &self.options, offset);
            let response: QueryResponse = self.http.get_json(&url).await?;
            if let Some(err) = response.error {
                return Err(err.into());
            }
            if response.features.is_empty() {
                info!(page, offset, "empty page, stopping pagination");
                break;
            }

            records.extend(
                response
                    .features
                    .into_iter()
                    .filter_map(|f| feature_to_record(f, self.options.include_geometry)),
            );

            if page == 1 || page % 10 == 0 || page == total_pages {
                info!(page, total_pages, fetched = records.len(), "page fetched");
            }
        }

        info!(fetched = records.len(), "fetch complete");
        Ok(records)
    }
}

fn truncated(value: &Value) -> String {
    sodp_http::body_excerpt(&value.to_string())
}

/// One FeatureServer layer bound to its fetcher.
#[derive(Debug, Clone)]
pub struct ArcGisLayer {
    pub url: String,
    pub fetcher: ArcGisFetcher,
}

#[async_trait]
impl RecordSource for ArcGisLayer {
    fn describe(&self) -> String {
        format!("arcgis layer {}", self.url)
    }

    async fn fetch(&self) -> Result<Vec<Record>, SourceError> {
        let span = info_span!("arcgis_fetch", layer = %self.url);
        self.fetcher.fetch_all(&self.url).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use axum::{
        extract::{Query, State},
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::get,
        Json, Router,
    };
    use serde_json::json;
    use sodp_http::{BackoffPolicy, FetchError, HttpClientConfig};

    #[derive(Clone, Default)]
    struct FakeLayer {
        count: u64,
        served: u64,
        fail_status: Option<u16>,
        service_error: bool,
        offsets: Arc<Mutex<Vec<u64>>>,
        hits: Arc<AtomicUsize>,
    }

    async fn query(
        State(layer): State<FakeLayer>,
        Query(params): Query<HashMap<String, String>>,
    ) -> Response {
        layer.hits.fetch_add(1, Ordering::SeqCst);
        if let Some(code) = layer.fail_status {
            return (StatusCode::from_u16(code).unwrap(), "boom").into_response();
        }
        if params.get("returnCountOnly").map(String::as_str) == Some("true") {
            return Json(json!({ "count": layer.count })).into_response();
        }
        if layer.service_error {
            return Json(json!({"error": {"code": 400, "message": "Invalid query parameters"}}))
                .into_response();
        }

        let offset: u64 = params["resultOffset"].parse().unwrap();
        let limit: u64 = params["resultRecordCount"].parse().unwrap();
        let with_geometry = params["returnGeometry"] == "true";
        layer.offsets.lock().unwrap().push(offset);

        let end = (offset + limit).min(layer.served);
        let features: Vec<Value> = (offset..end)
            .map(|i| {
                let mut feature = json!({
                    "attributes": {"OBJECTID": i, "Nom Commune": format!("  Commune   {i} ")}
                });
                if with_geometry && i % 2 == 0 {
                    feature["geometry"] = json!({"x": 6.14, "y": 46.2});
                }
                feature
            })
            .collect();
        Json(json!({ "features": features })).into_response()
    }

    async fn serve(layer: FakeLayer) -> String {
        let router = Router::new()
            .route("/layer/FeatureServer/0/query", get(query))
            .with_state(layer);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}/layer/FeatureServer/0")
    }

    fn fetcher(include_geometry: bool) -> ArcGisFetcher {
        let http = HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: None,
            backoff: BackoffPolicy {
                max_attempts: 5,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(10),
            },
        })
        .unwrap();
        ArcGisFetcher::new(
            http,
            ArcGisOptions {
                include_geometry,
                page_delay: Duration::ZERO,
                ..ArcGisOptions::default()
            },
        )
    }

    #[test]
    fn offsets_cover_count_in_page_windows() {
        assert_eq!(page_offsets(4500, 2000).collect::<Vec<_>>(), vec![0, 2000, 4000]);
        assert_eq!(page_offsets(4000, 2000).collect::<Vec<_>>(), vec![0, 2000]);
        assert_eq!(page_offsets(0, 2000).next(), None);
        assert_eq!(page_total(4500, 2000), 3);
        assert_eq!(page_total(u64::MAX, 2000), u64::MAX / 2000 + 1);
    }

    #[test]
    fn page_url_carries_query_shape() {
        let url = page_url("https://x.test/FeatureServer/0/", &ArcGisOptions::default(), 4000);
        assert_eq!(
            url,
            "https://x.test/FeatureServer/0/query?where=1%3D1&outFields=*&returnGeometry=true&outSR=4326&resultOffset=4000&resultRecordCount=2000&f=json"
        );
    }

    #[tokio::test]
    async fn fetches_every_page_in_order() {
        let layer = FakeLayer {
            count: 4500,
            served: 4500,
            ..FakeLayer::default()
        };
        let offsets = layer.offsets.clone();
        let url = serve(layer).await;

        let records = fetcher(true).fetch_all(&url).await.unwrap();

        assert_eq!(*offsets.lock().unwrap(), vec![0, 2000, 4000]);
        assert_eq!(records.len(), 4500);
        assert_eq!(records[0]["objectid"], json!("0"));
        assert_eq!(records[4499]["objectid"], json!("4499"));
        assert_eq!(records[3]["nom_commune"], json!("Commune 3"));
        assert!(records[0][GEOMETRY_FIELD].as_str().unwrap().contains("46.2"));
        assert!(!records[1].contains_key(GEOMETRY_FIELD));
    }

    #[tokio::test]
    async fn empty_page_stops_pagination_early() {
        let layer = FakeLayer {
            count: 4500,
            served: 2000,
            ..FakeLayer::default()
        };
        let offsets = layer.offsets.clone();
        let url = serve(layer).await;

        let records = fetcher(true).fetch_all(&url).await.unwrap();

        assert_eq!(records.len(), 2000);
        assert_eq!(*offsets.lock().unwrap(), vec![0, 2000]);
    }

    #[tokio::test]
    async fn inflated_count_does_not_size_allocations() {
        let layer = FakeLayer {
            count: 1_000_000_000_000_000,
            served: 3,
            ..FakeLayer::default()
        };
        let offsets = layer.offsets.clone();
        let url = serve(layer).await;

        let records = fetcher(true).fetch_all(&url).await.unwrap();

        assert_eq!(records.len(), 3);
        assert_eq!(*offsets.lock().unwrap(), vec![0, 2000]);
    }

    #[tokio::test]
    async fn zero_count_is_an_empty_result() {
        let layer = FakeLayer::default();
        let hits = layer.hits.clone();
        let url = serve(layer).await;

        let records = fetcher(true).fetch_all(&url).await.unwrap();

        assert!(records.is_empty());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn geometry_is_omitted_when_not_requested() {
        let layer = FakeLayer {
            count: 10,
            served: 10,
            ..FakeLayer::default()
        };
        let url = serve(layer).await;

        let records = fetcher(false).fetch_all(&url).await.unwrap();

        assert_eq!(records.len(), 10);
        assert!(records.iter().all(|r| !r.contains_key(GEOMETRY_FIELD)));
    }

    #[tokio::test]
    async fn service_error_aborts_without_retry() {
        let layer = FakeLayer {
            count: 10,
            served: 10,
            service_error: true,
            ..FakeLayer::default()
        };
        let hits = layer.hits.clone();
        let url = serve(layer).await;

        let err = fetcher(true).fetch_all(&url).await.unwrap_err();

        assert!(matches!(err, SourceError::Service { code: Some(400), .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn persistent_server_errors_exhaust_attempts() {
        let layer = FakeLayer {
            fail_status: Some(500),
            ..FakeLayer::default()
        };
        let hits = layer.hits.clone();
        let url = serve(layer).await;

        let err = fetcher(true).fetch_all(&url).await.unwrap_err();

        assert!(matches!(
            err,
            SourceError::Fetch(FetchError::Exhausted { attempts: 5, .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn bad_request_is_not_retried() {
        let layer = FakeLayer {
            fail_status: Some(400),
            ..FakeLayer::default()
        };
        let hits = layer.hits.clone();
        let url = serve(layer).await;

        let err = fetcher(true).fetch_all(&url).await.unwrap_err();

        assert!(matches!(
            err,
            SourceError::Fetch(FetchError::HttpStatus { status: 400, .. })
        ));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn features_without_attributes_are_skipped() {
        let feature: Feature = serde_json::from_value(json!({"attributes": {}})).unwrap();
        assert!(feature_to_record(feature, true).is_none());

        let feature: Feature =
            serde_json::from_value(json!({"attributes": {"A": 1}, "geometry": {}})).unwrap();
        let record = feature_to_record(feature, true).unwrap();
        assert!(!record.contains_key(GEOMETRY_FIELD));
    }
}
