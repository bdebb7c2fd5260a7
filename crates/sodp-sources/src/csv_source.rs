//! CSV-over-HTTP sources.

use async_trait::async_trait;
use csv::{ReaderBuilder, StringRecord};
use serde_json::Value;
use sodp_core::{normalize_key, normalize_text, Record};
use sodp_http::HttpFetcher;
use tracing::{info, info_span, Instrument};

use crate::{zefix, CsvShape, RecordSource, SourceError};

#[derive(Debug, Clone)]
pub struct CsvSource {
    pub url: String,
    pub delimiter: char,
    pub shape: CsvShape,
    pub partition: Option<String>,
    pub http: HttpFetcher,
}

/// Header row plus one data row, looked up by header name.
pub struct CsvRow<'a> {
    headers: &'a StringRecord,
    row: &'a StringRecord,
}

impl<'a> CsvRow<'a> {
    /// Raw cell under `header`; missing columns read as empty.
    pub fn get(&self, header: &str) -> &'a str {
        self.headers
            .iter()
            .position(|h| h == header)
            .and_then(|idx| self.row.get(idx))
            .unwrap_or("")
    }
}

fn normalized_record(headers: &StringRecord, row: &StringRecord) -> Record {
    headers
        .iter()
        .enumerate()
        .map(|(idx, header)| {
            let value = row.get(idx).map(normalize_text).unwrap_or(Value::Null);
            (normalize_key(header), value)
        })
        .collect()
}

/// Parses CSV text into records according to `shape`.
///
/// A leading byte-order mark is ignored. Rows shorter than the header read
/// their missing cells as null (normalized) or empty (zefix).
pub fn parse_csv(
    text: &str,
    delimiter: char,
    shape: CsvShape,
    partition: Option<&str>,
) -> Result<Vec<Record>, SourceError> {
    let delimiter = u8::try_from(delimiter)
        .ok()
        .filter(u8::is_ascii)
        .ok_or(SourceError::Delimiter(delimiter))?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);
    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(text.as_bytes());
    let headers = reader.headers()?.clone();

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        match shape {
            CsvShape::Normalized => records.push(normalized_record(&headers, &row)),
            CsvShape::Zefix => {
                let view = CsvRow {
                    headers: &headers,
                    row: &row,
                };
                if let Some(record) = zefix::company_record(&view, partition) {
                    records.push(record);
                }
            }
        }
    }
    Ok(records)
}

#[async_trait]
impl RecordSource for CsvSource {
    fn describe(&self) -> String {
        format!("csv {}", self.url)
    }

    async fn fetch(&self) -> Result<Vec<Record>, SourceError> {
        let span = info_span!("csv_fetch", url = %self.url);
        async {
            let text = self.http.get_text(&self.url).await?;
            info!(bytes = text.len(), "download complete");
            let records = parse_csv(&text, self.delimiter, self.shape, self.partition.as_deref())?;
            info!(rows = records.len(), "csv parsed");
            Ok::<_, SourceError>(records)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn semicolon_csv_is_normalized() {
        let text = "\u{feff}EGRID;N° Parcelle;Commune\nCH123;  42 ;Genève\nCH124;;\n";
        let records = parse_csv(text, ';', CsvShape::Normalized, None).unwrap();

        assert_eq!(records.len(), 2);
        let keys: Vec<_> = records[0].keys().cloned().collect();
        assert_eq!(keys, vec!["egrid", "n_parcelle", "commune"]);
        assert_eq!(records[0]["n_parcelle"], json!("42"));
        assert_eq!(records[1]["commune"], Value::Null);
    }

    #[test]
    fn non_ascii_delimiter_is_an_error() {
        let err = parse_csv("a§b\n1§2\n", '§', CsvShape::Normalized, None).unwrap_err();
        assert!(matches!(err, SourceError::Delimiter('§')));
    }

    #[test]
    fn short_rows_fill_missing_cells_with_null() {
        let text = "a,b,c\n1,2\n";
        let records = parse_csv(text, ',', CsvShape::Normalized, None).unwrap();
        assert_eq!(records[0]["c"], Value::Null);
        assert_eq!(records[0].len(), 3);
    }

    #[test]
    fn zefix_shape_uses_partition_as_canton() {
        let text = "company_legal_name,company_uid,company_type_fr,company_type_de,locality,municipality\n\
                    Société Générale SA,CHE123456789,Société anonyme,Aktiengesellschaft,Genève,\n\
                    ,CHE999999999,,,,\n";
        let records = parse_csv(text, ',', CsvShape::Zefix, Some("GE")).unwrap();

        assert_eq!(records.len(), 1);
        assert_eq!(records[0]["uid"], json!("CHE-123.456.789"));
        assert_eq!(records[0]["canton"], json!("GE"));
        assert_eq!(records[0]["legal_form"], json!("Société anonyme"));
    }
}
