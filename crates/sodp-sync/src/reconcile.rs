//! Reshapes records to fit a destination table before they are upserted.

use std::collections::BTreeSet;

use serde::Serialize;
use sodp_core::{apply_field_renames, retain_columns, strip_field, unify_key_sets, Record, GEOMETRY_FIELD};
use sodp_destination::Destination;
use tracing::{info, warn};

use crate::config::DatasetConfig;

/// What the destination table looks like right now.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSchema {
    /// Column set sampled from a live row; `None` when the table is empty.
    pub columns: Option<BTreeSet<String>>,
    pub geometry_column: bool,
}

impl LiveSchema {
    pub async fn discover(destination: &dyn Destination, table: &str) -> Self {
        let columns = destination.table_columns(table).await;
        let geometry_column = match &columns {
            Some(cols) => cols.contains(GEOMETRY_FIELD),
            None => destination.has_column(table, GEOMETRY_FIELD).await,
        };
        Self {
            columns,
            geometry_column,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Reconciliation {
    pub dropped_columns: Vec<String>,
    pub geometry_stripped: usize,
}

/// Renames, excludes, filters to known columns, strips geometry the table
/// cannot hold, then fills missing keys with null.
pub fn reconcile(
    mut records: Vec<Record>,
    dataset: &DatasetConfig,
    schema: &LiveSchema,
) -> (Vec<Record>, Reconciliation) {
    let mut outcome = Reconciliation::default();

    apply_field_renames(&mut records, &dataset.field_renames);
    for field in &dataset.exclude_fields {
        strip_field(&mut records, field);
    }

    if !schema.geometry_column {
        outcome.geometry_stripped = strip_field(&mut records, GEOMETRY_FIELD);
        if outcome.geometry_stripped > 0 {
            info!(table = %dataset.table, records = outcome.geometry_stripped, "table has no geometry column, stripped geometry");
        }
    }

    if let Some(columns) = &schema.columns {
        outcome.dropped_columns = retain_columns(&mut records, columns);
        if !outcome.dropped_columns.is_empty() {
            warn!(
                table = %dataset.table,
                dropped = ?outcome.dropped_columns,
                "dropping fields missing from destination table"
            );
        }
    }

    unify_key_sets(&mut records);
    (records, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Value};
    use sodp_core::first_key_set_mismatch;
    use sodp_sources::SourceSpec;

    fn dataset() -> DatasetConfig {
        DatasetConfig {
            name: "dossiers".into(),
            table: "SIT_AUTOR_DOSSIER".into(),
            source: SourceSpec::Arcgis {
                url: "https://example.test/FeatureServer/0".into(),
                include_geometry: true,
                out_sr: 4326,
                page_size: 2000,
            },
            conflict_key: "objectid".into(),
            batch_size: 500,
            partitions: Vec::new(),
            field_renames: [("numero".to_string(), "dossier_number".to_string())].into(),
            exclude_fields: vec!["iteration".into()],
        }
    }

    fn records() -> Vec<Record> {
        vec![
            json!({"objectid": "1", "numero": "DD 1", "iteration": "3", "geometry": "{}"}),
            json!({"objectid": "2", "numero": "DD 2", "commune": "Genève"}),
        ]
        .into_iter()
        .map(|v| v.as_object().cloned().unwrap())
        .collect()
    }

    #[test]
    fn unknown_columns_and_geometry_are_dropped() {
        let schema = LiveSchema {
            columns: Some(["objectid", "dossier_number"].map(String::from).into()),
            geometry_column: false,
        };
        let (out, outcome) = reconcile(records(), &dataset(), &schema);

        assert_eq!(outcome.geometry_stripped, 1);
        assert_eq!(outcome.dropped_columns, vec!["commune"]);
        for record in &out {
            let keys: BTreeSet<_> = record.keys().map(String::as_str).collect();
            assert_eq!(keys, BTreeSet::from(["objectid", "dossier_number"]));
        }
    }

    #[test]
    fn empty_table_keeps_every_field_and_unifies_keys() {
        let schema = LiveSchema {
            columns: None,
            geometry_column: true,
        };
        let (out, outcome) = reconcile(records(), &dataset(), &schema);

        assert_eq!(outcome, Reconciliation::default());
        assert_eq!(first_key_set_mismatch(&out), None);
        assert_eq!(out[1]["geometry"], Value::Null);
        assert_eq!(out[0]["commune"], Value::Null);
        assert!(!out[0].contains_key("iteration"));
        assert_eq!(out[0]["dossier_number"], json!("DD 1"));
    }

    #[test]
    fn renames_reach_double_underscore_legacy_columns() {
        let mut dataset = dataset();
        dataset
            .field_renames
            .insert(sodp_core::normalize_key("Surface (m2)"), "surface__m2_".into());
        let schema = LiveSchema {
            columns: Some(["objectid", "surface__m2_"].map(String::from).into()),
            geometry_column: true,
        };
        let record = json!({"objectid": "1", "surface_m2_": 120}).as_object().cloned().unwrap();

        let (out, outcome) = reconcile(vec![record], &dataset, &schema);
        assert!(outcome.dropped_columns.is_empty());
        assert_eq!(out[0]["surface__m2_"], json!(120));
    }
}
