//! Core record model and normalization rules shared by every SODP job.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde_json::{Map, Value};

pub const CRATE_NAME: &str = "sodp-core";

/// Key under which serialized source geometry is attached to a record.
pub const GEOMETRY_FIELD: &str = "geometry";

/// One normalized row: field name -> null, scalar, or serialized geometry.
///
/// Insertion order is preserved so records serialize in the order the source
/// delivered their attributes.
pub type Record = Map<String, Value>;

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Canonical snake-case form of a source field label.
///
/// Every run of characters that is not an ASCII word character (whitespace,
/// punctuation, accented letters) becomes a single `_`, then the result is
/// lower-cased: `"N° Bâtiment"` -> `"n_b_timent"`.
pub fn normalize_key(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut in_gap = false;
    for c in key.chars() {
        if is_word_char(c) {
            out.push(c.to_ascii_lowercase());
            in_gap = false;
        } else if !in_gap {
            out.push('_');
            in_gap = true;
        }
    }
    out
}

/// Collapses internal whitespace runs to one space and trims.
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Stringifies a raw attribute value; blank results become `null`.
pub fn normalize_value(value: &Value) -> Value {
    let text = match value {
        Value::Null => return Value::Null,
        Value::String(s) => collapse_whitespace(s),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => collapse_whitespace(&value.to_string()),
    };
    if text.is_empty() {
        Value::Null
    } else {
        Value::String(text)
    }
}

/// Same as [`normalize_value`] for text cells (CSV).
pub fn normalize_text(text: &str) -> Value {
    let collapsed = collapse_whitespace(text);
    if collapsed.is_empty() {
        Value::Null
    } else {
        Value::String(collapsed)
    }
}

/// Builds a record from raw source attributes, normalizing keys and values.
pub fn record_from_attributes(attributes: &Map<String, Value>) -> Record {
    attributes
        .iter()
        .map(|(k, v)| (normalize_key(k), normalize_value(v)))
        .collect()
}

/// Index of the first record whose key set differs from the first record's.
pub fn first_key_set_mismatch(records: &[Record]) -> Option<usize> {
    let first = records.first()?;
    let expected: HashSet<&str> = first.keys().map(String::as_str).collect();
    records.iter().enumerate().skip(1).find_map(|(idx, record)| {
        let same = record.len() == expected.len()
            && record.keys().all(|k| expected.contains(k.as_str()));
        (!same).then_some(idx)
    })
}

/// Gives every record the union of all keys, filling absent ones with null.
pub fn unify_key_sets(records: &mut [Record]) {
    let mut seen = HashSet::new();
    let mut all_keys = Vec::new();
    for record in records.iter() {
        for key in record.keys() {
            if seen.insert(key.clone()) {
                all_keys.push(key.clone());
            }
        }
    }
    for record in records.iter_mut() {
        for key in &all_keys {
            if !record.contains_key(key) {
                record.insert(key.clone(), Value::Null);
            }
        }
    }
}

/// Renames fields in place; a rename onto an existing key overwrites it.
pub fn apply_field_renames(records: &mut [Record], renames: &BTreeMap<String, String>) {
    if renames.is_empty() {
        return;
    }
    for record in records.iter_mut() {
        for (old_name, new_name) in renames {
            if let Some(value) = record.remove(old_name) {
                record.insert(new_name.clone(), value);
            }
        }
    }
}

/// Removes the named field from every record, returning how many carried it.
pub fn strip_field(records: &mut [Record], field: &str) -> usize {
    let mut removed = 0;
    for record in records.iter_mut() {
        if record.remove(field).is_some() {
            removed += 1;
        }
    }
    removed
}

/// Keeps only keys in `allowed`; returns the distinct dropped keys, sorted.
pub fn retain_columns(records: &mut [Record], allowed: &BTreeSet<String>) -> Vec<String> {
    let mut dropped = BTreeSet::new();
    for record in records.iter_mut() {
        record.retain(|key, _| {
            let keep = allowed.contains(key);
            if !keep {
                dropped.insert(key.clone());
            }
            keep
        });
    }
    dropped.into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn key_normalization_collapses_non_word_runs() {
        assert_eq!(normalize_key("N° Bâtiment"), "n_b_timent");
        assert_eq!(normalize_key("OBJECTID"), "objectid");
        assert_eq!(normalize_key("Date   de dépôt"), "date_de_d_p_t");
        assert_eq!(normalize_key("already_snake"), "already_snake");
        assert_eq!(normalize_key("Surface (m2)"), "surface_m2_");
    }

    #[test]
    fn value_normalization_collapses_and_trims() {
        assert_eq!(
            normalize_value(&json!("  Société   Générale ")),
            json!("Société Générale")
        );
        assert_eq!(normalize_value(&json!("line\n\tbreak")), json!("line break"));
        assert_eq!(normalize_value(&json!("")), Value::Null);
        assert_eq!(normalize_value(&json!("   ")), Value::Null);
        assert_eq!(normalize_value(&Value::Null), Value::Null);
    }

    #[test]
    fn scalar_values_are_stringified() {
        assert_eq!(normalize_value(&json!(42)), json!("42"));
        assert_eq!(normalize_value(&json!(0)), json!("0"));
        assert_eq!(normalize_value(&json!(1.5)), json!("1.5"));
        assert_eq!(normalize_value(&json!(true)), json!("true"));
    }

    #[test]
    fn attributes_become_normalized_record_in_source_order() {
        let attrs = record(json!({"OBJECTID": 7, "Nom Commune": " Genève ", "Remarque": ""}));
        let rec = record_from_attributes(&attrs);
        let keys: Vec<_> = rec.keys().cloned().collect();
        assert_eq!(keys, vec!["objectid", "nom_commune", "remarque"]);
        assert_eq!(rec["objectid"], json!("7"));
        assert_eq!(rec["nom_commune"], json!("Genève"));
        assert_eq!(rec["remarque"], Value::Null);
    }

    #[test]
    fn heterogeneous_key_sets_are_detected_and_unified() {
        let mut records = vec![record(json!({"a": 1})), record(json!({"b": 2}))];
        assert_eq!(first_key_set_mismatch(&records), Some(1));

        unify_key_sets(&mut records);
        assert_eq!(first_key_set_mismatch(&records), None);
        assert_eq!(records[0], record(json!({"a": 1, "b": null})));
        assert_eq!(records[1], record(json!({"b": 2, "a": null})));
    }

    #[test]
    fn uniform_records_pass_key_set_check() {
        let records = vec![
            record(json!({"a": 1, "b": 2})),
            record(json!({"b": 3, "a": 4})),
        ];
        assert_eq!(first_key_set_mismatch(&records), None);
        assert_eq!(first_key_set_mismatch(&[]), None);
    }

    #[test]
    fn renames_retention_and_stripping() {
        let mut records = vec![
            record(json!({"no_dossier": "A1", "iteration": 3, "geometry": "{}"})),
            record(json!({"no_dossier": "A2", "iteration": 3})),
        ];
        let renames = BTreeMap::from([("no_dossier".to_string(), "dossier".to_string())]);
        apply_field_renames(&mut records, &renames);
        assert_eq!(records[0]["dossier"], json!("A1"));
        assert!(!records[1].contains_key("no_dossier"));

        assert_eq!(strip_field(&mut records, GEOMETRY_FIELD), 1);

        let allowed = BTreeSet::from(["dossier".to_string()]);
        let dropped = retain_columns(&mut records, &allowed);
        assert_eq!(dropped, vec!["iteration".to_string()]);
        assert_eq!(records[1], record(json!({"dossier": "A2"})));
    }
}
