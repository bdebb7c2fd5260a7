//! Swiss company registry (Zefix) row shaping.

use serde_json::{json, Value};
use sodp_core::Record;

use crate::csv_source::CsvRow;

pub const STATUS_ACTIVE: &str = "ACTIVE";
pub const SOURCE_TAG: &str = "csv_import";

/// Formats a raw UID as `CHE-XXX.XXX.XXX` plus its numeric form.
///
/// Needs at least nine digits; anything shorter is passed through unformatted.
pub fn format_uid(raw: &str) -> (Option<String>, Option<u64>) {
    if raw.is_empty() {
        return (None, None);
    }
    let digits: String = raw.chars().filter(char::is_ascii_digit).take(9).collect();
    if digits.len() < 9 {
        return (Some(raw.to_string()), None);
    }
    let formatted = format!("CHE-{}.{}.{}", &digits[..3], &digits[3..6], &digits[6..9]);
    (Some(formatted), digits.parse().ok())
}

fn first_present<'a>(row: &CsvRow<'a>, headers: &[&str]) -> &'a str {
    headers
        .iter()
        .map(|h| row.get(h))
        .find(|v| !v.is_empty())
        .unwrap_or("")
        .trim()
}

/// Maps one registry row onto the companies table; rows without a name are dropped.
pub fn company_record(row: &CsvRow<'_>, canton: Option<&str>) -> Option<Record> {
    let name = row.get("company_legal_name").trim();
    if name.is_empty() {
        return None;
    }
    let (uid, uid_raw) = format_uid(row.get("company_uid").trim());

    let record = json!({
        "uid": uid,
        "uid_raw": uid_raw,
        "name": name,
        "legal_form": first_present(row, &["company_type_fr", "company_type_de"]),
        "status": STATUS_ACTIVE,
        "city": first_present(row, &["locality", "municipality"]),
        "canton": canton,
        "source": SOURCE_TAG,
    });
    match record {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
