use std::collections::HashSet;
use std::time::{SystemTime, UNIX_EPOCH};

use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use uuid::Uuid;

pub fn uuid_v7_without_dashes() -> String {
    Uuid::now_v7().simple().to_string()
}

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

pub fn format_ms_rfc3339(epoch_ms: i64) -> String {
    let fallback = OffsetDateTime::from_unix_timestamp(0).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    let value =
        OffsetDateTime::from_unix_timestamp_nanos(epoch_ms as i128 * 1_000_000).unwrap_or(fallback);
    value
        .format(&Rfc3339)
        .unwrap_or("1970-01-01T00:00:00Z".to_string())
}

/// Trims, drops empties and keeps first occurrences.
pub fn dedupe_and_trim(values: &[String]) -> Vec<String> {
    let mut deduped = Vec::with_capacity(values.len());
    let mut seen = HashSet::new();
    for raw in values {
        let value = raw.trim().to_string();
        if value.is_empty() {
            continue;
        }
        if seen.insert(value.clone()) {
            deduped.push(value);
        }
    }
    deduped
}

pub fn lowercase_index<'a>(names: impl IntoIterator<Item = &'a str>) -> Vec<String> {
    let lowered: Vec<String> = names
        .into_iter()
        .map(|name| name.trim().to_lowercase())
        .collect();
    dedupe_and_trim(&lowered)
}
