use chrono::{DateTime, NaiveDateTime, Utc};

/// Format the record store uses for datetimes, e.g. `2025-08-16 11:34:29.123Z`.
const RECORD_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3fZ";

/// Generates a client-local temporary id for queued messages and upload tasks.
pub(crate) fn generate_temp_id() -> String {
    format!("temp_{}", uuid::Uuid::new_v4().simple())
}

/// Formats a datetime the way the record store stores and filters it.
pub(crate) fn format_record_datetime(datetime: &DateTime<Utc>) -> String {
    datetime.format(RECORD_DATETIME_FORMAT).to_string()
}

/// Parses a record-store datetime, accepting RFC 3339 as well.
///
/// Empty strings yield `None`: the store sends `""` for unset datetime fields.
pub(crate) fn parse_record_datetime(value: &str) -> Option<DateTime<Utc>> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }

    let naive = value.strip_suffix('Z').unwrap_or(value);
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(naive, format).ok())
        .map(|naive_dt| DateTime::<Utc>::from_naive_utc_and_offset(naive_dt, Utc))
}
