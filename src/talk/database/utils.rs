use chrono::{DateTime, Utc};
use sqlx::Row;

use crate::talk::utils::parse_record_datetime;

/// Parses a timestamp column stored either as INTEGER milliseconds or as TEXT.
///
/// SQLite's type affinity means rows written by older builds or by hand may hold
/// a datetime string; both shapes decode to the same `DateTime<Utc>`.
pub(crate) fn parse_timestamp<'r, R>(
    row: &'r R,
    column_name: &'r str,
) -> Result<DateTime<Utc>, sqlx::Error>
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    if let Ok(timestamp_ms) = row.try_get::<i64, _>(column_name) {
        return DateTime::from_timestamp_millis(timestamp_ms)
            .ok_or_else(|| create_column_decode_error(column_name, "Invalid timestamp value"));
    }

    if let Ok(datetime_str) = row.try_get::<String, _>(column_name) {
        return parse_record_datetime(&datetime_str).ok_or_else(|| {
            create_column_decode_error(
                column_name,
                &format!("Could not parse datetime string: '{}'", datetime_str),
            )
        });
    }

    Err(create_column_decode_error(
        column_name,
        "Could not parse as INTEGER or DATETIME",
    ))
}

/// Decodes a JSON TEXT column into `T`.
pub(crate) fn parse_json_column<'r, R, T>(row: &'r R, column_name: &'r str) -> Result<T, sqlx::Error>
where
    R: Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    T: serde::de::DeserializeOwned,
{
    let raw: String = row.try_get(column_name)?;
    serde_json::from_str(&raw).map_err(|e| sqlx::Error::ColumnDecode {
        index: column_name.to_string(),
        source: Box::new(e),
    })
}

/// Helper function to create consistent ColumnDecode errors.
pub(crate) fn create_column_decode_error(column_name: &str, message: &str) -> sqlx::Error {
    sqlx::Error::ColumnDecode {
        index: column_name.to_string(),
        source: Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            message.to_string(),
        )),
    }
}
