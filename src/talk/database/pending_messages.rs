use super::{
    Database, DatabaseError,
    utils::{create_column_decode_error, parse_timestamp},
};
use crate::talk::outbound_queue::{PendingMessage, PendingStatus};

type Result<T> = std::result::Result<T, DatabaseError>;

struct PendingMessageRow(PendingMessage);

impl<'r, R> sqlx::FromRow<'r, R> for PendingMessageRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let status_str: String = row.try_get("status")?;
        let status = status_str
            .parse::<PendingStatus>()
            .map_err(|e| create_column_decode_error("status", &e))?;
        let retries: i64 = row.try_get("retries")?;

        Ok(Self(PendingMessage {
            temp_id: row.try_get("temp_id")?,
            real_id: row.try_get::<Option<String>, _>("real_id")?,
            conversation_id: row.try_get("conversation_id")?,
            content: row.try_get("content")?,
            retries: retries.max(0) as u32,
            status,
            created_at: parse_timestamp(row, "created_at")?,
        }))
    }
}

impl PendingMessage {
    /// Loads the persisted queue in submission order.
    pub(crate) async fn load_all(database: &Database) -> Result<Vec<PendingMessage>> {
        let rows: Vec<PendingMessageRow> =
            sqlx::query_as("SELECT * FROM pending_messages ORDER BY position")
                .fetch_all(&database.pool)
                .await?;
        Ok(rows.into_iter().map(|row| row.0).collect())
    }

    /// Mirrors `queue` into the table in one transaction.
    pub(crate) async fn replace_all(queue: &[PendingMessage], database: &Database) -> Result<()> {
        let mut tx = database.pool.begin().await?;

        sqlx::query("DELETE FROM pending_messages")
            .execute(&mut *tx)
            .await?;

        for (position, pending) in queue.iter().enumerate() {
            sqlx::query(
                "INSERT INTO pending_messages
                 (temp_id, position, conversation_id, content, real_id, retries, status, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&pending.temp_id)
            .bind(position as i64)
            .bind(&pending.conversation_id)
            .bind(&pending.content)
            .bind(&pending.real_id)
            .bind(pending.retries as i64)
            .bind(pending.status.as_str())
            .bind(pending.created_at.timestamp_millis())
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}
