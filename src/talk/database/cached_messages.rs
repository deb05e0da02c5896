use chrono::{DateTime, Utc};

use super::{
    Database, DatabaseError,
    utils::{create_column_decode_error, parse_json_column, parse_timestamp},
};
use crate::talk::messages::{Message, MessageKind, Reactions, SenderProfile};

type Result<T> = std::result::Result<T, DatabaseError>;

#[derive(Debug)]
struct CachedMessageRow {
    id: String,
    conversation_id: String,
    sender_id: Option<String>,
    kind: MessageKind,
    content: String,
    attachment: Option<String>,
    reactions: Reactions,
    favs: Vec<String>,
    reply_to: Option<String>,
    forwarded_from: Option<String>,
    sender_profile: Option<SenderProfile>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r, R> sqlx::FromRow<'r, R> for CachedMessageRow
where
    R: sqlx::Row,
    &'r str: sqlx::ColumnIndex<R>,
    String: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    Option<String>: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
    i64: sqlx::Decode<'r, R::Database> + sqlx::Type<R::Database>,
{
    fn from_row(row: &'r R) -> std::result::Result<Self, sqlx::Error> {
        let kind_str: String = row.try_get("kind")?;
        let kind = kind_str
            .parse::<MessageKind>()
            .map_err(|e| create_column_decode_error("kind", &e.to_string()))?;

        let sender_profile = match row.try_get::<Option<String>, _>("sender_profile")? {
            Some(json) => Some(serde_json::from_str(&json).map_err(|e| {
                sqlx::Error::ColumnDecode {
                    index: "sender_profile".to_string(),
                    source: Box::new(e),
                }
            })?),
            None => None,
        };

        Ok(Self {
            id: row.try_get("id")?,
            conversation_id: row.try_get("conversation_id")?,
            sender_id: row.try_get("sender_id")?,
            kind,
            content: row.try_get("content")?,
            attachment: row.try_get("attachment")?,
            reactions: parse_json_column(row, "reactions")?,
            favs: parse_json_column(row, "favs")?,
            reply_to: row.try_get("reply_to")?,
            forwarded_from: row.try_get("forwarded_from")?,
            sender_profile,
            created_at: parse_timestamp(row, "created_at")?,
            updated_at: parse_timestamp(row, "updated_at")?,
        })
    }
}

impl From<CachedMessageRow> for Message {
    fn from(row: CachedMessageRow) -> Self {
        Message {
            id: row.id,
            conversation_id: row.conversation_id,
            sender_id: row.sender_id,
            kind: row.kind,
            content: row.content,
            attachment: row.attachment,
            reactions: row.reactions,
            favs: row.favs,
            reply_to: row.reply_to,
            forwarded_from: row.forwarded_from,
            sender_profile: row.sender_profile,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

const UPSERT_SQL: &str = "INSERT INTO cached_messages
     (id, conversation_id, sender_id, kind, content, attachment, reactions, favs,
      reply_to, forwarded_from, sender_profile, created_at, updated_at)
     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
     ON CONFLICT(id) DO UPDATE SET
       conversation_id = excluded.conversation_id,
       sender_id = excluded.sender_id,
       kind = excluded.kind,
       content = excluded.content,
       attachment = excluded.attachment,
       reactions = excluded.reactions,
       favs = excluded.favs,
       reply_to = excluded.reply_to,
       forwarded_from = excluded.forwarded_from,
       sender_profile = excluded.sender_profile,
       created_at = excluded.created_at,
       updated_at = excluded.updated_at";

/// Durable per-conversation copy of authoritative messages.
///
/// Never a source of truth: a full-page fetch replaces a conversation's rows wholesale.
pub struct CachedMessage;

impl CachedMessage {
    /// All cached messages of a conversation, oldest first.
    pub async fn find_by_conversation(
        conversation_id: &str,
        database: &Database,
    ) -> Result<Vec<Message>> {
        let rows: Vec<CachedMessageRow> = sqlx::query_as(
            "SELECT * FROM cached_messages
             WHERE conversation_id = ?
             ORDER BY created_at, id",
        )
        .bind(conversation_id)
        .fetch_all(&database.pool)
        .await?;

        Ok(rows.into_iter().map(Message::from).collect())
    }

    pub async fn find_by_id(message_id: &str, database: &Database) -> Result<Option<Message>> {
        let row: Option<CachedMessageRow> =
            sqlx::query_as("SELECT * FROM cached_messages WHERE id = ?")
                .bind(message_id)
                .fetch_optional(&database.pool)
                .await?;

        Ok(row.map(Message::from))
    }

    pub async fn count_by_conversation(conversation_id: &str, database: &Database) -> Result<usize> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cached_messages WHERE conversation_id = ?")
                .bind(conversation_id)
                .fetch_one(&database.pool)
                .await?;

        Ok(count as usize)
    }

    /// Clears the conversation and writes `messages` in ONE transaction.
    ///
    /// Either the old rows are all gone and the new ones all present, or nothing changed.
    pub async fn replace_for_conversation(
        conversation_id: &str,
        messages: &[Message],
        database: &Database,
    ) -> Result<()> {
        let mut tx = database.pool.begin().await?;

        sqlx::query("DELETE FROM cached_messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&mut *tx)
            .await?;

        for message in messages {
            Self::bind_upsert(message)?.execute(&mut *tx).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Inserts or refreshes a single message.
    pub async fn upsert(message: &Message, database: &Database) -> Result<()> {
        Self::bind_upsert(message)?
            .execute(&database.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_by_id(message_id: &str, database: &Database) -> Result<bool> {
        let result = sqlx::query("DELETE FROM cached_messages WHERE id = ?")
            .bind(message_id)
            .execute(&database.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete_by_conversation(conversation_id: &str, database: &Database) -> Result<()> {
        sqlx::query("DELETE FROM cached_messages WHERE conversation_id = ?")
            .bind(conversation_id)
            .execute(&database.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_all(database: &Database) -> Result<()> {
        sqlx::query("DELETE FROM cached_messages")
            .execute(&database.pool)
            .await?;
        Ok(())
    }

    fn bind_upsert(
        message: &Message,
    ) -> Result<sqlx::query::Query<'static, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'static>>>
    {
        let sender_profile = message
            .sender_profile
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        Ok(sqlx::query(UPSERT_SQL)
            .bind(message.id.clone())
            .bind(message.conversation_id.clone())
            .bind(message.sender_id.clone())
            .bind(message.kind.as_str())
            .bind(message.content.clone())
            .bind(message.attachment.clone())
            .bind(serde_json::to_string(&message.reactions)?)
            .bind(serde_json::to_string(&message.favs)?)
            .bind(message.reply_to.clone())
            .bind(message.forwarded_from.clone())
            .bind(sender_profile)
            .bind(message.created_at.timestamp_millis())
            .bind(message.updated_at.timestamp_millis()))
    }
}
