use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;
use sqlx::{QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::error::Error;
use crate::headers::{names, Headers};
use crate::journal::{
    decode_position, encode_position, JournalCategory, JournalEntry, JournalFilter,
    JournalReadResult, JournalStore,
};
use crate::message::Message;

/// Journal over the `PB_MessageJournal` table. Positions are zero-padded
/// row ids, so string comparison matches append order.
pub struct SqliteJournalStore {
    pool: SqlitePool,
}

#[derive(FromRow)]
struct JournalRow {
    id: i64,
    message_id: String,
    timestamp: DateTime<Utc>,
    category: String,
    topic: Option<String>,
    headers: String,
    content: Vec<u8>,
}

impl SqliteJournalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    fn materialize(row: JournalRow) -> Result<JournalEntry, Error> {
        let category = JournalCategory::parse(&row.category)
            .ok_or_else(|| Error::internal(eyre::eyre!("unknown journal category {}", row.category)))?;
        let headers: Headers = serde_json::from_str(&row.headers)?;
        let id = Uuid::parse_str(&row.message_id).map_err(Error::internal)?;

        Ok(JournalEntry {
            position: encode_position(row.id),
            timestamp: row.timestamp,
            category,
            topic: row.topic,
            message: Message {
                id,
                headers,
                content: row.content,
            },
        })
    }
}

#[async_trait::async_trait]
impl JournalStore for SqliteJournalStore {
    async fn append(
        &self,
        category: JournalCategory,
        topic: Option<&str>,
        message: &Message,
    ) -> Result<String, Error> {
        let headers_json = serde_json::to_string(&message.headers)?;

        let id: i64 = sqlx::query_scalar(
            "
            INSERT INTO PB_MessageJournal (
                MessageId, Timestamp, Category, TopicName, MessageName,
                Origination, Destination, ReplyTo, RelatedTo, ContentType,
                Headers, MessageContent
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            RETURNING Id
            ",
        )
        .bind(message.id.to_string())
        .bind(Utc::now())
        .bind(category.as_str())
        .bind(topic)
        .bind(message.headers.message_name())
        .bind(message.headers.get(names::ORIGINATION))
        .bind(message.headers.get(names::DESTINATION))
        .bind(message.headers.get(names::REPLY_TO))
        .bind(message.headers.get(names::RELATED_TO))
        .bind(message.headers.content_type())
        .bind(headers_json)
        .bind(&message.content)
        .fetch_one(&mut *self.pool.acquire().await?)
        .await?;

        Ok(encode_position(id))
    }

    async fn read(
        &self,
        after: Option<&str>,
        filter: &JournalFilter,
        limit: usize,
    ) -> Result<JournalReadResult, Error> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
            "
            SELECT
                Id as id,
                MessageId as message_id,
                Timestamp as timestamp,
                Category as category,
                TopicName as topic,
                Headers as headers,
                MessageContent as content
            FROM PB_MessageJournal
            WHERE 1 = 1
            ",
        );

        if let Some(after) = after {
            query.push(" AND Id > ").push_bind(decode_position(after)?);
        }
        if !filter.categories.is_empty() {
            query.push(" AND Category IN (");
            let mut categories = query.separated(", ");
            for category in &filter.categories {
                categories.push_bind(category.as_str());
            }
            query.push(")");
        }
        if let Some(topic) = &filter.topic {
            query.push(" AND TopicName = ").push_bind(topic);
        }
        if let Some(from) = filter.from {
            query.push(" AND Timestamp >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            query.push(" AND Timestamp <= ").push_bind(to);
        }
        query
            .push(" ORDER BY Id ASC LIMIT ")
            .push_bind(limit as i64);

        let rows: Vec<JournalRow> = query
            .build_query_as()
            .fetch_all(&mut *self.pool.acquire().await?)
            .await?;

        let entries = rows
            .into_iter()
            .map(Self::materialize)
            .collect::<Result<Vec<_>, _>>()?;

        let next_position = entries
            .last()
            .map(|entry| entry.position.clone())
            .or_else(|| after.map(str::to_owned));

        Ok(JournalReadResult {
            entries,
            next_position,
        })
    }
}
