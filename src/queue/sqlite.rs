//! Embedded file-backed queue store.
//!
//! All queues of one deployment share a single SQLite database file; each
//! store value scopes its reads and writes to one `QueueName`. The schema
//! lives in `migrations/` and is applied idempotently at connect time.
//!
//! Every operation races its work against the caller's cancellation token
//! and yields [`Error::Cancelled`] once it fires.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::prelude::FromRow;
use sqlx::SqlitePool;
use tokio_stream::StreamExt as _;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;
use crate::headers::Headers;
use crate::message::Message;
use crate::principal::{Principal, SecurityTokenService};
use crate::queue::store::QueueStore;
use crate::queue::QueuedMessage;

pub struct SqliteQueueStore {
    pool: SqlitePool,
    queue: String,
    tokens: Arc<dyn SecurityTokenService>,
}

#[derive(FromRow)]
struct QueuedMessageRow {
    id: i64,
    message_id: String,
    headers: String,
    content: Vec<u8>,
    sender_principal: Option<String>,
    attempts: i64,
    acknowledged: Option<DateTime<Utc>>,
    abandoned: Option<DateTime<Utc>>,
}

const SELECT_COLUMNS: &str = "
    Id as id,
    MessageId as message_id,
    Headers as headers,
    MessageContent as content,
    SenderPrincipal as sender_principal,
    Attempts as attempts,
    Acknowledged as acknowledged,
    Abandoned as abandoned
";

impl SqliteQueueStore {
    pub fn new(
        pool: SqlitePool,
        queue: impl Into<String>,
        tokens: Arc<dyn SecurityTokenService>,
    ) -> Self {
        Self {
            pool,
            queue: queue.into(),
            tokens,
        }
    }

    fn materialize(&self, row: QueuedMessageRow) -> Result<QueuedMessage, Error> {
        let id = Uuid::parse_str(&row.message_id).map_err(Error::internal)?;
        let headers: Headers = serde_json::from_str(&row.headers)?;

        let principal = row.sender_principal.as_deref().and_then(|token| {
            match self.tokens.validate(token) {
                Ok(principal) => Some(principal),
                Err(e) => {
                    tracing::warn!(queue = %self.queue, message_id = %id, error = %e,
                        "stored sender principal failed validation, dispatching anonymously");
                    None
                }
            }
        });

        Ok(QueuedMessage {
            record_id: Some(row.id),
            message: Message {
                id,
                headers,
                content: row.content,
            },
            principal,
            attempts: row.attempts as u32,
            acknowledged_at: row.acknowledged,
            abandoned_at: row.abandoned,
        })
    }

    async fn select_pending_inner(&self) -> Result<Vec<QueuedMessage>, Error> {
        let sql = format!(
            "
            SELECT {SELECT_COLUMNS} FROM PB_QueuedMessages
            WHERE QueueName = $1 AND Acknowledged IS NULL AND Abandoned IS NULL
            ORDER BY Id ASC
            "
        );

        let mut conn = self.pool.acquire().await?;
        let mut stream = sqlx::query_as::<_, QueuedMessageRow>(&sql)
            .bind(&self.queue)
            .fetch(&mut *conn);

        let mut records = Vec::new();
        while let Some(row) = stream.next().await.transpose()? {
            records.push(self.materialize(row)?);
        }

        Ok(records)
    }

    async fn select_dead_inner(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<QueuedMessage>, Error> {
        let rows: Vec<QueuedMessageRow> = sqlx::query_as(&format!(
            "
            SELECT {SELECT_COLUMNS} FROM PB_QueuedMessages
            WHERE QueueName = $1
            AND Abandoned IS NOT NULL
            AND Abandoned >= $2 AND Abandoned <= $3
            ORDER BY Id ASC
            "
        ))
        .bind(&self.queue)
        .bind(from)
        .bind(to)
        .fetch_all(&mut *self.pool.acquire().await?)
        .await?;

        rows.into_iter().map(|row| self.materialize(row)).collect()
    }

    async fn insert_inner(
        &self,
        message: Message,
        principal: Option<Principal>,
    ) -> Result<QueuedMessage, Error> {
        let sender_principal = principal
            .as_ref()
            .map(|p| self.tokens.issue(p))
            .transpose()?;
        let headers_json = serde_json::to_string(&message.headers)?;

        let id: i64 = sqlx::query_scalar(
            "
            INSERT INTO PB_QueuedMessages (
                MessageId, QueueName, MessageName, Origination, Destination,
                ReplyTo, Expires, ContentType, SenderPrincipal, Headers,
                MessageContent, Attempts
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, 0)
            RETURNING Id
            ",
        )
        .bind(message.id.to_string())
        .bind(&self.queue)
        .bind(message.headers.message_name())
        .bind(message.headers.get(crate::headers::names::ORIGINATION))
        .bind(message.headers.get(crate::headers::names::DESTINATION))
        .bind(message.headers.get(crate::headers::names::REPLY_TO))
        .bind(message.headers.get(crate::headers::names::EXPIRES))
        .bind(message.headers.content_type())
        .bind(sender_principal)
        .bind(headers_json)
        .bind(&message.content)
        .fetch_one(&mut *self.pool.acquire().await?)
        .await?;

        let mut record = QueuedMessage::new(message, principal);
        record.record_id = Some(id);
        Ok(record)
    }

    async fn update_inner(&self, record: &QueuedMessage) -> Result<(), Error> {
        let id = record
            .record_id
            .ok_or_else(|| Error::internal(eyre::eyre!("record has no backend id")))?;

        sqlx::query(
            "
            UPDATE PB_QueuedMessages
            SET Attempts = $1, Acknowledged = $2, Abandoned = $3
            WHERE Id = $4
            ",
        )
        .bind(record.attempts as i64)
        .bind(record.acknowledged_at)
        .bind(record.abandoned_at)
        .bind(id)
        .execute(&mut *self.pool.acquire().await?)
        .await?;

        Ok(())
    }
}

#[async_trait::async_trait]
impl QueueStore for SqliteQueueStore {
    async fn select_pending(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueuedMessage>, Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.select_pending_inner() => result,
        }
    }

    async fn select_dead(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueuedMessage>, Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.select_dead_inner(from, to) => result,
        }
    }

    async fn insert(
        &self,
        message: Message,
        principal: Option<Principal>,
        cancel: &CancellationToken,
    ) -> Result<QueuedMessage, Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.insert_inner(message, principal) => result,
        }
    }

    async fn update(
        &self,
        record: &QueuedMessage,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            result = self.update_inner(record) => result,
        }
    }
}
