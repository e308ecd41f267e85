use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use url::Url;

use crate::error::Error;
use crate::subscriptions::{expiry_from_ttl, SubscriptionStore};

pub struct SqliteSubscriptionStore {
    pool: SqlitePool,
}

impl SqliteSubscriptionStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SubscriptionStore for SqliteSubscriptionStore {
    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &Url,
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        let now = Utc::now();
        let expires = expiry_from_ttl(now, ttl);

        let mut conn = self.pool.acquire().await?;

        // Opportunistic prune; expired rows are also excluded on read.
        sqlx::query(
            "DELETE FROM PB_Subscriptions WHERE Expires IS NOT NULL AND Expires <= $1",
        )
        .bind(now)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            "
            INSERT INTO PB_Subscriptions (TopicName, Subscriber, Expires)
            VALUES ($1, $2, $3)
            ON CONFLICT (TopicName, Subscriber) DO UPDATE SET Expires = excluded.Expires
            ",
        )
        .bind(topic)
        .bind(subscriber.as_str())
        .bind(expires)
        .execute(&mut *conn)
        .await?;

        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, subscriber: &Url) -> Result<(), Error> {
        sqlx::query("DELETE FROM PB_Subscriptions WHERE TopicName = $1 AND Subscriber = $2")
            .bind(topic)
            .bind(subscriber.as_str())
            .execute(&mut *self.pool.acquire().await?)
            .await?;

        Ok(())
    }

    async fn get_subscribers(&self, topic: &str, now: DateTime<Utc>) -> Result<Vec<Url>, Error> {
        let rows: Vec<String> = sqlx::query_scalar(
            "
            SELECT Subscriber FROM PB_Subscriptions
            WHERE TopicName = $1 AND (Expires IS NULL OR Expires > $2)
            ",
        )
        .bind(topic)
        .bind(now)
        .fetch_all(&mut *self.pool.acquire().await?)
        .await?;

        let mut subscribers = Vec::with_capacity(rows.len());
        for row in rows {
            subscribers.push(Url::parse(&row).map_err(Error::internal)?);
        }
        Ok(subscribers)
    }
}
