//! Topic subscription tracking.
//!
//! The directory of who subscribes to which topic. Uniqueness is on
//! (topic, subscriber); re-subscribing refreshes the expiry. Expired
//! associations are never returned to callers and may be pruned at any
//! time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::Error;

pub mod memory;
pub mod sqlite;

pub use memory::MemorySubscriptionStore;
pub use sqlite::SqliteSubscriptionStore;

#[async_trait::async_trait]
pub trait SubscriptionStore: Send + Sync {
    /// Upsert; a `ttl` of `None` subscribes without expiry.
    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &Url,
        ttl: Option<Duration>,
    ) -> Result<(), Error>;

    async fn unsubscribe(&self, topic: &str, subscriber: &Url) -> Result<(), Error>;

    /// Live subscriber endpoints for the topic, as of `now`.
    async fn get_subscribers(&self, topic: &str, now: DateTime<Utc>) -> Result<Vec<Url>, Error>;
}

pub(crate) fn expiry_from_ttl(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
    let ttl = ttl?;
    let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
    now.checked_add_signed(ttl)
}

#[derive(Clone)]
pub struct SubscriptionTrackingService {
    store: Arc<dyn SubscriptionStore>,
}

impl SubscriptionTrackingService {
    pub fn new(store: Arc<dyn SubscriptionStore>) -> Self {
        Self { store }
    }

    pub async fn subscribe(
        &self,
        topic: &str,
        subscriber: &Url,
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        self.store.subscribe(topic, subscriber, ttl).await
    }

    pub async fn unsubscribe(&self, topic: &str, subscriber: &Url) -> Result<(), Error> {
        self.store.unsubscribe(topic, subscriber).await
    }

    pub async fn get_subscribers(
        &self,
        topic: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Url>, Error> {
        self.store.get_subscribers(topic, now).await
    }
}
