use std::time::Duration;

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::Error;
use crate::subscriptions::{expiry_from_ttl, SubscriptionStore};

/// Thread-safe in-memory subscription directory, keyed by
/// (topic, subscriber endpoint).
#[derive(Default)]
pub struct MemorySubscriptionStore {
    subscriptions: papaya::HashMap<(String, String), Option<DateTime<Utc>>>,
}

impl MemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl SubscriptionStore for MemorySubscriptionStore {
    async fn subscribe(
        &self,
        topic: &str,
        subscriber: &Url,
        ttl: Option<Duration>,
    ) -> Result<(), Error> {
        let expires = expiry_from_ttl(Utc::now(), ttl);
        self.subscriptions
            .pin()
            .insert((topic.to_owned(), subscriber.to_string()), expires);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, subscriber: &Url) -> Result<(), Error> {
        self.subscriptions
            .pin()
            .remove(&(topic.to_owned(), subscriber.to_string()));
        Ok(())
    }

    async fn get_subscribers(&self, topic: &str, now: DateTime<Utc>) -> Result<Vec<Url>, Error> {
        let map = self.subscriptions.pin();
        let mut subscribers = Vec::new();
        for ((t, subscriber), expires) in map.iter() {
            if t != topic {
                continue;
            }
            if let Some(at) = expires {
                if *at <= now {
                    continue;
                }
            }
            if let Ok(url) = Url::parse(subscriber) {
                subscribers.push(url);
            }
        }
        Ok(subscribers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resubscribe_refreshes_expiry() {
        let store = MemorySubscriptionStore::new();
        let endpoint: Url = "https://consumer.example.com/bus".parse().unwrap();

        store
            .subscribe("orders", &endpoint, Some(Duration::from_millis(1)))
            .await
            .unwrap();
        store.subscribe("orders", &endpoint, None).await.unwrap();

        let later = Utc::now() + chrono::Duration::hours(1);
        let live = store.get_subscribers("orders", later).await.unwrap();
        assert_eq!(live, vec![endpoint]);
    }

    #[tokio::test]
    async fn expired_subscriptions_are_excluded() {
        let store = MemorySubscriptionStore::new();
        let endpoint: Url = "https://consumer.example.com/bus".parse().unwrap();

        store
            .subscribe("orders", &endpoint, Some(Duration::from_secs(60)))
            .await
            .unwrap();

        let now = Utc::now();
        assert_eq!(store.get_subscribers("orders", now).await.unwrap().len(), 1);

        let later = now + chrono::Duration::hours(1);
        assert!(store.get_subscribers("orders", later).await.unwrap().is_empty());
        assert!(store.get_subscribers("invoices", now).await.unwrap().is_empty());
    }
}
