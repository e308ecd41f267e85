//! In-memory queue store for non-durable queues and tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::message::Message;
use crate::principal::Principal;
use crate::queue::store::QueueStore;
use crate::queue::QueuedMessage;

/// Keeps records in process memory. Nothing survives a restart, which is
/// exactly the contract of a queue created with `is_durable: false`.
///
/// Operations never block, so the cancellation signal is only checked on
/// entry.
#[derive(Default)]
pub struct MemoryQueueStore {
    records: Mutex<Vec<QueuedMessage>>,
    next_id: AtomicI64,
}

impl MemoryQueueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl QueueStore for MemoryQueueStore {
    async fn select_pending(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueuedMessage>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let records = self.records.lock().expect("queue store lock");
        Ok(records.iter().filter(|r| !r.is_terminal()).cloned().collect())
    }

    async fn select_dead(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueuedMessage>, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let records = self.records.lock().expect("queue store lock");
        Ok(records
            .iter()
            .filter(|r| matches!(r.abandoned_at, Some(at) if at >= from && at <= to))
            .cloned()
            .collect())
    }

    async fn insert(
        &self,
        message: Message,
        principal: Option<Principal>,
        cancel: &CancellationToken,
    ) -> Result<QueuedMessage, Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut record = QueuedMessage::new(message, principal);
        record.record_id = Some(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);

        let mut records = self.records.lock().expect("queue store lock");
        records.push(record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        record: &QueuedMessage,
        cancel: &CancellationToken,
    ) -> Result<(), Error> {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let mut records = self.records.lock().expect("queue store lock");
        let stored = records
            .iter_mut()
            .find(|r| r.record_id == record.record_id)
            .ok_or_else(|| Error::internal(eyre::eyre!("record not found in memory store")))?;

        stored.attempts = record.attempts;
        stored.acknowledged_at = record.acknowledged_at;
        stored.abandoned_at = record.abandoned_at;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn terminal_records_leave_the_pending_set() {
        let store = MemoryQueueStore::new();
        let cancel = CancellationToken::new();
        let mut record = store
            .insert(Message::new(b"hello".to_vec()), None, &cancel)
            .await
            .unwrap();
        assert_eq!(store.select_pending(&cancel).await.unwrap().len(), 1);

        record.attempts = 1;
        record.abandoned_at = Some(Utc::now());
        store.update(&record, &cancel).await.unwrap();

        assert!(store.select_pending(&cancel).await.unwrap().is_empty());
        let dead = store
            .select_dead(
                Utc::now() - chrono::Duration::minutes(1),
                Utc::now(),
                &cancel,
            )
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].message.id, record.message.id);
    }

    #[tokio::test]
    async fn cancelled_token_short_circuits_operations() {
        let store = MemoryQueueStore::new();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = store
            .insert(Message::new(b"late".to_vec()), None, &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
        assert!(matches!(
            store.select_pending(&cancel).await.unwrap_err(),
            Error::Cancelled
        ));
    }
}
