use std::sync::Mutex;

use chrono::Utc;

use crate::error::Error;
use crate::journal::{
    decode_position, encode_position, JournalCategory, JournalEntry, JournalFilter,
    JournalReadResult, JournalStore,
};
use crate::message::Message;

/// In-memory journal for tests and non-durable deployments.
#[derive(Default)]
pub struct MemoryJournalStore {
    entries: Mutex<Vec<JournalEntry>>,
}

impl MemoryJournalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl JournalStore for MemoryJournalStore {
    async fn append(
        &self,
        category: JournalCategory,
        topic: Option<&str>,
        message: &Message,
    ) -> Result<String, Error> {
        let mut entries = self.entries.lock().expect("journal lock");
        let position = encode_position(entries.len() as i64 + 1);

        entries.push(JournalEntry {
            position: position.clone(),
            timestamp: Utc::now(),
            category,
            topic: topic.map(str::to_owned),
            message: message.clone(),
        });
        Ok(position)
    }

    async fn read(
        &self,
        after: Option<&str>,
        filter: &JournalFilter,
        limit: usize,
    ) -> Result<JournalReadResult, Error> {
        let after_id = after.map(decode_position).transpose()?.unwrap_or(0);

        let entries = self.entries.lock().expect("journal lock");
        let page: Vec<JournalEntry> = entries
            .iter()
            .skip(after_id as usize)
            .filter(|entry| filter.matches(entry))
            .take(limit)
            .cloned()
            .collect();

        let next_position = page
            .last()
            .map(|entry| entry.position.clone())
            .or_else(|| after.map(str::to_owned));

        Ok(JournalReadResult {
            entries: page,
            next_position,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn positions_sort_in_append_order() {
        let store = MemoryJournalStore::new();
        let first = store
            .append(JournalCategory::Sent, None, &Message::new(b"a".to_vec()))
            .await
            .unwrap();
        let second = store
            .append(
                JournalCategory::Published,
                Some("orders"),
                &Message::new(b"b".to_vec()),
            )
            .await
            .unwrap();
        assert!(second > first);
    }

    #[tokio::test]
    async fn read_resumes_from_cursor_and_applies_filter() {
        let store = MemoryJournalStore::new();
        for i in 0..5u8 {
            let category = if i % 2 == 0 {
                JournalCategory::Received
            } else {
                JournalCategory::Sent
            };
            store
                .append(category, None, &Message::new(vec![i]))
                .await
                .unwrap();
        }

        let filter = JournalFilter {
            categories: vec![JournalCategory::Received],
            ..Default::default()
        };
        let first_page = store.read(None, &filter, 2).await.unwrap();
        assert_eq!(first_page.entries.len(), 2);

        let rest = store
            .read(first_page.next_position.as_deref(), &filter, 10)
            .await
            .unwrap();
        assert_eq!(rest.entries.len(), 1);
        assert_eq!(rest.entries[0].message.content, vec![4]);
    }
}
