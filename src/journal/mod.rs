//! Append-only record of every message observed by the bus.
//!
//! Entries are written once and never updated or deleted from the engine
//! side. Each entry carries an opaque position; positions sort
//! lexicographically in append order, so a reader holding cursor `p`
//! observes a stable prefix of the journal regardless of concurrent
//! appends.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;
use crate::message::Message;

pub mod memory;
pub mod sqlite;

pub use memory::MemoryJournalStore;
pub use sqlite::SqliteJournalStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JournalCategory {
    Sent,
    Received,
    Published,
}

impl JournalCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sent => "Sent",
            Self::Received => "Received",
            Self::Published => "Published",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "Sent" => Some(Self::Sent),
            "Received" => Some(Self::Received),
            "Published" => Some(Self::Published),
            _ => None,
        }
    }
}

impl std::fmt::Display for JournalCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct JournalEntry {
    /// Opaque cursor; treat as a comparable token only.
    pub position: String,
    pub timestamp: DateTime<Utc>,
    pub category: JournalCategory,
    pub topic: Option<String>,
    pub message: Message,
}

/// Conjunctive entry filter. An empty category list matches every
/// category.
#[derive(Debug, Clone, Default)]
pub struct JournalFilter {
    pub categories: Vec<JournalCategory>,
    pub topic: Option<String>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

impl JournalFilter {
    pub fn matches(&self, entry: &JournalEntry) -> bool {
        if !self.categories.is_empty() && !self.categories.contains(&entry.category) {
            return false;
        }
        if let Some(topic) = &self.topic {
            if entry.topic.as_deref() != Some(topic.as_str()) {
                return false;
            }
        }
        if matches!(self.from, Some(from) if entry.timestamp < from) {
            return false;
        }
        if matches!(self.to, Some(to) if entry.timestamp > to) {
            return false;
        }
        true
    }
}

/// One page of journal entries plus the cursor to resume from.
#[derive(Debug, Clone)]
pub struct JournalReadResult {
    pub entries: Vec<JournalEntry>,
    /// Pass back as `after` to continue; unchanged when the page is empty.
    pub next_position: Option<String>,
}

#[async_trait::async_trait]
pub trait JournalStore: Send + Sync {
    /// Appends one entry, atomically, and returns its position.
    async fn append(
        &self,
        category: JournalCategory,
        topic: Option<&str>,
        message: &Message,
    ) -> Result<String, Error>;

    /// Reads up to `limit` matching entries with positions after `after`.
    async fn read(
        &self,
        after: Option<&str>,
        filter: &JournalFilter,
        limit: usize,
    ) -> Result<JournalReadResult, Error>;
}

/// Thin façade over a journal store, named for the three categories the
/// bus records.
#[derive(Clone)]
pub struct MessageJournalingService {
    store: Arc<dyn JournalStore>,
}

impl MessageJournalingService {
    pub fn new(store: Arc<dyn JournalStore>) -> Self {
        Self { store }
    }

    pub async fn journal_sent(&self, message: &Message) -> Result<String, Error> {
        self.store.append(JournalCategory::Sent, None, message).await
    }

    pub async fn journal_received(&self, message: &Message) -> Result<String, Error> {
        self.store
            .append(JournalCategory::Received, None, message)
            .await
    }

    pub async fn journal_published(&self, topic: &str, message: &Message) -> Result<String, Error> {
        self.store
            .append(JournalCategory::Published, Some(topic), message)
            .await
    }

    pub async fn read(
        &self,
        after: Option<&str>,
        filter: &JournalFilter,
        limit: usize,
    ) -> Result<JournalReadResult, Error> {
        self.store.read(after, filter, limit).await
    }
}

/// Encodes a backend row id as an opaque, lexicographically monotonic
/// position.
pub(crate) fn encode_position(id: i64) -> String {
    format!("{id:020}")
}

pub(crate) fn decode_position(position: &str) -> Result<i64, Error> {
    position
        .parse()
        .map_err(|_| Error::internal(eyre::eyre!("malformed journal position {position:?}")))
}
