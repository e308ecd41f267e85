//! Queue model types and the listener contract.
//!
//! A queue is a named, durable collection of messages awaiting dispatch to
//! exactly one listener. Messages move through a strict per-record state
//! machine: `Pending` until a dispatch attempt acknowledges them or the
//! attempt budget runs out, then terminally `Acknowledged` or `Abandoned`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::config::defaults;
use crate::error::Error;
use crate::headers::Headers;
use crate::message::Message;
use crate::principal::Principal;

pub mod engine;
pub mod memory;
pub mod sqlite;
pub mod store;

pub use engine::QueueEngine;
pub use memory::MemoryQueueStore;
pub use sqlite::SqliteQueueStore;
pub use store::QueueStore;

/// Per-queue dispatch configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueOptions {
    /// Number of messages dispatched in parallel.
    pub concurrency_limit: usize,
    /// Total dispatch attempts before a message is abandoned.
    pub max_attempts: u32,
    /// Pause between attempts for one message.
    pub retry_delay: Duration,
    /// Acknowledge implicitly when the listener returns without error.
    pub auto_acknowledge: bool,
    /// Non-durable queues may live in memory only.
    pub is_durable: bool,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            concurrency_limit: defaults::CONCURRENCY_LIMIT,
            max_attempts: defaults::MAX_ATTEMPTS,
            retry_delay: Duration::from_millis(defaults::RETRY_DELAY_MS),
            auto_acknowledge: false,
            is_durable: true,
        }
    }
}

impl QueueOptions {
    pub fn validate(&self) -> Result<(), Error> {
        if self.concurrency_limit < 1 {
            return Err(Error::InvalidOptions {
                message: "concurrency_limit must be at least 1".into(),
            });
        }
        if self.max_attempts < 1 {
            return Err(Error::InvalidOptions {
                message: "max_attempts must be at least 1".into(),
            });
        }
        Ok(())
    }
}

/// Disposition of a queued message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Pending,
    Acknowledged,
    Abandoned,
}

/// A message in a queue, together with its dispatch bookkeeping.
///
/// Mutated only by the owning queue's dispatch loop; reaches a terminal
/// state at most once.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    /// Backend-assigned record identifier, if the backend assigns one.
    pub record_id: Option<i64>,
    pub message: Message,
    pub principal: Option<Principal>,
    pub attempts: u32,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub abandoned_at: Option<DateTime<Utc>>,
}

impl QueuedMessage {
    pub fn new(message: Message, principal: Option<Principal>) -> Self {
        Self {
            record_id: None,
            message,
            principal,
            attempts: 0,
            acknowledged_at: None,
            abandoned_at: None,
        }
    }

    pub fn state(&self) -> QueueState {
        if self.acknowledged_at.is_some() {
            QueueState::Acknowledged
        } else if self.abandoned_at.is_some() {
            QueueState::Abandoned
        } else {
            QueueState::Pending
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state() != QueueState::Pending
    }
}

/// Dispatch-time context handed to the listener alongside the message.
pub struct QueueContext {
    headers: Headers,
    principal: Option<Principal>,
    acknowledged: AtomicBool,
}

impl QueueContext {
    pub(crate) fn new(headers: Headers, principal: Option<Principal>) -> Self {
        Self {
            headers,
            principal,
            acknowledged: AtomicBool::new(false),
        }
    }

    /// Signals that the message has been durably consumed. Idempotent.
    pub fn acknowledge(&self) {
        self.acknowledged.store(true, Ordering::SeqCst);
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::SeqCst)
    }

    /// Identity restored from the token captured at enqueue.
    pub fn principal(&self) -> Option<&Principal> {
        self.principal.as_ref()
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }
}

/// The in-process receiver registered when a queue is created.
///
/// An `Err` return is logged and treated as a negative acknowledgement; it
/// counts against the attempt budget. Listeners enforce their own
/// deadlines; the engine passes its cancellation token through but never
/// aborts an invocation.
#[async_trait::async_trait]
pub trait QueueListener: Send + Sync {
    async fn receive(
        &self,
        message: &Message,
        context: &QueueContext,
        cancel: &CancellationToken,
    ) -> eyre::Result<()>;
}
