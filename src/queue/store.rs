use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::error::Error;
use crate::message::Message;
use crate::principal::Principal;
use crate::queue::QueuedMessage;

/// Persistence contract for one named queue.
///
/// Backends are values implementing this trait; the engine is agnostic to
/// where records live. Implementations must be safe under concurrent calls
/// from a single engine instance — sharing one physical store between two
/// engine instances is not supported.
///
/// Every operation accepts a cancellation signal (the owning engine's
/// disposal token) and returns [`Error::Cancelled`] instead of completing
/// once it fires, so a slow backend never pins a worker past dispose.
#[async_trait::async_trait]
pub trait QueueStore: Send + Sync {
    /// All non-terminal records for this queue, in any order consistent
    /// with insertion.
    async fn select_pending(&self, cancel: &CancellationToken)
        -> Result<Vec<QueuedMessage>, Error>;

    /// Terminal `Abandoned` records whose abandonment falls in the range.
    async fn select_dead(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<Vec<QueuedMessage>, Error>;

    /// Appends a pending record and returns it materialized, including any
    /// backend-assigned identifier.
    async fn insert(
        &self,
        message: Message,
        principal: Option<Principal>,
        cancel: &CancellationToken,
    ) -> Result<QueuedMessage, Error>;

    /// Overwrites the record's attempt count and terminal timestamps.
    async fn update(&self, record: &QueuedMessage, cancel: &CancellationToken)
        -> Result<(), Error>;
}
