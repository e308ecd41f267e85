pub mod bus;
pub mod config;
pub mod error;
pub mod headers;
pub mod journal;
pub mod message;
pub mod principal;
pub mod queue;
pub mod service;
pub mod subscriptions;

pub use bus::{Bus, Transport};
pub use config::Config;
pub use error::Error;
pub use headers::{Headers, Importance};
pub use journal::{
    JournalCategory, JournalEntry, JournalFilter, JournalStore, MemoryJournalStore,
    MessageJournalingService, SqliteJournalStore,
};
pub use message::Message;
pub use principal::{Bs58TokenService, Claim, Principal, SecurityTokenService};
pub use queue::{
    MemoryQueueStore, QueueContext, QueueEngine, QueueListener, QueueOptions, QueueState,
    QueueStore, QueuedMessage, SqliteQueueStore,
};
pub use service::{QueueStatistics, Service};
pub use subscriptions::{
    MemorySubscriptionStore, SqliteSubscriptionStore, SubscriptionStore,
    SubscriptionTrackingService,
};
