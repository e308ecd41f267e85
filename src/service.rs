//! Registry of queues by name.
//!
//! The service owns the shared SQLite pool, creates queue engines on
//! demand, and routes enqueue calls to the owning engine. One queue per
//! name per process; re-creating a name with a different listener or
//! options is rejected.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode, SqlitePoolOptions,
};
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::Config;
use crate::error::Error;
use crate::message::Message;
use crate::principal::{Bs58TokenService, Principal, SecurityTokenService};
use crate::queue::{
    MemoryQueueStore, QueueEngine, QueueListener, QueueOptions, QueueStore, QueuedMessage,
    SqliteQueueStore,
};

/// Point-in-time message counts for one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatistics {
    pub queue: String,
    /// Messages awaiting dispatch or currently in flight.
    pub pending: u64,
    /// Messages abandoned after exhausting their attempt budget.
    pub dead: u64,
}

pub struct Service {
    db: SqlitePool,
    config: Arc<Config>,
    tokens: Arc<dyn SecurityTokenService>,
    queues: Mutex<HashMap<String, Arc<QueueEngine>>>,
    disposed: AtomicBool,
}

impl Service {
    pub async fn connect() -> Result<Self, Error> {
        Self::connect_with(Config::default()).await
    }

    pub async fn connect_with(config: Config) -> Result<Self, Error> {
        Self::connect_with_tokens(config, Arc::new(Bs58TokenService)).await
    }

    /// Connects with a caller-supplied token service (e.g. one backed by a
    /// real token authority).
    pub async fn connect_with_tokens(
        config: Config,
        tokens: Arc<dyn SecurityTokenService>,
    ) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(config.db_path())
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let pool = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self {
            db: pool,
            config: Arc::new(config),
            tokens,
            queues: Mutex::new(HashMap::new()),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn db(&self) -> &SqlitePool {
        &self.db
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn token_service(&self) -> &Arc<dyn SecurityTokenService> {
        &self.tokens
    }

    pub fn default_options(&self) -> QueueOptions {
        QueueOptions {
            concurrency_limit: self.config.default_concurrency_limit(),
            max_attempts: self.config.default_max_attempts(),
            retry_delay: Duration::from_millis(self.config.default_retry_delay_ms()),
            auto_acknowledge: false,
            is_durable: true,
        }
    }

    /// Creates (or reopens) a queue and begins dispatch, recovering any
    /// pending records the store holds for the name.
    ///
    /// Idempotent for the identical (listener, options) pair; any other
    /// re-creation of the name fails with [`Error::QueueExists`].
    pub async fn create_queue(
        &self,
        name: impl Into<String>,
        listener: Arc<dyn QueueListener>,
        options: Option<QueueOptions>,
    ) -> Result<(), Error> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::ServiceDisposed);
        }

        let name = name.into();
        let options = options.unwrap_or_else(|| self.default_options());
        options.validate()?;

        let mut queues = self.queues.lock().await;
        if let Some(existing) = queues.get(&name) {
            if Arc::ptr_eq(existing.listener(), &listener) && existing.options() == &options {
                return Ok(());
            }
            return Err(Error::QueueExists { queue: name });
        }

        let store: Arc<dyn QueueStore> = if options.is_durable {
            Arc::new(SqliteQueueStore::new(
                self.db.clone(),
                name.clone(),
                Arc::clone(&self.tokens),
            ))
        } else {
            Arc::new(MemoryQueueStore::new())
        };

        let engine = Arc::new(QueueEngine::new(
            name.clone(),
            options,
            store,
            listener,
            Arc::clone(&self.tokens),
        )?);
        engine.init().await?;

        queues.insert(name.clone(), engine);
        tracing::info!(queue = %name, "queue created");
        Ok(())
    }

    /// Enqueues a message on a registered queue, capturing the caller's
    /// identity for restoration at dispatch.
    pub async fn enqueue(
        &self,
        name: &str,
        message: Message,
        principal: Option<&Principal>,
    ) -> Result<(), Error> {
        let engine = self
            .queue(name)
            .await
            .ok_or_else(|| Error::queue_not_found(name))?;
        engine.enqueue(message, principal).await
    }

    /// Whether a message still counts against the queue's pending set.
    pub async fn message_queued(&self, name: &str, message_id: Uuid) -> Result<bool, Error> {
        let engine = self
            .queue(name)
            .await
            .ok_or_else(|| Error::queue_not_found(name))?;
        let pending = engine.pending_messages().await?;
        Ok(pending.iter().any(|r| r.message.id == message_id))
    }

    /// Whether a message has been abandoned into the queue's dead set.
    pub async fn message_dead(&self, name: &str, message_id: Uuid) -> Result<bool, Error> {
        let dead = self
            .dead_letters(name, DateTime::<Utc>::MIN_UTC, Utc::now())
            .await?;
        Ok(dead.iter().any(|r| r.message.id == message_id))
    }

    /// Abandoned records with `abandoned_at` in the given range.
    pub async fn dead_letters(
        &self,
        name: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<QueuedMessage>, Error> {
        let engine = self
            .queue(name)
            .await
            .ok_or_else(|| Error::queue_not_found(name))?;
        engine.dead_letters(from, to).await
    }

    pub async fn queue_statistics(&self, name: &str) -> Result<QueueStatistics, Error> {
        let engine = self
            .queue(name)
            .await
            .ok_or_else(|| Error::queue_not_found(name))?;

        let pending = engine.pending_messages().await?.len() as u64;
        let dead = engine
            .dead_letters(DateTime::<Utc>::MIN_UTC, Utc::now())
            .await?
            .len() as u64;

        Ok(QueueStatistics {
            queue: name.to_owned(),
            pending,
            dead,
        })
    }

    async fn queue(&self, name: &str) -> Option<Arc<QueueEngine>> {
        self.queues.lock().await.get(name).cloned()
    }

    /// Disposes every owned queue engine. Further creates and enqueues
    /// fail.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        let queues: Vec<_> = self.queues.lock().await.drain().collect();
        for (_, engine) in queues {
            engine.dispose().await;
        }
        tracing::info!("queueing service disposed");
    }
}
