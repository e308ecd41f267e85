//! Ownership of a single named queue: enqueue, bounded-concurrency
//! dispatch, retry, dead-lettering, and recovery on start.
//!
//! One dispatcher task pulls records off a bounded channel, takes one of
//! `concurrency_limit` semaphore permits, and spawns a worker per record.
//! A worker owns its record from pickup to terminal disposition: every
//! attempt count and terminal timestamp is persisted before the slot is
//! released, so a crash never double-counts an attempt that was durably
//! recorded. Disposal cancels the loop cooperatively; workers observe the
//! token at the next suspension point and in-flight listener invocations
//! are never forcibly aborted.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::Error;
use crate::message::Message;
use crate::principal::{Principal, SecurityTokenService};
use crate::queue::store::QueueStore;
use crate::queue::{QueueContext, QueueListener, QueueOptions, QueuedMessage};

/// How many scheduled records may wait between the store and the worker
/// pool before `enqueue` blocks.
const DISPATCH_BACKLOG: usize = 64;

/// Bounded backoff for store writes inside a worker: first delay, doubling
/// per retry, up to the attempt ceiling. Past the ceiling the record is
/// left Pending for re-pick on the next init.
const STORE_WRITE_ATTEMPTS: u32 = 5;
const STORE_WRITE_BACKOFF: Duration = Duration::from_millis(100);

struct Shared {
    queue: String,
    options: QueueOptions,
    store: Arc<dyn QueueStore>,
    listener: Arc<dyn QueueListener>,
    tokens: Arc<dyn SecurityTokenService>,
    cancel: CancellationToken,
    /// Message ids currently scheduled or in flight. Guarantees a record
    /// is never concurrently dispatched to two workers, including the
    /// race between recovery and a concurrent enqueue.
    scheduled: std::sync::Mutex<HashSet<Uuid>>,
    faulted: AtomicBool,
}

pub struct QueueEngine {
    shared: Arc<Shared>,
    tx: mpsc::Sender<QueuedMessage>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    disposed: AtomicBool,
}

impl QueueEngine {
    /// Creates the engine and starts its dispatcher. Call [`init`] to load
    /// and schedule records persisted by a previous run.
    ///
    /// [`init`]: QueueEngine::init
    pub fn new(
        queue: impl Into<String>,
        options: QueueOptions,
        store: Arc<dyn QueueStore>,
        listener: Arc<dyn QueueListener>,
        tokens: Arc<dyn SecurityTokenService>,
    ) -> Result<Self, Error> {
        options.validate()?;

        let (tx, rx) = mpsc::channel(DISPATCH_BACKLOG);
        let shared = Arc::new(Shared {
            queue: queue.into(),
            options,
            store,
            listener,
            tokens,
            cancel: CancellationToken::new(),
            scheduled: std::sync::Mutex::new(HashSet::new()),
            faulted: AtomicBool::new(false),
        });

        let dispatcher = tokio::spawn(dispatch_loop(Arc::clone(&shared), rx));

        Ok(Self {
            shared,
            tx,
            dispatcher: Mutex::new(Some(dispatcher)),
            disposed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.queue
    }

    pub fn options(&self) -> &QueueOptions {
        &self.shared.options
    }

    pub fn listener(&self) -> &Arc<dyn QueueListener> {
        &self.shared.listener
    }

    /// Non-terminal records currently held by the store.
    pub async fn pending_messages(&self) -> Result<Vec<QueuedMessage>, Error> {
        self.shared.store.select_pending(&self.shared.cancel).await
    }

    /// Abandoned records whose abandonment falls in the range.
    pub async fn dead_letters(
        &self,
        from: chrono::DateTime<Utc>,
        to: chrono::DateTime<Utc>,
    ) -> Result<Vec<QueuedMessage>, Error> {
        self.shared
            .store
            .select_dead(from, to, &self.shared.cancel)
            .await
    }

    /// Loads pending records from the store and schedules each for
    /// dispatch. Safe to call repeatedly: records already scheduled or in
    /// flight are skipped, and a faulted engine is returned to service.
    ///
    /// Enqueues are accepted while init runs; they are appended to the
    /// backlog and scheduled as they land.
    pub async fn init(&self) -> Result<(), Error> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::QueueDisposed {
                queue: self.shared.queue.clone(),
            });
        }

        let pending = self.shared.store.select_pending(&self.shared.cancel).await?;
        let recovered = pending.len();

        for record in pending {
            self.schedule(record).await?;
        }

        self.shared.faulted.store(false, Ordering::SeqCst);
        if recovered > 0 {
            tracing::info!(queue = %self.shared.queue, recovered, "queue recovered pending messages");
        }
        Ok(())
    }

    /// Appends a pending record to the store, then schedules it.
    ///
    /// Fails once the engine is disposed, and while the engine is faulted
    /// by an earlier permanent store error. Transient store errors are
    /// retried here with bounded backoff and never surface unless the
    /// retries exhaust.
    pub async fn enqueue(
        &self,
        mut message: Message,
        principal: Option<&Principal>,
    ) -> Result<(), Error> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::QueueDisposed {
                queue: self.shared.queue.clone(),
            });
        }
        if self.shared.faulted.load(Ordering::SeqCst) {
            return Err(Error::QueueFaulted {
                queue: self.shared.queue.clone(),
            });
        }

        // Capture the caller identity into the envelope before it is
        // persisted, so the token survives the store round-trip.
        if let Some(principal) = principal {
            let token = self.shared.tokens.issue(principal)?;
            message.headers.set_security_token(token);
        }

        let record = self.insert_with_retry(message, principal.cloned()).await?;
        self.schedule(record).await
    }

    async fn insert_with_retry(
        &self,
        message: Message,
        principal: Option<Principal>,
    ) -> Result<QueuedMessage, Error> {
        let mut delay = STORE_WRITE_BACKOFF;
        let mut attempt = 0;

        loop {
            match self
                .shared
                .store
                .insert(message.clone(), principal.clone(), &self.shared.cancel)
                .await
            {
                Ok(record) => return Ok(record),
                Err(Error::Cancelled) => {
                    return Err(Error::QueueDisposed {
                        queue: self.shared.queue.clone(),
                    });
                }
                Err(e) if e.is_transient() && attempt + 1 < STORE_WRITE_ATTEMPTS => {
                    attempt += 1;
                    tracing::warn!(queue = %self.shared.queue, error = %e, attempt,
                        "transient store error on enqueue, retrying");
                    tokio::select! {
                        _ = self.shared.cancel.cancelled() => {
                            return Err(Error::QueueDisposed {
                                queue: self.shared.queue.clone(),
                            });
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    delay *= 2;
                }
                Err(e) => {
                    if !e.is_transient() {
                        self.shared.faulted.store(true, Ordering::SeqCst);
                        tracing::error!(queue = %self.shared.queue, error = %e,
                            "permanent store error, queue marked faulted");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn schedule(&self, record: QueuedMessage) -> Result<(), Error> {
        if record.is_terminal() {
            return Ok(());
        }

        {
            let mut scheduled = self.shared.scheduled.lock().expect("scheduled set lock");
            if !scheduled.insert(record.message.id) {
                return Ok(());
            }
        }

        let message_id = record.message.id;
        if self.tx.send(record).await.is_err() {
            self.shared
                .scheduled
                .lock()
                .expect("scheduled set lock")
                .remove(&message_id);
            return Err(Error::QueueDisposed {
                queue: self.shared.queue.clone(),
            });
        }
        Ok(())
    }

    /// Cancels the dispatch loop and waits for workers to wind down.
    /// Records not yet terminal stay Pending in the store for the next
    /// init. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.cancel.cancel();
        if let Some(handle) = self.dispatcher.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(queue = %self.shared.queue, error = %e, "dispatcher task failed");
            }
        }
        tracing::info!(queue = %self.shared.queue, "queue disposed");
    }
}

impl Drop for QueueEngine {
    fn drop(&mut self) {
        // If dispose was never called, at least stop the dispatcher.
        self.shared.cancel.cancel();
    }
}

async fn dispatch_loop(shared: Arc<Shared>, mut rx: mpsc::Receiver<QueuedMessage>) {
    let semaphore = Arc::new(Semaphore::new(shared.options.concurrency_limit));
    let mut workers = JoinSet::new();

    loop {
        let record = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            record = rx.recv() => match record {
                Some(record) => record,
                None => break,
            },
        };

        let permit = tokio::select! {
            _ = shared.cancel.cancelled() => break,
            permit = Arc::clone(&semaphore).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let worker_shared = Arc::clone(&shared);
        workers.spawn(async move {
            let _permit = permit;
            let message_id = record.message.id;
            process_record(&worker_shared, record).await;
            worker_shared
                .scheduled
                .lock()
                .expect("scheduled set lock")
                .remove(&message_id);
        });

        while let Some(result) = workers.try_join_next() {
            log_worker_result(&shared.queue, result);
        }
    }

    while let Some(result) = workers.join_next().await {
        log_worker_result(&shared.queue, result);
    }
}

fn log_worker_result(queue: &str, result: Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        tracing::error!(queue = %queue, error = %e, "dispatch worker failed");
    }
}

/// Drives one record from pickup to terminal disposition (or until the
/// engine is disposed / the store becomes unreachable).
async fn process_record(shared: &Shared, mut record: QueuedMessage) {
    let principal = restore_principal(shared, &record);

    loop {
        if shared.cancel.is_cancelled() {
            return;
        }

        let now = Utc::now();
        if record.message.is_expired(now) {
            record.acknowledged_at = Some(now);
            if persist(shared, &record).await {
                tracing::debug!(queue = %shared.queue, message_id = %record.message.id,
                    "expired message acknowledged on pickup");
            }
            return;
        }

        // The attempt must be durably recorded before the listener runs so
        // recovery after a crash never re-spends it.
        record.attempts += 1;
        if !persist(shared, &record).await {
            return;
        }

        let context = QueueContext::new(record.message.headers.clone(), principal.clone());
        let acknowledged = match shared
            .listener
            .receive(&record.message, &context, &shared.cancel)
            .await
        {
            Ok(()) => context.is_acknowledged() || shared.options.auto_acknowledge,
            Err(e) => {
                tracing::warn!(queue = %shared.queue, message_id = %record.message.id,
                    attempt = record.attempts, error = %e, "listener failed");
                false
            }
        };

        let now = Utc::now();
        if acknowledged {
            record.acknowledged_at = Some(now);
            persist(shared, &record).await;
            tracing::debug!(queue = %shared.queue, message_id = %record.message.id,
                attempts = record.attempts, "message acknowledged");
            return;
        }

        if record.attempts >= shared.options.max_attempts {
            record.abandoned_at = Some(now);
            if persist(shared, &record).await {
                tracing::warn!(queue = %shared.queue, message_id = %record.message.id,
                    attempts = record.attempts, "message abandoned");
            }
            return;
        }

        tokio::select! {
            _ = shared.cancel.cancelled() => return,
            _ = tokio::time::sleep(shared.options.retry_delay) => {}
        }
    }
}

fn restore_principal(shared: &Shared, record: &QueuedMessage) -> Option<Principal> {
    if record.principal.is_some() {
        return record.principal.clone();
    }
    let token = record.message.headers.security_token()?;
    match shared.tokens.validate(token) {
        Ok(principal) => Some(principal),
        Err(e) => {
            tracing::warn!(queue = %shared.queue, message_id = %record.message.id, error = %e,
                "security token failed validation, dispatching anonymously");
            None
        }
    }
}

/// Persists the record's current state, retrying transient failures with
/// doubling backoff. Returns false when the engine is disposed mid-retry
/// or the store stays unreachable past the ceiling; the caller abandons
/// the slot and the record is re-picked on the next init.
async fn persist(shared: &Shared, record: &QueuedMessage) -> bool {
    let mut delay = STORE_WRITE_BACKOFF;

    for attempt in 1..=STORE_WRITE_ATTEMPTS {
        match shared.store.update(record, &shared.cancel).await {
            Ok(()) => return true,
            Err(Error::Cancelled) => {
                tracing::debug!(queue = %shared.queue, message_id = %record.message.id,
                    "state update cancelled by dispose, record left for recovery");
                return false;
            }
            Err(e) if e.is_transient() && attempt < STORE_WRITE_ATTEMPTS => {
                tracing::warn!(queue = %shared.queue, message_id = %record.message.id,
                    error = %e, attempt, "transient store error on state update, retrying");
                tokio::select! {
                    _ = shared.cancel.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
                delay *= 2;
            }
            Err(e) => {
                tracing::error!(queue = %shared.queue, message_id = %record.message.id,
                    error = %e, "giving up on state update, record left for recovery");
                return false;
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::principal::Bs58TokenService;
    use crate::queue::memory::MemoryQueueStore;
    use std::sync::atomic::AtomicUsize;

    struct CountingListener {
        invocations: AtomicUsize,
        ack: bool,
        fail: bool,
    }

    impl CountingListener {
        fn new(ack: bool, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                invocations: AtomicUsize::new(0),
                ack,
                fail,
            })
        }

        fn count(&self) -> usize {
            self.invocations.load(Ordering::SeqCst)
        }
    }

    #[async_trait::async_trait]
    impl QueueListener for CountingListener {
        async fn receive(
            &self,
            _message: &Message,
            context: &QueueContext,
            _cancel: &CancellationToken,
        ) -> eyre::Result<()> {
            self.invocations.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                eyre::bail!("listener rejects everything");
            }
            if self.ack {
                context.acknowledge();
            }
            Ok(())
        }
    }

    fn test_engine(
        listener: Arc<dyn QueueListener>,
        options: QueueOptions,
    ) -> (QueueEngine, Arc<MemoryQueueStore>) {
        let store = Arc::new(MemoryQueueStore::new());
        let engine = QueueEngine::new(
            "test-queue",
            options,
            store.clone() as Arc<dyn QueueStore>,
            listener,
            Arc::new(Bs58TokenService),
        )
        .unwrap();
        (engine, store)
    }

    async fn wait_until_count(listener: &CountingListener, expected: usize) {
        for _ in 0..200 {
            if listener.count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("listener did not reach {expected} invocations within 2s");
    }

    async fn wait_until_pending_empty(store: &MemoryQueueStore) {
        let cancel = CancellationToken::new();
        for _ in 0..200 {
            if store.select_pending(&cancel).await.unwrap().is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("queue did not drain within 2s");
    }

    #[tokio::test]
    async fn acknowledged_message_reaches_terminal_state() {
        let listener = CountingListener::new(true, false);
        let (engine, store) = test_engine(listener.clone(), QueueOptions::default());

        engine.enqueue(Message::new(b"hi".to_vec()), None).await.unwrap();

        wait_until_count(&listener, 1).await;
        wait_until_pending_empty(&store).await;
        engine.dispose().await;
    }

    #[tokio::test]
    async fn failing_listener_exhausts_attempts_then_dead_letters() {
        let listener = CountingListener::new(false, true);
        let options = QueueOptions {
            max_attempts: 2,
            retry_delay: Duration::from_millis(20),
            ..Default::default()
        };
        let (engine, store) = test_engine(listener.clone(), options);

        engine.enqueue(Message::new(b"doomed".to_vec()), None).await.unwrap();

        wait_until_count(&listener, 2).await;
        wait_until_pending_empty(&store).await;

        let dead = store
            .select_dead(
                Utc::now() - chrono::Duration::minutes(1),
                Utc::now(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 2);
        engine.dispose().await;
    }

    #[tokio::test]
    async fn disposed_engine_rejects_enqueue() {
        let listener = CountingListener::new(true, false);
        let (engine, _store) = test_engine(listener, QueueOptions::default());

        engine.dispose().await;
        let err = engine
            .enqueue(Message::new(b"late".to_vec()), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::QueueDisposed { .. }));
    }

    #[tokio::test]
    async fn expired_message_is_acknowledged_without_dispatch() {
        let listener = CountingListener::new(true, false);
        let (engine, store) = test_engine(listener.clone(), QueueOptions::default());

        let mut message = Message::new(b"stale".to_vec());
        message
            .headers
            .set_expires(Utc::now() - chrono::Duration::seconds(5));
        engine.enqueue(message, None).await.unwrap();

        wait_until_pending_empty(&store).await;
        assert_eq!(listener.count(), 0);
        engine.dispose().await;
    }
}
