//! # Session Registry
//!
//! Owns the map from session id to (connection, worker, creation time) and the
//! teardown protocol for those entries.
//!
//! ## Claim-then-act:
//! [`SessionRegistry::remove`] first removes the entry from the map while holding
//! the map lock, and only then starts the slow teardown work (cancelling the worker,
//! disconnecting the connection). The lock is never held across an `.await`, so a
//! second caller for the same id either finds the entry (and wins the claim) or
//! finds nothing and returns immediately. Exactly one caller tears a session down.
//!
//! ## Rust Concepts:
//! - **Arc<RegistryInner>**: The registry is a cheap, cloneable handle shared by the
//!   HTTP handlers, the idle sweeper and the per-connection watchers
//! - **Weak**: Background tasks hold a `Weak` reference so they never keep a
//!   dropped registry alive
//! - **std::sync::Mutex**: Held only for the synchronous map operation; tokio's
//!   multi-threaded scheduler makes the lock necessary for the claim to be atomic

use super::sweeper::SweeperHandle;
use super::{RegistryConfig, RegistryError, RegistryStatus, RemovalReason};
use crate::connection::{ConnectionEvent, PeerConnection};
use crate::worker::{WorkerExit, WorkerHandle};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use tokio::runtime::Handle;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// One tracked session. Only the registry ever sees these.
pub(super) struct Session {
    pub(super) connection: Arc<dyn PeerConnection>,
    pub(super) worker: WorkerHandle,
    pub(super) created_at: Instant,
    /// Stops the notification watcher for this session
    pub(super) events: CancellationToken,
}

pub(super) struct RegistryInner {
    pub(super) sessions: Mutex<HashMap<String, Session>>,
    pub(super) sweeper: Mutex<Option<SweeperHandle>>,
    pub(super) config: RegistryConfig,
    pub(super) closed: AtomicBool,
    /// Runtime that owns every background task the registry starts
    pub(super) runtime: Handle,
}

impl RegistryInner {
    pub(super) fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(super) fn lock_sweeper(&self) -> MutexGuard<'_, Option<SweeperHandle>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Shared handle to the set of live sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    pub(super) inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    /// Create an empty registry whose background tasks run on the current tokio runtime.
    ///
    /// Must be called from within a runtime.
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_runtime(config, Handle::current())
    }

    pub fn with_runtime(config: RegistryConfig, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                sweeper: Mutex::new(None),
                config,
                closed: AtomicBool::new(false),
                runtime,
            }),
        }
    }

    pub(super) fn from_inner(inner: Arc<RegistryInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> RegistryConfig {
        self.inner.config
    }

    /// Runtime used for session workers and registry background tasks.
    pub fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Whether `shutdown_all` has started. A closed registry accepts no new sessions.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Track a new session and subscribe to its connection's notifications.
    ///
    /// ## Errors:
    /// - **DuplicateSession**: `id` is already tracked. Connection ids are unique, so
    ///   this is a programming error; it is logged loudly and the existing session is
    ///   left untouched
    /// - **AtCapacity**: the configured session limit is reached
    /// - **ShuttingDown**: `shutdown_all` has started
    ///
    /// A rejected `worker` is cancelled when it is dropped. The caller still holds
    /// the connection and is responsible for disconnecting it.
    pub fn register(
        &self,
        id: impl Into<String>,
        connection: Arc<dyn PeerConnection>,
        worker: WorkerHandle,
    ) -> Result<(), RegistryError> {
        let id = id.into();
        let events = CancellationToken::new();

        let receiver = connection.subscribe();
        let total = {
            let mut sessions = self.inner.lock_sessions();

            if self.is_closed() {
                return Err(RegistryError::ShuttingDown);
            }
            if sessions.contains_key(&id) {
                error!(session_id = %id, "Refusing to register duplicate session id");
                return Err(RegistryError::DuplicateSession(id));
            }
            let limit = self.inner.config.max_sessions;
            if sessions.len() >= limit {
                warn!(session_id = %id, limit, "Session limit reached");
                return Err(RegistryError::AtCapacity { limit });
            }

            sessions.insert(
                id.clone(),
                Session {
                    connection,
                    worker,
                    created_at: Instant::now(),
                    events: events.clone(),
                },
            );
            sessions.len()
        };

        self.watch_connection(id.clone(), receiver, events);
        info!(session_id = %id, total, "Added session");
        Ok(())
    }

    /// Look up the connection of a live session.
    pub fn lookup(&self, id: &str) -> Option<Arc<dyn PeerConnection>> {
        self.inner
            .lock_sessions()
            .get(id)
            .map(|session| Arc::clone(&session.connection))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock_sessions().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock_sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether another session could be registered right now.
    pub fn has_capacity(&self) -> bool {
        !self.is_closed() && self.len() < self.inner.config.max_sessions
    }

    /// Tear down a session. The only teardown entry point.
    ///
    /// Returns `true` if this call claimed the session and performed the teardown,
    /// `false` if the id was not tracked (never registered, or already removed by
    /// another trigger). Teardown problems are logged, never returned: the entry is
    /// gone from the map before any of them can happen.
    pub async fn remove(&self, id: &str, reason: RemovalReason) -> bool {
        let claimed = {
            let mut sessions = self.inner.lock_sessions();
            sessions.remove(id)
        };
        let Some(session) = claimed else {
            trace!(session_id = %id, reason = %reason, "Session already removed");
            return false;
        };

        info!(session_id = %id, reason = %reason, "Removing session");

        session.events.cancel();

        let grace = self.inner.config.worker_grace_period;
        match session.worker.shutdown(grace).await {
            WorkerExit::Cancelled | WorkerExit::Completed => {
                trace!(session_id = %id, "Worker stopped")
            }
            WorkerExit::Failed(err) => {
                error!(session_id = %id, "Error cancelling worker: {}", err)
            }
            WorkerExit::Panicked(message) => {
                error!(session_id = %id, "Worker panicked: {}", message)
            }
            WorkerExit::Abandoned => {
                error!(
                    session_id = %id,
                    grace_secs = grace.as_secs_f64(),
                    "Worker ignored cancellation, aborted after grace period"
                )
            }
        }

        if let Err(err) = session.connection.disconnect().await {
            warn!(session_id = %id, "Error disconnecting: {:#}", err);
        }

        let remaining = self.len();
        info!(session_id = %id, reason = %reason, remaining, "Session removed");
        true
    }

    /// Consistent snapshot of the tracked sessions.
    pub fn status(&self) -> RegistryStatus {
        let sessions = self.inner.lock_sessions();
        let mut connection_ids: Vec<String> = sessions.keys().cloned().collect();
        connection_ids.sort();
        let worker_count = sessions
            .values()
            .filter(|session| !session.worker.is_finished())
            .count();

        RegistryStatus {
            active_connections: sessions.len(),
            connection_ids,
            worker_count,
        }
    }

    /// Stop the sweeper, then tear down every session with reason `shutdown`.
    ///
    /// New registrations are refused from the moment this starts. Removals run
    /// concurrently; each one claims its own entry, so a notification or sweep racing
    /// with shutdown is harmless.
    pub async fn shutdown_all(&self) {
        info!("Shutting down session registry");
        self.inner.closed.store(true, Ordering::SeqCst);

        self.stop_sweeper().await;

        let ids: Vec<String> = self.inner.lock_sessions().keys().cloned().collect();
        let removals = ids
            .iter()
            .map(|id| self.remove(id, RemovalReason::Shutdown));
        let removed = futures_util::future::join_all(removals)
            .await
            .into_iter()
            .filter(|removed| *removed)
            .count();

        info!(removed, "Session registry shut down");
    }

    /// Forward `closed` / `failed` notifications for one session into `remove`.
    fn watch_connection(
        &self,
        id: String,
        receiver: broadcast::Receiver<ConnectionEvent>,
        stop: CancellationToken,
    ) {
        let registry: Weak<RegistryInner> = Arc::downgrade(&self.inner);

        self.inner.runtime.spawn(async move {
            let mut events = BroadcastStream::new(receiver);
            loop {
                let next = tokio::select! {
                    biased;
                    _ = stop.cancelled() => break,
                    next = events.next() => next,
                };

                let reason = match next {
                    Some(Ok(ConnectionEvent::Closed)) => RemovalReason::Closed,
                    Some(Ok(ConnectionEvent::Failed)) => RemovalReason::Failed,
                    Some(Ok(ConnectionEvent::Connected)) => {
                        debug!(session_id = %id, "Connection established");
                        continue;
                    }
                    Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                        warn!(session_id = %id, skipped, "Missed connection notifications");
                        continue;
                    }
                    None => {
                        trace!(session_id = %id, "Connection notification channel closed");
                        break;
                    }
                };

                if let Some(inner) = registry.upgrade() {
                    SessionRegistry::from_inner(inner).remove(&id, reason).await;
                }
                break;
            }
        });
    }
}
