//! # Idle Sweeper
//!
//! Periodic pass that evicts sessions nobody else cleaned up: connections that
//! never reported `closed`/`failed`, or that outlived the idle timeout.
//!
//! A session is stale when either
//! - its age exceeds the idle timeout, or
//! - its connection reports a terminal transport state (`disconnected`, `failed`,
//!   `closed`). A connection that cannot report its state counts as healthy.
//!
//! The pass snapshots the stale ids under the lock and removes them afterwards, so
//! it never holds the lock while tearing anything down. One failing removal does
//! not abort the pass.

use super::registry::{RegistryInner, SessionRegistry};
use super::RemovalReason;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Running sweeper loop.
pub(super) struct SweeperHandle {
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl SessionRegistry {
    /// Start the periodic sweep. Returns `false` if it is already running or the
    /// registry is closed.
    pub fn start_sweeper(&self) -> bool {
        if self.is_closed() {
            return false;
        }
        let mut slot = self.inner.lock_sweeper();
        if slot.is_some() {
            return false;
        }

        let stop = CancellationToken::new();
        let interval = self.inner.config.sweep_interval;
        let task = self.inner.runtime.spawn(run_sweeper(
            Arc::downgrade(&self.inner),
            interval,
            stop.clone(),
        ));
        *slot = Some(SweeperHandle { stop, task });

        info!(
            interval_secs = interval.as_secs(),
            idle_timeout_secs = self.inner.config.idle_timeout.as_secs(),
            "Started idle session sweeper"
        );
        true
    }

    pub fn is_sweeping(&self) -> bool {
        self.inner.lock_sweeper().is_some()
    }

    /// Stop the periodic sweep and wait for an in-flight pass to finish.
    pub async fn stop_sweeper(&self) {
        let running = self.inner.lock_sweeper().take();
        let Some(SweeperHandle { stop, task }) = running else {
            return;
        };

        stop.cancel();
        if let Err(err) = task.await {
            if !err.is_cancelled() {
                error!("Idle session sweeper ended abnormally: {}", err);
            }
        }
        debug!("Stopped idle session sweeper");
    }

    /// Run one sweep pass and return how many sessions it removed.
    pub async fn sweep(&self) -> usize {
        if self.is_closed() {
            return 0;
        }

        let idle_timeout = self.inner.config.idle_timeout;
        let now = Instant::now();
        let stale: Vec<(String, Duration)> = {
            let sessions = self.inner.lock_sessions();
            sessions
                .iter()
                .filter_map(|(id, session)| {
                    let age = now.saturating_duration_since(session.created_at);
                    let terminal = session
                        .connection
                        .state()
                        .is_some_and(|state| state.is_terminal());
                    (age > idle_timeout || terminal).then(|| (id.clone(), age))
                })
                .collect()
        };

        if stale.is_empty() {
            trace!("Sweep found no stale sessions");
            return 0;
        }

        let mut removed = 0;
        for (id, age) in stale {
            warn!(
                session_id = %id,
                age_secs = age.as_secs(),
                "Removing stale connection"
            );

            // Run each removal as its own task so a panic in one teardown is
            // contained to that session.
            let registry = self.clone();
            let task_id = id.clone();
            let removal = self
                .inner
                .runtime
                .spawn(async move { registry.remove(&task_id, RemovalReason::Stale).await });

            match removal.await {
                Ok(true) => removed += 1,
                Ok(false) => trace!(session_id = %id, "Stale session was already removed"),
                Err(err) => error!(session_id = %id, "Error removing stale session: {}", err),
            }
        }

        info!(removed, remaining = self.len(), "Sweep complete");
        removed
    }
}

async fn run_sweeper(registry: Weak<RegistryInner>, period: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let Some(inner) = registry.upgrade() else {
            break;
        };
        SessionRegistry::from_inner(inner).sweep().await;
    }
    trace!("Idle session sweeper loop exited");
}

#[cfg(test)]
mod tests {
    use super::super::registry::tests::{add, wait_until, CountingPipeline};
    use super::super::RegistryConfig;
    use super::*;
    use crate::connection::{ConnectionEvent, TransportState};
    use std::sync::atomic::Ordering;

    const IDLE: Duration = Duration::from_secs(300);

    fn registry() -> SessionRegistry {
        SessionRegistry::new(RegistryConfig::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_aged_session_is_removed_as_stale() {
        let registry = registry();
        let pipeline = Arc::new(CountingPipeline::default());
        let old = add(&registry, "C", &pipeline);

        tokio::time::advance(Duration::from_secs(200)).await;
        let fresh = add(&registry, "D", &pipeline);

        tokio::time::advance(Duration::from_secs(101)).await;
        assert_eq!(registry.sweep().await, 1);

        let status = registry.status();
        assert_eq!(status.connection_ids, vec!["D"]);
        assert_eq!(old.disconnect_count(), 1);
        assert_eq!(fresh.disconnect_count(), 0);
        assert_eq!(pipeline.cancellations.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_exactly_at_timeout_is_kept() {
        let registry = registry();
        let pipeline = Arc::new(CountingPipeline::default());
        add(&registry, "a", &pipeline);

        tokio::time::advance(IDLE).await;
        assert_eq!(registry.sweep().await, 0);
        assert!(registry.contains("a"));
    }

    #[tokio::test]
    async fn test_terminal_transport_state_is_swept() {
        let registry = registry();
        let pipeline = Arc::new(CountingPipeline::default());
        let disconnected = add(&registry, "a", &pipeline);
        let connecting = add(&registry, "b", &pipeline);
        let unknown = add(&registry, "c", &pipeline);

        disconnected.set_state(Some(TransportState::Disconnected));
        connecting.set_state(Some(TransportState::Connecting));
        unknown.set_state(None);

        assert_eq!(registry.sweep().await, 1);
        assert_eq!(registry.status().connection_ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn test_sweep_skips_sessions_removed_by_notification() {
        let registry = registry();
        let pipeline = Arc::new(CountingPipeline::default());
        let connection = add(&registry, "a", &pipeline);

        connection.set_state(Some(TransportState::Closed));
        connection.emit(ConnectionEvent::Closed);
        wait_until(|| registry.is_empty()).await;
        wait_until(|| connection.disconnect_count() == 1).await;

        assert_eq!(registry.sweep().await, 0);
        assert_eq!(connection.disconnect_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_disconnect_does_not_abort_pass() {
        let registry = registry();
        let pipeline = Arc::new(CountingPipeline::default());
        let broken = add(&registry, "a", &pipeline);
        let healthy = add(&registry, "b", &pipeline);

        broken.fail_disconnects();
        broken.set_state(Some(TransportState::Failed));
        healthy.set_state(Some(TransportState::Failed));

        assert_eq!(registry.sweep().await, 2);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_panicking_teardown_is_contained_to_its_session() {
        let registry = registry();
        let pipeline = Arc::new(CountingPipeline::default());
        let first = add(&registry, "a", &pipeline);
        let panicking = add(&registry, "b", &pipeline);
        let last = add(&registry, "c", &pipeline);

        panicking.panic_disconnects();
        for connection in [&first, &panicking, &last] {
            connection.set_state(Some(TransportState::Closed));
        }

        assert_eq!(registry.sweep().await, 2);
        assert!(registry.is_empty());
        assert_eq!(first.disconnect_count(), 1);
        assert_eq!(panicking.disconnect_count(), 1);
        assert_eq!(last.disconnect_count(), 1);
        assert_eq!(pipeline.cancellations.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_sweep_runs_on_interval() {
        let registry = SessionRegistry::new(RegistryConfig {
            sweep_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
            ..RegistryConfig::default()
        });
        let pipeline = Arc::new(CountingPipeline::default());
        let connection = add(&registry, "a", &pipeline);

        assert!(registry.start_sweeper());
        assert!(!registry.start_sweeper());
        assert!(registry.is_sweeping());

        // First two ticks at 30s and 60s: not yet older than the timeout.
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(registry.contains("a"));

        // Tick at 90s evicts it.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(registry.is_empty());
        assert_eq!(connection.disconnect_count(), 1);

        registry.stop_sweeper().await;
        assert!(!registry.is_sweeping());
    }

    #[tokio::test]
    async fn test_sweep_after_shutdown_is_noop() {
        let registry = registry();
        let pipeline = Arc::new(CountingPipeline::default());
        let connection = add(&registry, "a", &pipeline);

        registry.shutdown_all().await;
        connection.set_state(Some(TransportState::Failed));

        assert_eq!(registry.status().active_connections, 0);
        assert_eq!(registry.sweep().await, 0);
        assert!(!registry.start_sweeper());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_exits_once_registry_is_dropped() {
        let registry = registry();
        registry.start_sweeper();
        let handle = registry.inner.lock_sweeper().take().unwrap();
        drop(registry);

        // The next tick finds nothing to upgrade and the loop ends on its own.
        tokio::time::timeout(Duration::from_secs(60), handle.task)
            .await
            .expect("sweeper should exit")
            .unwrap();
        assert!(!handle.stop.is_cancelled());
    }
}
