//! # Translation Workers
//!
//! Every negotiated connection gets exactly one background worker that runs the
//! speech-to-translation pipeline for that client. The session registry only relies
//! on the contract defined here:
//!
//! - a worker is built from a [`WorkerConfig`] (session id, language pair, model settings)
//! - it observes a single cancellation signal
//! - once cancelled it finishes within a bounded time, without panicking
//! - it never holds on to the client's connection handle
//!
//! ## Cancellation:
//! Cancellation is cooperative. [`WorkerHandle::shutdown`] requests it and then waits
//! at most a grace period; a worker that ignores the request is aborted and reported
//! as [`WorkerExit::Abandoned`].

pub mod language;
pub mod pipeline;
pub mod prompts;

use crate::config::TranslationConfig;
use async_trait::async_trait;
use language::Language;
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, error};

pub use pipeline::IdiomTranslator;

/// Session-specific settings a worker is constructed with.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub session_id: String,
    /// Language the client speaks
    pub source_language: Language,
    /// Language the client wants to hear back
    pub target_language: Language,
    pub translation: TranslationConfig,
}

/// The per-session processing pipeline.
///
/// Implementations must return promptly once `cancel` fires. Returning `Ok(())`
/// after cancellation is the normal way to stop.
#[async_trait]
pub trait TranslationPipeline: Send + Sync {
    async fn run(&self, config: WorkerConfig, cancel: CancellationToken) -> anyhow::Result<()>;
}

/// How a worker ended once teardown was requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerExit {
    /// The pipeline had already finished on its own
    Completed,
    /// The pipeline stopped in response to cancellation
    Cancelled,
    /// The pipeline returned an error
    Failed(String),
    /// The pipeline panicked
    Panicked(String),
    /// The pipeline ignored cancellation for the whole grace period and was aborted
    Abandoned,
}

/// Owned handle to a running worker.
///
/// Dropping the handle requests cancellation, so a worker can never outlive a
/// session entry that forgot to shut it down.
pub struct WorkerHandle {
    session_id: String,
    task: JoinHandle<anyhow::Result<()>>,
    cancel_on_drop: DropGuard,
}

impl WorkerHandle {
    /// Start `pipeline` for one session on `runtime`.
    pub fn spawn(
        runtime: &Handle,
        pipeline: Arc<dyn TranslationPipeline>,
        config: WorkerConfig,
    ) -> Self {
        let cancel = CancellationToken::new();
        let session_id = config.session_id.clone();
        let token = cancel.clone();

        let task = runtime.spawn(async move {
            let session_id = config.session_id.clone();
            debug!(session_id = %session_id, "Translation worker started");

            let result = pipeline.run(config, token.clone()).await;
            match &result {
                Ok(()) => debug!(session_id = %session_id, "Translation worker finished"),
                // Failures after cancellation are reported by whoever is tearing the session down.
                Err(err) if !token.is_cancelled() => {
                    error!(session_id = %session_id, "Translation worker failed: {:#}", err)
                }
                Err(_) => {}
            }
            result
        });

        Self {
            session_id,
            task,
            cancel_on_drop: cancel.drop_guard(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Whether the worker task has already ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel the worker and wait up to `grace` for it to end.
    pub async fn shutdown(self, grace: Duration) -> WorkerExit {
        let WorkerHandle {
            session_id: _,
            mut task,
            cancel_on_drop,
        } = self;

        let finished_early = task.is_finished();
        drop(cancel_on_drop);

        match tokio::time::timeout(grace, &mut task).await {
            Ok(Ok(Ok(()))) if finished_early => WorkerExit::Completed,
            Ok(Ok(Ok(()))) => WorkerExit::Cancelled,
            Ok(Ok(Err(err))) => WorkerExit::Failed(format!("{:#}", err)),
            Ok(Err(join_err)) if join_err.is_cancelled() => WorkerExit::Cancelled,
            Ok(Err(join_err)) => WorkerExit::Panicked(panic_message(join_err.into_panic())),
            Err(_elapsed) => {
                task.abort();
                WorkerExit::Abandoned
            }
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    struct Scripted(Behaviour);

    enum Behaviour {
        WaitForCancel,
        ReturnImmediately,
        FailImmediately,
        FailOnCancel,
        PanicOnCancel,
        IgnoreCancel,
    }

    #[async_trait]
    impl TranslationPipeline for Scripted {
        async fn run(&self, _config: WorkerConfig, cancel: CancellationToken) -> anyhow::Result<()> {
            match self.0 {
                Behaviour::WaitForCancel => {
                    cancel.cancelled().await;
                    Ok(())
                }
                Behaviour::ReturnImmediately => Ok(()),
                Behaviour::FailImmediately => Err(anyhow::anyhow!("model unavailable")),
                Behaviour::FailOnCancel => {
                    cancel.cancelled().await;
                    Err(anyhow::anyhow!("flush failed"))
                }
                Behaviour::PanicOnCancel => {
                    cancel.cancelled().await;
                    panic!("pipeline exploded");
                }
                Behaviour::IgnoreCancel => {
                    std::future::pending::<()>().await;
                    Ok(())
                }
            }
        }
    }

    fn worker(behaviour: Behaviour) -> WorkerHandle {
        let config = WorkerConfig {
            session_id: "pc-test".to_string(),
            source_language: Language::EnUs,
            target_language: Language::FrFr,
            translation: AppConfig::default().translation,
        };
        WorkerHandle::spawn(&Handle::current(), Arc::new(Scripted(behaviour)), config)
    }

    const GRACE: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_cooperative_cancellation() {
        let handle = worker(Behaviour::WaitForCancel);
        assert_eq!(handle.session_id(), "pc-test");
        assert!(!handle.is_finished());
        assert_eq!(handle.shutdown(GRACE).await, WorkerExit::Cancelled);
    }

    #[tokio::test]
    async fn test_worker_that_already_finished() {
        let handle = worker(Behaviour::ReturnImmediately);
        tokio::task::yield_now().await;
        while !handle.is_finished() {
            tokio::task::yield_now().await;
        }
        assert_eq!(handle.shutdown(GRACE).await, WorkerExit::Completed);
    }

    #[tokio::test]
    async fn test_errors_are_reported_not_raised() {
        let handle = worker(Behaviour::FailOnCancel);
        assert_eq!(
            handle.shutdown(GRACE).await,
            WorkerExit::Failed("flush failed".to_string())
        );

        let handle = worker(Behaviour::FailImmediately);
        assert!(matches!(handle.shutdown(GRACE).await, WorkerExit::Failed(_)));
    }

    #[tokio::test]
    async fn test_panics_are_contained() {
        let handle = worker(Behaviour::PanicOnCancel);
        assert_eq!(
            handle.shutdown(GRACE).await,
            WorkerExit::Panicked("pipeline exploded".to_string())
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_worker_is_abandoned_after_grace_period() {
        let handle = worker(Behaviour::IgnoreCancel);
        assert_eq!(handle.shutdown(GRACE).await, WorkerExit::Abandoned);
    }

    #[tokio::test]
    async fn test_dropping_handle_cancels_worker() {
        let cancelled = CancellationToken::new();

        struct Observe(CancellationToken);

        #[async_trait]
        impl TranslationPipeline for Observe {
            async fn run(&self, _config: WorkerConfig, cancel: CancellationToken) -> anyhow::Result<()> {
                cancel.cancelled().await;
                self.0.cancel();
                Ok(())
            }
        }

        let config = WorkerConfig {
            session_id: "pc-drop".to_string(),
            source_language: Language::EnUs,
            target_language: Language::DeDe,
            translation: AppConfig::default().translation,
        };
        let handle = WorkerHandle::spawn(
            &Handle::current(),
            Arc::new(Observe(cancelled.clone())),
            config,
        );
        drop(handle);

        tokio::time::timeout(GRACE, cancelled.cancelled())
            .await
            .expect("worker should observe cancellation after its handle is dropped");
    }
}
