//! # Application State Management
//!
//! Shared state handed to every HTTP handler through `web::Data<AppState>`.
//!
//! ## What lives here:
//! - **config**: read-only after startup, so a plain `Arc<AppConfig>`
//! - **registry**: the [`SessionRegistry`], itself a cheap cloneable handle
//! - **connections / pipeline**: trait objects, so tests can swap in doubles
//! - **metrics**: request and session counters behind `Arc<RwLock<_>>`
//!
//! ## Arc<RwLock<T>> Pattern
//! - **Arc**: every actix worker thread holds a clone of `AppState`
//! - **RwLock**: many concurrent readers (the metrics endpoint) or one writer
//!   (the middleware recording a request)
//! - A poisoned lock only means a handler panicked mid-update of a counter, so
//!   the guard is recovered instead of propagating the panic

use crate::config::AppConfig;
use crate::connection::ConnectionFactory;
use crate::session::SessionRegistry;
use crate::worker::TranslationPipeline;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub registry: SessionRegistry,
    /// Builds a peer connection from a client's first offer
    pub connections: Arc<dyn ConnectionFactory>,
    /// Per-session translation pipeline
    pub pipeline: Arc<dyn TranslationPipeline>,
    pub metrics: Arc<RwLock<AppMetrics>>,
    pub start_time: Instant,
}

/// Counters collected since the server started.
#[derive(Debug, Default, Clone)]
pub struct AppMetrics {
    /// Total number of HTTP requests processed
    pub request_count: u64,

    /// Requests that ended with a 4xx/5xx status
    pub error_count: u64,

    /// Sessions successfully registered
    pub sessions_created: u64,

    /// Offers applied to an existing session
    pub renegotiations: u64,

    /// Offers that did not produce a session (bad SDP, capacity, shutdown)
    pub offer_failures: u64,

    /// Key: route pattern (e.g., "POST /api/offer")
    pub endpoint_metrics: HashMap<String, EndpointMetric>,
}

#[derive(Debug, Default, Clone)]
pub struct EndpointMetric {
    pub request_count: u64,
    pub total_duration_ms: u64,
    pub error_count: u64,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        registry: SessionRegistry,
        connections: Arc<dyn ConnectionFactory>,
        pipeline: Arc<dyn TranslationPipeline>,
    ) -> Self {
        Self {
            config: Arc::new(config),
            registry,
            connections,
            pipeline,
            metrics: Arc::new(RwLock::new(AppMetrics::default())),
            start_time: Instant::now(),
        }
    }

    fn metrics_mut(&self) -> RwLockWriteGuard<'_, AppMetrics> {
        self.metrics.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn metrics(&self) -> RwLockReadGuard<'_, AppMetrics> {
        self.metrics.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one finished request (called by the metrics middleware).
    ///
    /// ## Parameters:
    /// - **endpoint**: method plus route pattern, so `/api/sessions/{pc_id}` is one bucket
    /// - **duration_ms**: time spent in the handler chain
    /// - **is_error**: whether the response status was 4xx/5xx
    pub fn record_request(&self, endpoint: &str, duration_ms: u64, is_error: bool) {
        let mut metrics = self.metrics_mut();
        metrics.request_count += 1;
        if is_error {
            metrics.error_count += 1;
        }

        let endpoint_metric = metrics.endpoint_metrics.entry(endpoint.to_string()).or_default();
        endpoint_metric.request_count += 1;
        endpoint_metric.total_duration_ms += duration_ms;
        if is_error {
            endpoint_metric.error_count += 1;
        }
    }

    pub fn record_session_created(&self) {
        self.metrics_mut().sessions_created += 1;
    }

    pub fn record_renegotiation(&self) {
        self.metrics_mut().renegotiations += 1;
    }

    pub fn record_offer_failure(&self) {
        self.metrics_mut().offer_failures += 1;
    }

    /// Copy of the counters, so no lock is held while a response is serialized.
    pub fn get_metrics_snapshot(&self) -> AppMetrics {
        self.metrics().clone()
    }

    pub fn get_uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl AppMetrics {
    /// Fraction of requests that failed (0.0 to 1.0).
    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}

impl EndpointMetric {
    pub fn average_duration_ms(&self) -> f64 {
        if self.request_count > 0 {
            self.total_duration_ms as f64 / self.request_count as f64
        } else {
            0.0
        }
    }

    pub fn error_rate(&self) -> f64 {
        if self.request_count > 0 {
            self.error_count as f64 / self.request_count as f64
        } else {
            0.0
        }
    }
}
