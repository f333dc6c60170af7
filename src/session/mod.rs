//! # Session Lifecycle
//!
//! A session pairs one peer connection with one translation worker under the
//! connection's `pc_id`. The [`SessionRegistry`] owns every live session and is the
//! only place a session can be torn down.
//!
//! ## Teardown triggers:
//! 1. **Connection notifications**: the connection reports `closed` or `failed`
//! 2. **Idle sweeper**: the session is older than the idle timeout, or its
//!    connection reports a terminal transport state
//! 3. **Shutdown**: the process is stopping
//!
//! All three call [`SessionRegistry::remove`]. Whichever claims the entry first does
//! the teardown work; the others find an empty slot and return.

pub(crate) mod registry;
mod sweeper;

pub use registry::SessionRegistry;

use crate::config::SessionsConfig;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Why a session was removed. Recorded in the teardown log lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalReason {
    /// The connection reported it was closed
    Closed,
    /// The connection reported a transport failure
    Failed,
    /// The idle sweeper evicted it
    Stale,
    /// The process is shutting down
    Shutdown,
    /// Requested directly by application code
    Manual,
}

impl RemovalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemovalReason::Closed => "closed",
            RemovalReason::Failed => "failed",
            RemovalReason::Stale => "stale",
            RemovalReason::Shutdown => "shutdown",
            RemovalReason::Manual => "manual",
        }
    }
}

impl fmt::Display for RemovalReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registration failures. These are the only registry errors that reach callers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("session '{0}' is already registered")]
    DuplicateSession(String),
    #[error("session limit of {limit} reached")]
    AtCapacity { limit: usize },
    #[error("session registry is shutting down")]
    ShuttingDown,
}

/// Point-in-time view of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatus {
    pub active_connections: usize,
    /// Sorted ascending
    pub connection_ids: Vec<String>,
    /// Workers still running
    pub worker_count: usize,
}

/// Timing and capacity limits for a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryConfig {
    pub sweep_interval: Duration,
    pub idle_timeout: Duration,
    pub worker_grace_period: Duration,
    pub max_sessions: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            worker_grace_period: Duration::from_secs(10),
            max_sessions: 32,
        }
    }
}

impl From<&SessionsConfig> for RegistryConfig {
    fn from(config: &SessionsConfig) -> Self {
        Self {
            sweep_interval: config.sweep_interval(),
            idle_timeout: config.idle_timeout(),
            worker_grace_period: config.worker_grace_period(),
            max_sessions: config.max_concurrent_sessions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_registry_config_from_app_config() {
        let config = RegistryConfig::from(&AppConfig::default().sessions);
        assert_eq!(config, RegistryConfig::default());
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = RegistryStatus {
            active_connections: 1,
            connection_ids: vec!["B".to_string()],
            worker_count: 1,
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["activeConnections"], 1);
        assert_eq!(json["connectionIds"][0], "B");
        assert_eq!(json["workerCount"], 1);
    }

    #[test]
    fn test_reason_strings() {
        assert_eq!(RemovalReason::Stale.to_string(), "stale");
        assert_eq!(RemovalReason::Failed.as_str(), "failed");
    }
}
