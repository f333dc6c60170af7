//! # Configuration Management
//!
//! This module loads the signaling server's configuration from multiple sources:
//! - TOML configuration files (config.toml)
//! - Environment variables (with APP_ prefix)
//! - Default values (built into the code)
//! - Command line flags (applied by `main` after loading)
//!
//! Everything is read once at startup. Nothing here is reconfigurable while the
//! server is running; the session registry and sweeper copy the values they need
//! when they are constructed.
//!
//! ## Configuration Priority (highest to lowest):
//! 1. Command line flags (`--host`, `--port`, `-v`)
//! 2. `HOST` / `PORT` environment variables (deployment platforms)
//! 3. Environment variables (APP_SERVER__HOST, APP_SESSIONS__IDLE_TIMEOUT_SECS, etc.)
//! 4. Configuration file (config.toml)
//! 5. Default values (defined in the Default impl)

use crate::worker::language::Language;
use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main application configuration that contains all settings.
///
/// ## Rust Concepts:
/// - **#[derive(...)]**: `Serialize` lets the `config` crate seed its defaults from
///   this struct, `Deserialize` turns the merged sources back into it
/// - **Nested structs**: each section maps to a `[table]` in config.toml
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub sessions: SessionsConfig,
    pub webrtc: WebRtcConfig,
    pub translation: TranslationConfig,
}

/// Where the HTTP signaling endpoint listens.
///
/// ## Common values:
/// - `host = "127.0.0.1"`: Only accept connections from localhost (development)
/// - `host = "0.0.0.0"`: Accept connections from any IP address (production)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Log verbosity used when `RUST_LOG` is not set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// One of `error`, `warn`, `info`, `debug`, `trace`
    pub level: String,
}

/// Session lifecycle tuning.
///
/// ## Fields:
/// - `sweep_interval_secs`: How often the idle sweeper runs
/// - `idle_timeout_secs`: Sessions older than this are evicted as stale
/// - `worker_grace_period_secs`: How long teardown waits for a cancelled worker
///   before aborting it
/// - `max_concurrent_sessions`: New sessions beyond this are refused
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    pub sweep_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub worker_grace_period_secs: u64,
    pub max_concurrent_sessions: usize,
}

impl SessionsConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn worker_grace_period(&self) -> Duration {
        Duration::from_secs(self.worker_grace_period_secs)
    }
}

/// Peer connection settings handed to every new connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebRtcConfig {
    /// STUN/TURN URLs, e.g. `stun:stun.l.google.com:19302`
    pub ice_servers: Vec<String>,
    /// How long an answer waits for local ICE candidate gathering
    pub ice_gathering_timeout_secs: u64,
}

impl WebRtcConfig {
    pub fn ice_gathering_timeout(&self) -> Duration {
        Duration::from_secs(self.ice_gathering_timeout_secs)
    }
}

/// Per-session translation worker settings.
///
/// ## Fields:
/// - `default_target_language` / `default_source_language`: used when the client
///   omits the `language` / `sourceLanguage` query parameters or sends an unknown code
/// - `stt_*`, `no_speech_prob`: speech recognition service settings
/// - `llm_*`, `temperature`, `max_tokens`: translation model settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranslationConfig {
    pub default_target_language: Language,
    pub default_source_language: Language,
    pub stt_model: String,
    pub stt_device: String,
    pub stt_compute_type: String,
    pub no_speech_prob: f32,
    pub llm_model: String,
    pub llm_base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 7860,
            },
            logging: LoggingConfig {
                level: "debug".to_string(),
            },
            sessions: SessionsConfig {
                sweep_interval_secs: 30,
                idle_timeout_secs: 300,     // 5 minutes
                worker_grace_period_secs: 10,
                max_concurrent_sessions: 32,
            },
            webrtc: WebRtcConfig {
                ice_servers: vec!["stun:stun.l.google.com:19302".to_string()],
                ice_gathering_timeout_secs: 5,
            },
            translation: TranslationConfig {
                default_target_language: Language::FrFr,
                default_source_language: Language::EnUs,
                stt_model: "large-v3-turbo".to_string(),
                stt_device: "cuda".to_string(),
                stt_compute_type: "float16".to_string(), // Reduce memory usage
                no_speech_prob: 0.3,
                llm_model: "gemma3n:e2b".to_string(),
                llm_base_url: "http://localhost:11434/v1".to_string(),
                temperature: 0.7,
                max_tokens: 1000,
            },
        }
    }
}

impl AppConfig {
    /// Load configuration from defaults, `config.toml` and the environment.
    ///
    /// ## Environment Variable Examples:
    /// - `APP_SERVER__PORT=3000`: Override server port
    /// - `APP_SESSIONS__IDLE_TIMEOUT_SECS=120`: Evict idle sessions after two minutes
    /// - `HOST=0.0.0.0` / `PORT=3000`: Special cases for deployment platforms
    ///
    /// Nested keys use a double underscore because field names already contain
    /// single underscores.
    pub fn load() -> Result<Self> {
        let mut settings = config::Config::builder()
            .add_source(config::Config::try_from(&AppConfig::default())?)
            .add_source(config::File::with_name("config").required(false))
            .add_source(
                config::Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("webrtc.ice_servers")
                    .try_parsing(true),
            );

        if let Ok(host) = env::var("HOST") {
            settings = settings.set_override("server.host", host)?;
        }

        if let Ok(port) = env::var("PORT") {
            settings = settings.set_override("server.port", port)?;
        }

        let config = settings.build()?.try_deserialize()?;
        Ok(config)
    }

    /// Reject values the server cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            bail!("Server port cannot be 0");
        }

        const LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];
        if !LEVELS.contains(&self.logging.level.to_ascii_lowercase().as_str()) {
            bail!("Unknown log level '{}'", self.logging.level);
        }

        let sessions = &self.sessions;
        if sessions.sweep_interval_secs == 0 {
            bail!("Sweep interval must be greater than 0");
        }
        if sessions.idle_timeout_secs == 0 {
            bail!("Idle timeout must be greater than 0");
        }
        if sessions.worker_grace_period_secs == 0 {
            bail!("Worker grace period must be greater than 0");
        }
        if sessions.max_concurrent_sessions == 0 {
            bail!("Max concurrent sessions must be greater than 0");
        }

        if self.webrtc.ice_servers.is_empty() {
            bail!("At least one ICE server must be configured");
        }
        if let Some(bad) = self
            .webrtc
            .ice_servers
            .iter()
            .find(|url| !(url.starts_with("stun:") || url.starts_with("turn:") || url.starts_with("turns:")))
        {
            bail!("ICE server '{}' must be a stun:, turn: or turns: URL", bad);
        }
        if self.webrtc.ice_gathering_timeout_secs == 0 {
            bail!("ICE gathering timeout must be greater than 0");
        }

        let translation = &self.translation;
        if !(0.0..=1.0).contains(&translation.no_speech_prob) {
            bail!("no_speech_prob must be between 0.0 and 1.0");
        }
        if !(0.0..=2.0).contains(&translation.temperature) {
            bail!("temperature must be between 0.0 and 2.0");
        }
        if translation.max_tokens == 0 {
            bail!("max_tokens must be greater than 0");
        }

        Ok(())
    }
}
