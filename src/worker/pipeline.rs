//! Default translation pipeline.
//!
//! Builds the per-session speech recognition and language model settings plus the
//! translator conversation context, then stays alive until the session is torn down.
//! Media frames are delivered to the speech services by the transport layer, which
//! is outside this crate.

use super::prompts::{self, LlmSettings, SttSettings};
use super::{TranslationPipeline, WorkerConfig};
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A single entry in the translator's conversation context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatMessage {
    pub role: &'static str,
    pub content: String,
}

/// Everything the idiom translator needs for one client.
#[derive(Debug, Clone)]
pub struct TranslatorSession {
    pub stt: SttSettings,
    pub llm: LlmSettings,
    pub messages: Vec<ChatMessage>,
}

impl TranslatorSession {
    pub fn new(config: &WorkerConfig) -> Self {
        Self {
            stt: prompts::stt_settings(&config.translation, config.source_language),
            llm: prompts::llm_settings(&config.translation),
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: prompts::system_message(config.target_language),
                },
                ChatMessage {
                    role: "system",
                    content: prompts::welcome_message(config.target_language),
                },
            ],
        }
    }
}

/// The production pipeline: one idiom translator per client.
#[derive(Debug, Default, Clone)]
pub struct IdiomTranslator;

#[async_trait]
impl TranslationPipeline for IdiomTranslator {
    async fn run(&self, config: WorkerConfig, cancel: CancellationToken) -> anyhow::Result<()> {
        let session = TranslatorSession::new(&config);

        info!(
            session_id = %config.session_id,
            language = %config.source_language,
            model = %session.stt.model,
            device = %session.stt.device,
            "Creating STT service"
        );
        info!(
            session_id = %config.session_id,
            model = %session.llm.model,
            base_url = %session.llm.base_url,
            "Creating LLM service"
        );
        debug!(
            session_id = %config.session_id,
            messages = session.messages.len(),
            "Translator context ready ({} <- {})",
            config.target_language,
            config.source_language
        );

        cancel.cancelled().await;

        info!(session_id = %config.session_id, "Translator stopped");
        Ok(())
    }
}
