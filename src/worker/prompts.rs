//! Per-session service settings and translator prompts.
//!
//! Every client gets its own speech recognition and language model settings so
//! two sessions with different language pairs never share state.

use crate::config::TranslationConfig;
use crate::worker::language::Language;
use serde::Serialize;

/// Speech recognition service settings for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SttSettings {
    pub model: String,
    pub device: String,
    pub compute_type: String,
    /// Segments with a higher no-speech probability are dropped
    pub no_speech_prob: f32,
    /// ISO 639-1 code of the language the client speaks
    pub language: String,
}

/// Language model settings for one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LlmSettings {
    pub model: String,
    pub base_url: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

pub fn stt_settings(config: &TranslationConfig, source: Language) -> SttSettings {
    SttSettings {
        model: config.stt_model.clone(),
        device: config.stt_device.clone(),
        compute_type: config.stt_compute_type.clone(),
        no_speech_prob: config.no_speech_prob,
        language: source.iso_639_1(),
    }
}

pub fn llm_settings(config: &TranslationConfig) -> LlmSettings {
    LlmSettings {
        model: config.llm_model.clone(),
        base_url: config.llm_base_url.clone(),
        temperature: config.temperature,
        max_tokens: config.max_tokens,
    }
}

/// System instruction for the idiom translator.
pub fn system_message(target: Language) -> String {
    format!(
        "You're an expert Idiom Interpreter & Translator. Your job is to translate idioms and \
         figurative expressions into {}, preserving their cultural and emotional meaning. \
         Always give the translation directly, without extra explanation or commentary.",
        target.display_name()
    )
}

/// First thing the bot says once the client is connected.
pub fn welcome_message(target: Language) -> String {
    format!(
        "Say in {}: Hello! I'm an AI, Idiom Interpreter & Translator, a new version of AI that \
         can help you precisely interpret idiomatic expressions and translate them into another \
         specified language, while preserving cultural, emotional, and contextual meaning.",
        target.display_name()
    )
}
