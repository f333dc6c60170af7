//! Locale codes accepted for the `language` / `sourceLanguage` query parameters.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Languages the translation worker can listen in and speak.
///
/// Serialized as upper-case locale codes (`EN_US`, `FR_FR`, ...), which is also the
/// form clients send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Language {
    EnUs,
    FrFr,
    PtBr,
    EsEs,
    DeDe,
    ItIt,
    JaJp,
    ZhCn,
}

impl Language {
    pub const ALL: [Language; 8] = [
        Language::EnUs,
        Language::FrFr,
        Language::PtBr,
        Language::EsEs,
        Language::DeDe,
        Language::ItIt,
        Language::JaJp,
        Language::ZhCn,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            Language::EnUs => "EN_US",
            Language::FrFr => "FR_FR",
            Language::PtBr => "PT_BR",
            Language::EsEs => "ES_ES",
            Language::DeDe => "DE_DE",
            Language::ItIt => "IT_IT",
            Language::JaJp => "JA_JP",
            Language::ZhCn => "ZH_CN",
        }
    }

    /// Human readable name, used in the translator prompts.
    pub fn display_name(&self) -> &'static str {
        match self {
            Language::EnUs => "English (United States)",
            Language::FrFr => "French (France)",
            Language::PtBr => "Portuguese (Brazil)",
            Language::EsEs => "Spanish (Spain)",
            Language::DeDe => "German (Germany)",
            Language::ItIt => "Italian (Italy)",
            Language::JaJp => "Japanese (Japan)",
            Language::ZhCn => "Chinese (Simplified)",
        }
    }

    /// ISO 639-1 part of the code, which is what speech recognition models expect.
    pub fn iso_639_1(&self) -> String {
        self.code()[..2].to_ascii_lowercase()
    }

    /// Parse an optional client-supplied code, falling back to `default` when the
    /// value is missing or not a supported language.
    pub fn parse_or(value: Option<&str>, default: Language) -> Language {
        value
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(default)
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Returned when a locale code is not one of [`Language::ALL`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported language code '{0}'")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    /// Accepts `FR_FR`, `fr_fr` and `fr-FR`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().replace('-', "_").to_ascii_uppercase();
        Language::ALL
            .into_iter()
            .find(|language| language.code() == normalized)
            .ok_or_else(|| UnknownLanguage(s.to_string()))
    }
}
