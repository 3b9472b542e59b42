//! Server settings.
//!
//! Loaded in three layers, later ones winning:
//! 1. compiled defaults ([`Settings::default()`]);
//! 2. `~/.parley/settings.json`, or the file given with `--config`, deep-merged over the defaults;
//! 3. `PARLEY_*` environment variables.

mod loader;

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use loader::{
    apply_env_overrides, apply_overrides_from, deep_merge, load_settings, load_settings_from_path,
    parse_u16_range, parse_u64_range, parse_usize_range, settings_path,
};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl SettingsError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    pub server: ServerSettings,
    pub characters: CharacterSettings,
    pub conversation: ConversationSettings,
    pub tools: ToolSettings,
    pub llm: LlmSettings,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
    /// Outbound events buffered per connection before the session blocks.
    pub max_send_queue: usize,
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8088,
            max_send_queue: 256,
            heartbeat_interval_secs: 30,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CharacterSettings {
    pub default_directory: PathBuf,
    /// Character activated when a session opens. The first loaded character when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_character: Option<String>,
}

impl Default for CharacterSettings {
    fn default() -> Self {
        Self {
            default_directory: PathBuf::from("characters"),
            default_character: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationSettings {
    pub max_messages_per_character: usize,
}

impl Default for ConversationSettings {
    fn default() -> Self {
        Self {
            max_messages_per_character: parley_engine::history::DEFAULT_MAX_MESSAGES,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ToolSettings {
    pub timeout_ms: u64,
    /// Fraction of the deadline after which a successful call is logged as slow.
    pub slow_warning_ratio: f64,
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            timeout_ms: 100,
            slow_warning_ratio: 0.8,
        }
    }
}

impl ToolSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LlmSettings {
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/v1".to_string(),
            model: "mistralai/Mistral-Small-3.2-24B-Instruct-2506".to_string(),
            api_key: None,
            temperature: Some(0.7),
            max_tokens: None,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = Settings::default();
        assert_eq!(settings.server.port, 8088);
        assert_eq!(settings.conversation.max_messages_per_character, 100);
        assert_eq!(settings.tools.timeout(), Duration::from_millis(100));
        assert!(settings.llm.api_key.is_none());
        assert!(settings.characters.default_character.is_none());
    }

    #[test]
    fn serializes_camel_case() {
        let value = serde_json::to_value(Settings::default()).unwrap();
        assert_eq!(value["server"]["maxSendQueue"], 256);
        assert_eq!(value["conversation"]["maxMessagesPerCharacter"], 100);
        assert!(value["llm"].get("apiKey").is_none());
    }
}
