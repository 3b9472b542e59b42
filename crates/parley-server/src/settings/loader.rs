use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{debug, warn};

use super::{Settings, SettingsError};

/// `~/.parley/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".parley").join("settings.json")
}

pub fn load_settings() -> Result<Settings, SettingsError> {
    load_settings_from_path(&settings_path())
}

/// Defaults, merged with `path` when it exists, then environment overrides.
/// A file that exists but does not parse is an error.
pub fn load_settings_from_path(path: &Path) -> Result<Settings, SettingsError> {
    let defaults = serde_json::to_value(Settings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: Settings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Objects merge per key, recursively. Anything else in `source` replaces
/// `target`. Nulls in `source` are skipped.
pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut Settings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Apply `PARLEY_*` overrides read through `lookup`. Values that are empty,
/// unparseable or out of range are ignored with a warning.
pub fn apply_overrides_from(settings: &mut Settings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |name: &str| lookup(name).filter(|v| !v.is_empty());
    let invalid = |name: &str, value: &str| warn!(key = name, value, "invalid env override, ignoring");

    if let Some(v) = read("PARLEY_PORT") {
        match parse_u16_range(&v, 1, 65535) {
            Some(port) => settings.server.port = port,
            None => invalid("PARLEY_PORT", &v),
        }
    }
    if let Some(v) = read("PARLEY_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read("PARLEY_CHARACTERS_DIR") {
        settings.characters.default_directory = PathBuf::from(v);
    }
    if let Some(v) = read("PARLEY_LLM_BASE_URL") {
        settings.llm.base_url = v;
    }
    if let Some(v) = read("PARLEY_LLM_MODEL") {
        settings.llm.model = v;
    }
    if let Some(v) = read("PARLEY_LLM_API_KEY") {
        settings.llm.api_key = Some(v);
    }
    if let Some(v) = read("PARLEY_TOOL_TIMEOUT_MS") {
        match parse_u64_range(&v, 1, 60_000) {
            Some(ms) => settings.tools.timeout_ms = ms,
            None => invalid("PARLEY_TOOL_TIMEOUT_MS", &v),
        }
    }
    if let Some(v) = read("PARLEY_MAX_MESSAGES") {
        match parse_usize_range(&v, 2, 100_000) {
            Some(n) => settings.conversation.max_messages_per_character = n,
            None => invalid("PARLEY_MAX_MESSAGES", &v),
        }
    }
    if let Some(v) = read("PARLEY_LOG_LEVEL") {
        settings.logging.level = v;
    }
}

pub fn parse_u16_range(val: &str, min: u16, max: u16) -> Option<u16> {
    let n: u16 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}

pub fn parse_usize_range(val: &str, min: usize, max: usize) -> Option<usize> {
    let n: usize = val.parse().ok()?;
    (n >= min && n <= max).then_some(n)
}
