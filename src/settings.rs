//! Layered settings for the `ledger` binary.
//!
//! 1. Compiled defaults ([`LedgerSettings::default`])
//! 2. `~/.ledger/settings.json` or `--config`, deep-merged over the defaults
//! 3. `LEDGER_*` environment variables
//!
//! Command-line flags are applied by the caller on top of the result.

use std::path::{Path, PathBuf};

use ledger_store::StoreConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("failed to read settings file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse settings JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings value: {0}")]
    InvalidValue(String),
}

pub type Result<T> = std::result::Result<T, SettingsError>;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LedgerSettings {
    pub database: StoreConfig,
    pub logging: LoggingSettings,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// One of `trace`, `debug`, `info`, `warn`, `error`.
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

impl LoggingSettings {
    pub fn tracing_level(&self) -> Result<tracing::Level> {
        self.level
            .parse()
            .map_err(|_| SettingsError::InvalidValue(format!("log level {:?}", self.level)))
    }
}

/// `~/.ledger/settings.json`.
pub fn settings_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
    PathBuf::from(home).join(".ledger").join("settings.json")
}

/// Load settings from `path` (defaults when it does not exist) and apply
/// environment overrides.
pub fn load_settings_from_path(path: &Path) -> Result<LedgerSettings> {
    let mut settings = read_file(path)?;
    apply_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

fn read_file(path: &Path) -> Result<LedgerSettings> {
    let defaults = serde_json::to_value(LedgerSettings::default())?;
    let merged = if path.exists() {
        debug!(?path, "loading settings from file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };
    Ok(serde_json::from_value(merged)?)
}

/// Objects merge per key; arrays and scalars from `source` replace `target`;
/// nulls in `source` are skipped.
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
                let _ = target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

/// Apply `LEDGER_*` overrides read through `lookup`. Unparseable values are
/// logged and ignored.
pub fn apply_overrides(settings: &mut LedgerSettings, lookup: impl Fn(&str) -> Option<String>) {
    let read = |key: &str| lookup(key).filter(|v| !v.is_empty());

    if let Some(v) = read("LEDGER_DATABASE_PATH") {
        settings.database.path = Some(PathBuf::from(v));
    }
    if let Some(v) = read("LEDGER_MAX_CONNECTIONS") {
        match parse_u32_range(&v, 1, 1024) {
            Some(n) => settings.database.max_connections = n,
            None => warn!(key = "LEDGER_MAX_CONNECTIONS", value = %v, "invalid env var, ignoring"),
        }
    }
    if let Some(v) = read("LEDGER_LOG_LEVEL") {
        settings.logging.level = v.to_lowercase();
    }
    if let Some(v) = read("LEDGER_LOG_JSON") {
        match parse_bool(&v) {
            Some(b) => settings.logging.json = b,
            None => warn!(key = "LEDGER_LOG_JSON", value = %v, "invalid env var, ignoring"),
        }
    }
}

/// Accepts `true`/`1`/`yes`/`on` and `false`/`0`/`no`/`off`, any case.
pub fn parse_bool(val: &str) -> Option<bool> {
    match val.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

pub fn parse_u32_range(val: &str, min: u32, max: u32) -> Option<u32> {
    let n: u32 = val.parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}
