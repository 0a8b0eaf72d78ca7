use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::{Result, SettingsError};
use crate::types::{beacon_home, BeaconSettings};

/// Default settings file location.
pub fn settings_path() -> PathBuf {
    beacon_home().join("settings.json")
}

/// Load from the default path with env overrides applied.
pub fn load_settings() -> Result<BeaconSettings> {
    load_settings_from_path(&settings_path())
}

/// Load settings: defaults, then the file (if present) deep-merged, then env.
///
/// A missing file is not an error; an unreadable or invalid one is.
pub fn load_settings_from_path(path: &Path) -> Result<BeaconSettings> {
    let mut merged = serde_json::to_value(BeaconSettings::default())?;

    if path.exists() {
        let raw = std::fs::read_to_string(path).map_err(|source| SettingsError::Read {
            path: path.to_owned(),
            source,
        })?;
        let user: Value = serde_json::from_str(&raw).map_err(|source| SettingsError::Parse {
            path: path.to_owned(),
            source,
        })?;
        deep_merge(&mut merged, user);
        tracing::debug!(path = %path.display(), "merged user settings");
    }

    let mut settings: BeaconSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    Ok(settings)
}

/// Recursively merge `overlay` into `base`. Objects merge key by key;
/// every other value (arrays included) replaces wholesale.
pub fn deep_merge(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        let _ = base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `BEACON_*` overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(settings: &mut BeaconSettings, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(host) = lookup("BEACON_HOST") {
        settings.server.host = host;
    }
    if let Some(port) = lookup("BEACON_PORT") {
        match port.parse() {
            Ok(p) => settings.server.port = p,
            Err(_) => tracing::warn!(value = %port, "ignoring invalid BEACON_PORT"),
        }
    }
    if let Some(secret) = lookup("BEACON_SECRET") {
        settings.auth.secret = secret;
    }
    if let Some(legacy) = lookup("BEACON_LEGACY_SECRETS") {
        settings.auth.legacy_secrets = legacy
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();
    }
    if let Some(url) = lookup("BEACON_URL") {
        settings.client.url = url;
    }
    if let Some(level) = lookup("BEACON_LOG_LEVEL") {
        settings.logging.level = level;
    }
    if let Some(path) = lookup("BEACON_DB_PATH") {
        settings.storage.db_path = PathBuf::from(path);
    }
}
