//! Operator settings and their resolution.
//!
//! Settings live in two tiers: a `global` table shared by every backend and a
//! `providers.<name>` table per backend. A value is resolved by looking at the
//! backend table first, then the global table, then a caller-supplied default.
//!
//! # Loading
//!
//! ```toml
//! [global]
//! username_is_full_email = false
//!
//! [providers.oidc]
//! oidc_endpoint = "https://idp.example"
//! key = "client1"
//! secret = "s3cr3t"
//! jwt_leeway = "2s"
//! ```
//!
//! Environment variables override the file, e.g.
//! `SOCIAL_AUTH__PROVIDERS__OIDC__KEY=client1`.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::AuthError;
use crate::AuthResult;

/// A flat table of settings with lower-case keys.
pub type SettingsMap = serde_json::Map<String, Value>;

/// Environment variable prefix for settings overrides.
pub const ENV_PREFIX: &str = "SOCIAL_AUTH";

/// Resolves a setting through the backend → global tiers.
///
/// Names are matched case-insensitively and `null` values count as unset.
pub fn resolve_setting<'a>(
    name: &str,
    backend: Option<&'a SettingsMap>,
    global: &'a SettingsMap,
) -> Option<&'a Value> {
    let key = name.to_ascii_lowercase();
    backend
        .and_then(|b| b.get(&key))
        .filter(|v| !v.is_null())
        .or_else(|| global.get(&key).filter(|v| !v.is_null()))
}

/// Resolves a setting and falls back to `default` when neither tier has it.
pub fn resolve_setting_or<'a>(
    name: &str,
    backend: Option<&'a SettingsMap>,
    global: &'a SettingsMap,
    default: &'a SettingsMap,
) -> Option<&'a Value> {
    resolve_setting(name, backend, global)
        .or_else(|| default.get(&name.to_ascii_lowercase()).filter(|v| !v.is_null()))
}

/// Operator configuration for every backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Settings shared by all backends.
    pub global: SettingsMap,
    /// Per-backend overrides keyed by backend name.
    pub providers: HashMap<String, SettingsMap>,
}

impl Settings {
    /// Creates empty settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads settings from an optional TOML file plus `SOCIAL_AUTH__*` variables.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the sources cannot be read or merged.
    pub fn load(path: Option<&Path>) -> AuthResult<Self> {
        let mut builder = Config::builder();
        if let Some(p) = path
            && p.exists()
        {
            builder = builder.add_source(File::from(p.to_path_buf()));
        }
        builder = builder.add_source(
            Environment::with_prefix(ENV_PREFIX)
                .try_parsing(true)
                .separator("__"),
        );

        let cfg = builder
            .build()
            .map_err(|e| AuthError::configuration(format!("settings build error: {e}")))?;
        let settings: Settings = cfg
            .try_deserialize()
            .map_err(|e| AuthError::configuration(format!("settings deserialize error: {e}")))?;

        Ok(settings.normalized())
    }

    /// Parses settings from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the document is not valid TOML.
    pub fn from_toml(source: &str) -> AuthResult<Self> {
        let cfg = Config::builder()
            .add_source(File::from_str(source, config::FileFormat::Toml))
            .build()
            .map_err(|e| AuthError::configuration(format!("settings build error: {e}")))?;
        let settings: Settings = cfg
            .try_deserialize()
            .map_err(|e| AuthError::configuration(format!("settings deserialize error: {e}")))?;
        Ok(settings.normalized())
    }

    /// Sets a global value.
    #[must_use]
    pub fn with_global(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.global.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Sets a value for a single backend.
    #[must_use]
    pub fn with_provider(mut self, backend: &str, name: &str, value: impl Into<Value>) -> Self {
        self.providers
            .entry(backend.to_ascii_lowercase())
            .or_default()
            .insert(name.to_ascii_lowercase(), value.into());
        self
    }

    /// Returns a view that resolves settings for `backend`.
    #[must_use]
    pub fn for_backend<'a>(&'a self, backend: &str) -> BackendSettings<'a> {
        BackendSettings {
            overrides: self.providers.get(&backend.to_ascii_lowercase()),
            global: &self.global,
        }
    }

    fn normalized(self) -> Self {
        let lower = |map: SettingsMap| -> SettingsMap {
            map.into_iter()
                .map(|(k, v)| (k.to_ascii_lowercase(), v))
                .collect()
        };
        Self {
            global: lower(self.global),
            providers: self
                .providers
                .into_iter()
                .map(|(name, map)| (name.to_ascii_lowercase(), lower(map)))
                .collect(),
        }
    }
}

/// Settings as seen by one backend.
#[derive(Debug, Clone, Copy)]
pub struct BackendSettings<'a> {
    overrides: Option<&'a SettingsMap>,
    global: &'a SettingsMap,
}

impl<'a> BackendSettings<'a> {
    /// Returns the raw value for `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&'a Value> {
        resolve_setting(name, self.overrides, self.global)
    }

    /// Returns a string setting.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&'a str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Returns a boolean setting, or `default` if unset or not a boolean.
    #[must_use]
    pub fn get_bool(&self, name: &str, default: bool) -> bool {
        self.get(name).and_then(Value::as_bool).unwrap_or(default)
    }

    /// Deserializes a setting, falling back to `default` when unset.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the stored value has the wrong shape.
    pub fn get_or<T: DeserializeOwned>(&self, name: &str, default: T) -> AuthResult<T> {
        match self.get(name) {
            Some(value) => serde_json::from_value(value.clone()).map_err(|e| {
                AuthError::configuration(format!("invalid value for setting {name}: {e}"))
            }),
            None => Ok(default),
        }
    }

    /// Merges backend defaults, global values and overrides into one table.
    #[must_use]
    pub fn merged(&self, defaults: &SettingsMap) -> SettingsMap {
        let mut names: Vec<&String> = defaults.keys().chain(self.global.keys()).collect();
        if let Some(overrides) = self.overrides {
            names.extend(overrides.keys());
        }

        let mut merged = SettingsMap::new();
        for name in names {
            if let Some(value) = resolve_setting_or(name, self.overrides, self.global, defaults) {
                merged.insert(name.clone(), value.clone());
            }
        }
        merged
    }
}

/// Deserializes a duration written either as seconds (`1.5`) or as a
/// human-readable string (`"10m"`).
pub(crate) fn flexible_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Seconds(f64),
        Text(#[serde(with = "humantime_serde")] Duration),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Seconds(secs) if secs.is_finite() && secs >= 0.0 => Ok(Duration::from_secs_f64(secs)),
        Raw::Seconds(secs) => Err(serde::de::Error::custom(format!(
            "duration must be a non-negative number of seconds, got {secs}"
        ))),
        Raw::Text(d) => Ok(d),
    }
}

/// Deserializes an optional string that may have been written as a number
/// or boolean, as environment values are parsed before typing.
pub(crate) fn flexible_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s)),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(serde::de::Error::custom(format!(
            "expected a string, got {other}"
        ))),
    }
}
