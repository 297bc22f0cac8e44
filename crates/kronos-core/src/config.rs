//! Worker configuration.
//!
//! Configuration is read from `~/.config/kronos/config.json` (every field has
//! a default, so the file is optional) and then overridden by environment
//! variables. The host binary loads a `.env` file before calling
//! [`WorkerConfig::load`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::error::WorkerError;

/// Application name used for the config directory path
const APP_NAME: &str = "kronos";

/// Config file name
const CONFIG_FILE: &str = "config.json";

/// Icon shown (and used as badge) on every notification.
pub const DEFAULT_ICON_URL: &str = "https://i.imgur.com/j7zxM6Z.png";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not find config directory")]
    NoConfigDir,

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Origin the worker is registered for. Only requests to this origin
    /// are intercepted.
    pub origin: String,
    /// Identifier of the cache version this build owns.
    pub cache_version: String,
    /// Assets that must be cached before the worker may serve traffic.
    pub precache: Vec<String>,
    /// Take over from the previous version as soon as installed.
    pub skip_waiting: bool,
    pub notifications: NotificationConfig,
    pub provider: ProviderConfig,
    pub vision: VisionConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            origin: "http://localhost:3000".to_string(),
            cache_version: "kronos-v1".to_string(),
            precache: vec![
                "/login.html".to_string(),
                "/app.html".to_string(),
                "/manifest.json".to_string(),
            ],
            skip_waiting: true,
            notifications: NotificationConfig::default(),
            provider: ProviderConfig::default(),
            vision: VisionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    pub icon_url: String,
    pub vibrate: Vec<u32>,
    /// Title used when a push payload carries none.
    pub default_title: String,
    /// Tag used when a push payload carries none.
    pub default_tag: String,
    /// Where a click lands when the notification has no URL.
    pub app_url: String,
    /// Substring identifying an already-open app window.
    pub app_window_match: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            icon_url: DEFAULT_ICON_URL.to_string(),
            vibrate: vec![200, 100, 200],
            default_title: "Kronos".to_string(),
            default_tag: "kronos".to_string(),
            app_url: "/app.html".to_string(),
            app_window_match: "app.html".to_string(),
        }
    }
}

/// Managed auth/database provider (PostgREST + GoTrue style REST API).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub url: Option<String>,
    /// Public (anon) key. Never a service-role key.
    #[serde(skip_serializing)]
    pub anon_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub api_url: String,
    pub api_version: String,
    pub model: String,
    pub max_tokens: u32,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.anthropic.com/v1/messages".to_string(),
            api_version: "2023-06-01".to_string(),
            model: "claude-opus-4-6".to_string(),
            max_tokens: 4096,
            api_key: None,
        }
    }
}

impl WorkerConfig {
    /// Load the config file if present, then apply environment overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::config_path()?;
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
                path: path.clone(),
                source,
            })?
        } else {
            Self::default()
        };
        config.apply_env_from(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn config_path() -> Result<PathBuf, ConfigError> {
        let config_dir = dirs::config_dir().ok_or(ConfigError::NoConfigDir)?;
        Ok(config_dir.join(APP_NAME).join(CONFIG_FILE))
    }

    /// Apply overrides from an environment-like lookup.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(origin) = lookup("KRONOS_ORIGIN") {
            self.origin = origin;
        }
        if let Some(version) = lookup("KRONOS_CACHE_VERSION") {
            self.cache_version = version;
        }
        if let Some(url) = lookup("SUPABASE_URL") {
            self.provider.url = Some(url);
        }
        if let Some(key) = lookup("SUPABASE_ANON_KEY") {
            self.provider.anon_key = Some(key);
        }
        if let Some(key) = lookup("ANTHROPIC_API_KEY") {
            self.vision.api_key = Some(key);
        }
        if let Some(model) = lookup("KRONOS_VISION_MODEL") {
            self.vision.model = model;
        }
    }

    pub fn origin_url(&self) -> Result<Url, WorkerError> {
        Url::parse(&self.origin)
            .map_err(|e| WorkerError::Validation(format!("invalid origin {}: {}", self.origin, e)))
    }
}
