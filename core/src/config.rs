//! Anchor session configuration loading
//!
//! Loads configuration from `~/.config/anchorsync/anchorsync.toml` (or the
//! `ANCHORSYNC_CONFIG` env var). Every key is optional.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::errors::{Result, SessionError};
use crate::types::ExpirationPolicy;

/// Root configuration for an anchor session
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AnchorSyncConfig {
    /// Localization map requested at startup
    #[serde(default = "default_map_id")]
    pub map_id: String,

    /// Radius of the region queried around the query center
    #[serde(default = "default_query_radius_m")]
    pub query_radius_m: f32,

    /// Interval between publish-pipeline ticks
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Lifetime of published anchors; 0 keeps them forever
    #[serde(default)]
    pub expiration_secs: u64,

    /// Promote local anchors into the publish pipeline as soon as one is created
    #[serde(default = "default_true")]
    pub auto_publish_on_create: bool,

    /// Re-arm an anchor for submission when its publish completion fails
    #[serde(default = "default_true")]
    pub retry_failed_publish: bool,

    /// Query stored anchors once the session starts
    #[serde(default = "default_true")]
    pub query_on_start: bool,

    /// How long to wait for the platform subsystems to come up
    #[serde(default = "default_init_timeout_ms")]
    pub init_timeout_ms: u64,

    /// Buffered anchor notifications per subscriber
    #[serde(default = "default_notification_capacity")]
    pub notification_capacity: usize,
}

fn default_map_id() -> String {
    "1195c3c3-fbc7-7018-9754-68f7fd5c4aed".to_string()
}

fn default_query_radius_m() -> f32 {
    10.0
}

fn default_tick_interval_ms() -> u64 {
    100
}

fn default_true() -> bool {
    true
}

fn default_init_timeout_ms() -> u64 {
    5_000
}

fn default_notification_capacity() -> usize {
    64
}

impl Default for AnchorSyncConfig {
    fn default() -> Self {
        Self {
            map_id: default_map_id(),
            query_radius_m: default_query_radius_m(),
            tick_interval_ms: default_tick_interval_ms(),
            expiration_secs: 0,
            auto_publish_on_create: true,
            retry_failed_publish: true,
            query_on_start: true,
            init_timeout_ms: default_init_timeout_ms(),
            notification_capacity: default_notification_capacity(),
        }
    }
}

impl AnchorSyncConfig {
    /// Environment variable overriding the config path
    pub const ENV_CONFIG_PATH: &'static str = "ANCHORSYNC_CONFIG";

    /// Default config filename
    pub const DEFAULT_CONFIG_FILENAME: &'static str = "anchorsync.toml";

    /// Load configuration from file
    ///
    /// Resolution order:
    /// 1. `ANCHORSYNC_CONFIG` environment variable
    /// 2. `~/.config/anchorsync/anchorsync.toml`
    ///
    /// If the config file doesn't exist, returns default configuration.
    pub fn load() -> Result<Self> {
        let path = Self::resolve_config_path();

        if !path.exists() {
            tracing::info!(
                path = %path.display(),
                "anchorsync config not found, using defaults"
            );
            return Ok(Self::default());
        }

        Self::load_from_path(&path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SessionError::config_with_source(
                format!("failed to read config at {}", path.display()),
                e,
            )
        })?;

        Self::parse(&contents)
    }

    /// Parse configuration from TOML string
    pub fn parse(contents: &str) -> Result<Self> {
        let cfg: AnchorSyncConfig = toml::from_str(contents)
            .map_err(|e| SessionError::config_with_source("failed to parse config", e))?;

        cfg.validate()?;
        Ok(cfg)
    }

    fn resolve_config_path() -> PathBuf {
        if let Ok(path) = std::env::var(Self::ENV_CONFIG_PATH) {
            return PathBuf::from(path);
        }

        dirs::home_dir()
            .map(|h| {
                h.join(".config")
                    .join("anchorsync")
                    .join(Self::DEFAULT_CONFIG_FILENAME)
            })
            .unwrap_or_else(|| PathBuf::from(Self::DEFAULT_CONFIG_FILENAME))
    }

    fn validate(&self) -> Result<()> {
        if self.map_id.trim().is_empty() {
            return Err(SessionError::config("map_id must not be empty"));
        }
        if !(self.query_radius_m.is_finite() && self.query_radius_m > 0.0) {
            return Err(SessionError::config(format!(
                "query_radius_m must be a positive number, got {}",
                self.query_radius_m
            )));
        }
        if self.tick_interval_ms == 0 {
            return Err(SessionError::config("tick_interval_ms must be > 0"));
        }
        if self.notification_capacity == 0 {
            return Err(SessionError::config("notification_capacity must be > 0"));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn expiration(&self) -> ExpirationPolicy {
        ExpirationPolicy::from_secs(self.expiration_secs)
    }
}
