//! Configuration System
//!
//! Provides hierarchical configuration loading from:
//! - schedule.toml (default configuration)
//! - schedule.local.toml (git-ignored local overrides)
//! - Environment variables (SCHEDULE_* prefix)
//!
//! ## Example
//!
//! ```toml
//! # schedule.toml
//! [normalize]
//! rebase_enabled = false
//!
//! [bounds]
//! skip_bound_check_default = false
//! ```
//!
//! Environment variable overrides:
//! ```bash
//! SCHEDULE_NORMALIZE__REBASE_ENABLED=true
//! SCHEDULE_BOUNDS__SKIP_BOUND_CHECK_DEFAULT=true
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Top-level schedule engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub normalize: NormalizeConfig,
    #[serde(default)]
    pub bounds: BoundsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Controls what `Schedule::normalize` composes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizeConfig {
    /// Whether `normalize()` also runs `rebase_non_zero_min_loop` after
    /// inject-inline. The pass is fully implemented either way; this only
    /// gates whether `normalize()` calls it.
    #[serde(default)]
    pub rebase_enabled: bool,
}

impl Default for NormalizeConfig {
    fn default() -> Self {
        NormalizeConfig {
            rebase_enabled: false,
        }
    }
}

/// Controls default bound-check behavior for `MakeBoundCheck`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundsConfig {
    /// When true, primitives that do not pass an explicit `skip_bound_check`
    /// set default to skipping bound checks entirely rather than emitting
    /// the minimal predicate set.
    #[serde(default)]
    pub skip_bound_check_default: bool,
}

impl Default for BoundsConfig {
    fn default() -> Self {
        BoundsConfig {
            skip_bound_check_default: false,
        }
    }
}

/// Logging configuration consumed by the binary's `tracing-subscriber` setup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Config {
    /// Load configuration from default locations.
    ///
    /// Merges in order:
    /// 1. schedule.toml (base configuration)
    /// 2. schedule.local.toml (local overrides, git-ignored)
    /// 3. Environment variables (SCHEDULE_* prefix)
    pub fn load() -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file("schedule.toml"))
            .merge(Toml::file("schedule.local.toml"))
            .merge(Env::prefixed("SCHEDULE_").split("__"))
            .extract()
    }

    /// Load configuration from a specific file path.
    pub fn from_file(path: &str) -> Result<Self, figment::Error> {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("SCHEDULE_").split("__"))
            .extract()
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            normalize: NormalizeConfig::default(),
            bounds: BoundsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}
