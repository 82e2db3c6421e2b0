//! Pool, router and export configuration.
//!
//! Every knob has a default; `AppConfig::from_env` overlays `APPBOX_*`
//! environment variables on top of those defaults.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Bounds on the file-tree walk performed when exporting a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportLimits {
    pub max_depth: usize,
    pub max_files: usize,
    /// Glob patterns matched against entry names; matching entries are skipped.
    pub exclude: Vec<String>,
}

impl Default for ExportLimits {
    fn default() -> Self {
        Self {
            max_depth: 12,
            max_files: 2000,
            exclude: [
                "node_modules",
                ".git",
                "dist",
                "build",
                ".next",
                ".cache",
                "target",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub max_instances: usize,
    pub max_memory_mb: u64,
    /// Identifiers never chosen for eviction.
    pub protected: HashSet<String>,
    pub active_baseline_mb: u64,
    pub suspended_baseline_mb: u64,
    pub export: ExportLimits,
    pub autosave_debounce_ms: u64,
    pub default_suspend_after_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_instances: 5,
            max_memory_mb: 1024,
            protected: HashSet::new(),
            active_baseline_mb: 150,
            suspended_baseline_mb: 5,
            export: ExportLimits::default(),
            autosave_debounce_ms: 2000,
            default_suspend_after_ms: 5 * 60 * 1000,
        }
    }
}

impl PoolConfig {
    pub fn with_protected(mut self, app_id: impl Into<String>) -> Self {
        self.protected.insert(app_id.into());
        self
    }

    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouterConfig {
    /// Prefix stripped before the identifier segment, e.g. `/apps`.
    pub base_path: String,
    pub default_app: String,
    /// Idle threshold applied to preloaded instances.
    pub preload_suspend_after_ms: u64,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            base_path: "/apps".to_string(),
            default_app: "main".to_string(),
            preload_suspend_after_ms: 15 * 60 * 1000,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub pool: PoolConfig,
    pub router: RouterConfig,
}

impl AppConfig {
    /// Defaults overlaid with `APPBOX_*` variables. Malformed values are logged
    /// and ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let pool = &mut config.pool;

        overlay(&lookup, "APPBOX_MAX_INSTANCES", &mut pool.max_instances);
        overlay(&lookup, "APPBOX_MAX_MEMORY_MB", &mut pool.max_memory_mb);
        overlay(&lookup, "APPBOX_ACTIVE_BASELINE_MB", &mut pool.active_baseline_mb);
        overlay(
            &lookup,
            "APPBOX_SUSPENDED_BASELINE_MB",
            &mut pool.suspended_baseline_mb,
        );
        overlay(&lookup, "APPBOX_AUTOSAVE_DEBOUNCE_MS", &mut pool.autosave_debounce_ms);
        overlay(
            &lookup,
            "APPBOX_SUSPEND_AFTER_MS",
            &mut pool.default_suspend_after_ms,
        );
        overlay(&lookup, "APPBOX_EXPORT_MAX_DEPTH", &mut pool.export.max_depth);
        overlay(&lookup, "APPBOX_EXPORT_MAX_FILES", &mut pool.export.max_files);
        if let Some(list) = lookup("APPBOX_PROTECTED") {
            pool.protected = split_list(&list).collect();
        }
        if let Some(list) = lookup("APPBOX_EXPORT_EXCLUDE") {
            pool.export.exclude = split_list(&list).collect();
        }

        let router = &mut config.router;
        if let Some(base) = lookup("APPBOX_BASE_PATH") {
            router.base_path = base;
        }
        if let Some(default_app) = lookup("APPBOX_DEFAULT_APP") {
            router.default_app = default_app;
        }
        overlay(
            &lookup,
            "APPBOX_PRELOAD_SUSPEND_AFTER_MS",
            &mut router.preload_suspend_after_ms,
        );

        // The default app is never evicted.
        let default_app = config.router.default_app.clone();
        config.pool.protected.insert(default_app);
        config
    }
}

fn split_list(value: &str) -> impl Iterator<Item = String> + '_ {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn parse_value<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: raw.to_string(),
    })
}

fn overlay<T, F>(lookup: &F, key: &str, target: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match parse_value(key, &raw) {
        Ok(value) => *target = value,
        Err(e) => warn!("{}; keeping default", e),
    }
}
