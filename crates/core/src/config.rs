use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::Result;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryDefaults {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// One of: constant, linear, exponential, fibonacci, jittered.
    #[serde(default = "default_strategy")]
    pub strategy: String,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_strategy() -> String {
    "exponential".to_string()
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_jitter_factor() -> f64 {
    0.1
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            strategy: default_strategy(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EvolverConfig {
    /// Failure records kept per resolver.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_threshold_failures")]
    pub threshold_failures: u32,
    #[serde(default = "default_min_interval_sec")]
    pub min_interval_sec: u64,
    /// Rejected candidates tolerated before human intervention is requested.
    #[serde(default = "default_retry_budget")]
    pub retry_budget: u32,
}

fn default_window_size() -> usize {
    256
}

fn default_threshold_failures() -> u32 {
    5
}

fn default_min_interval_sec() -> u64 {
    86_400
}

fn default_retry_budget() -> u32 {
    3
}

impl Default for EvolverConfig {
    fn default() -> Self {
        Self {
            window_size: default_window_size(),
            threshold_failures: default_threshold_failures(),
            min_interval_sec: default_min_interval_sec(),
            retry_budget: default_retry_budget(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default = "default_http_bind")]
    pub http_bind: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_collection_interval")]
    pub collection_interval_sec: u64,
    #[serde(default = "default_health_interval")]
    pub health_interval_sec: u64,
    #[serde(default = "default_retention_days")]
    pub metrics_retention_days: u32,
    #[serde(default = "default_history_ring")]
    pub history_ring_size: usize,
    #[serde(default)]
    pub default_retry: RetryDefaults,
    #[serde(default)]
    pub evolver: EvolverConfig,
}

fn default_data_dir() -> String {
    "~/.taskloom".to_string()
}

fn default_http_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    18890
}

fn default_collection_interval() -> u64 {
    60
}

fn default_health_interval() -> u64 {
    120
}

fn default_retention_days() -> u32 {
    14
}

fn default_history_ring() -> usize {
    256
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            http_bind: default_http_bind(),
            api_port: default_api_port(),
            collection_interval_sec: default_collection_interval(),
            health_interval_sec: default_health_interval(),
            metrics_retention_days: default_retention_days(),
            history_ring_size: default_history_ring(),
            default_retry: RetryDefaults::default(),
            evolver: EvolverConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}
