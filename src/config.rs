use anyhow::Result;
use figment::{providers::{Env, Format, Toml}, Figment};
use serde::Deserialize;
use std::path::PathBuf;

use crate::demand::factor_table::DEFAULT_TOLERANCE;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub demand: DemandConfig,
    #[serde(default)]
    pub phase_balance: PhaseBalanceConfig,
    #[serde(default)]
    pub sections: SectionsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// EnvFilter directive used when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default = "default_true")]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub url: Option<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            url: None,
            max_connections: default_max_connections(),
        }
    }
}

/// Where the demand factor table comes from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DemandTableSource {
    #[default]
    Builtin,
    File,
    Store,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DemandConfig {
    #[serde(default)]
    pub source: DemandTableSource,
    /// Required when `source = "file"`
    pub table_path: Option<PathBuf>,
    #[serde(default = "default_tolerance")]
    pub tolerance: f64,
}

impl Default for DemandConfig {
    fn default() -> Self {
        Self {
            source: DemandTableSource::Builtin,
            table_path: None,
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhaseBalanceConfig {
    #[serde(default = "default_true")]
    pub respect_manual: bool,
}

impl Default for PhaseBalanceConfig {
    fn default() -> Self {
        Self { respect_manual: true }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SectionsConfig {
    /// Write section totals back to the store after aggregation
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for SectionsConfig {
    fn default() -> Self {
        Self { persist: true }
    }
}

fn default_log_filter() -> String {
    "info,sqlx=warn".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_connections() -> u32 {
    10
}

fn default_tolerance() -> f64 {
    DEFAULT_TOLERANCE
}

impl Config {
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Toml::file("config/default.toml"))
            .merge(Env::prefixed("PANELCALC__").split("__"));
        Ok(figment.extract()?)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(Figment::new().merge(Toml::string(content)).extract()?)
    }
}
