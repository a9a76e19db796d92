//! Pool configuration file (`~/.nodepool/config.yaml`)

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pool::lock::DEFAULT_LOCK_NAME;
use crate::pool::types::{TypeAliases, DEFAULT_ALIASES};

/// Default port for the nodemanager service
pub const DEFAULT_SERVER_PORT: u16 = 5510;

/// Default config file location: ~/.nodepool/config.yaml
pub fn default_config_path() -> PathBuf {
    nodepool_home().join("config.yaml")
}

fn nodepool_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".nodepool")
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to write config: {0}")]
    WriteError(String),

    #[error("Invalid config: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

// ============================================================================
// Config sections
// ============================================================================

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreBackend {
    Memory,
    #[default]
    File,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,
    /// File store directory; `~` and `$VAR` are expanded
    #[serde(default = "default_store_path")]
    pub path: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            path: default_store_path(),
        }
    }
}

impl StoreConfig {
    pub fn resolved_path(&self) -> PathBuf {
        let expanded = match shellexpand::full(&self.path) {
            Ok(path) => path.into_owned(),
            Err(_) => shellexpand::tilde(&self.path).into_owned(),
        };
        PathBuf::from(expanded)
    }
}

fn default_store_path() -> String {
    "~/.nodepool/store".to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    #[serde(default = "default_lock_name")]
    pub name: String,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            name: default_lock_name(),
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl LockConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

fn default_lock_name() -> String {
    DEFAULT_LOCK_NAME.to_string()
}

fn default_poll_interval_ms() -> u64 {
    50
}

/// How an allocation shortfall is reported to a consumer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Tolerance {
    /// Any shortfall is an environment error
    Strict,
    #[default]
    BestEffort,
    /// Shortfalls are logged only
    Ignore,
}

/// Raise one type's proportional share for batch-capacity consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InflationRule {
    pub node_type: String,
    /// Floor for the inflated share
    #[serde(default)]
    pub minimum: usize,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
}

fn default_multiplier() -> f64 {
    1.0
}

/// Drop `drop` from a selection whenever `keep` was selected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreferRule {
    pub keep: String,
    pub drop: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConsumerPolicy {
    #[serde(default)]
    pub tolerance: Tolerance,
    /// Fewest nodes the consumer can run with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inflation: Option<InflationRule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer: Option<PreferRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address")]
    pub bind_addr: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
    /// Base URL clients use to reach the service
    #[serde(default = "default_server_url")]
    pub url: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_address(),
            port: DEFAULT_SERVER_PORT,
            url: default_server_url(),
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_server_port() -> u16 {
    DEFAULT_SERVER_PORT
}

fn default_server_url() -> String {
    format!("http://localhost:{}", DEFAULT_SERVER_PORT)
}

/// The complete configuration file structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub lock: LockConfig,

    /// Types always represented in the type -> id view, even when empty
    #[serde(default = "default_known_types")]
    pub known_types: Vec<String>,

    /// Legacy type name -> canonical name
    #[serde(default = "default_aliases")]
    pub aliases: BTreeMap<String, String>,

    /// Consumers that always hold their nodes exclusively
    #[serde(default)]
    pub exclusive_consumers: BTreeSet<String>,

    #[serde(default)]
    pub consumers: BTreeMap<String, ConsumerPolicy>,

    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selection_seed: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            lock: LockConfig::default(),
            known_types: default_known_types(),
            aliases: default_aliases(),
            exclusive_consumers: BTreeSet::new(),
            consumers: BTreeMap::new(),
            server: ServerConfig::default(),
            selection_seed: None,
        }
    }
}

fn default_known_types() -> Vec<String> {
    [
        "ERBS",
        "RadioNode",
        "MSRBS_V1",
        "RNC",
        "RBS",
        "BSC",
        "MSC",
        "MGW",
        "SGSN-MME",
        "MINI-LINK-Indoor",
        "CISCO-ASR900",
        "FRONTHAUL-6080",
        "Router6672",
        "Router6274",
    ]
    .iter()
    .map(|t| t.to_string())
    .collect()
}

fn default_aliases() -> BTreeMap<String, String> {
    DEFAULT_ALIASES
        .iter()
        .map(|(legacy, canonical)| (legacy.to_string(), canonical.to_string()))
        .collect()
}

impl PoolConfig {
    /// Memory-backed config with no known types, handy for embedding and tests
    pub fn in_memory() -> Self {
        Self {
            store: StoreConfig {
                backend: StoreBackend::Memory,
                ..Default::default()
            },
            known_types: Vec::new(),
            ..Default::default()
        }
    }

    pub fn with_exclusive_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.exclusive_consumers.insert(consumer.into());
        self
    }

    pub fn with_policy(mut self, consumer: impl Into<String>, policy: ConsumerPolicy) -> Self {
        self.consumers.insert(consumer.into(), policy);
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.selection_seed = Some(seed);
        self
    }

    pub fn policy_for(&self, consumer: &str) -> ConsumerPolicy {
        self.consumers.get(consumer).cloned().unwrap_or_default()
    }

    pub fn type_aliases(&self) -> TypeAliases {
        TypeAliases::new(self.aliases.clone())
    }
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse config from YAML string
pub fn parse_config(content: &str) -> Result<PoolConfig, ConfigError> {
    let config: PoolConfig =
        serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
    validate_config(&config)?;
    Ok(config)
}

/// Serialize config to YAML string
pub fn serialize_config(config: &PoolConfig) -> Result<String, ConfigError> {
    serde_yaml::to_string(config).map_err(|e| ConfigError::WriteError(e.to_string()))
}

pub fn validate_config(config: &PoolConfig) -> Result<(), ConfigError> {
    if config.lock.name.trim().is_empty() {
        return Err(ConfigError::Invalid("lock name must not be empty".into()));
    }
    if config.lock.poll_interval_ms == 0 {
        return Err(ConfigError::Invalid("lock poll interval must be positive".into()));
    }
    for (consumer, policy) in &config.consumers {
        if let Some(rule) = &policy.inflation {
            if rule.multiplier < 1.0 {
                return Err(ConfigError::Invalid(format!(
                    "inflation multiplier for '{}' must be at least 1",
                    consumer
                )));
            }
        }
        if let Some(prefer) = &policy.prefer {
            if prefer.keep == prefer.drop {
                return Err(ConfigError::Invalid(format!(
                    "preference for '{}' keeps and drops the same type",
                    consumer
                )));
            }
        }
    }
    Ok(())
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load config from the default location
pub fn load_config() -> Result<PoolConfig, ConfigError> {
    load_config_from(&default_config_path())
}

/// Load config from a specific path; a missing file yields the defaults
pub fn load_config_from(path: &Path) -> Result<PoolConfig, ConfigError> {
    if !path.exists() {
        return Ok(PoolConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Save config to a specific path
pub fn save_config_to(config: &PoolConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_config(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
