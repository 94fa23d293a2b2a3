//! Configuration management for the update agent.
//!
//! Loads configuration from a TOML file; every section falls back to
//! defaults so a fresh device can boot with an empty file.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub backups: BackupConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Device identifier used in telemetry tags
    #[serde(default = "default_device_id")]
    pub device_id: String,

    /// HTTP API port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory holding the version record and update history
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Root that manifest target paths are resolved under
    #[serde(default = "default_install_root")]
    pub install_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the update source (serves version.yml and updates/)
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Retry attempts for transient fetch failures
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial retry backoff in milliseconds, doubled per attempt
    #[serde(default = "default_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Backoff ceiling in milliseconds
    #[serde(default = "default_backoff_max_ms")]
    pub retry_backoff_max_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds between automatic update checks
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,

    /// Run a check as soon as the agent starts
    #[serde(default = "default_true")]
    pub check_on_startup: bool,

    /// Compose file describing the service stack
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,

    /// Services a whole-stack action must never touch
    #[serde(default = "default_protected_services")]
    pub protected_services: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory where pre-update snapshots are kept
    #[serde(default = "default_backup_dir")]
    pub dir: PathBuf,

    /// Snapshots kept before the oldest are pruned
    #[serde(default = "default_backup_max_count")]
    pub max_count: usize,

    /// Snapshots older than this are pruned regardless of count
    #[serde(default = "default_backup_max_age_days")]
    pub max_age_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Forward update outcomes to InfluxDB
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// InfluxDB 1.x base URL
    #[serde(default = "default_influx_url")]
    pub influx_url: String,

    /// Database the measurements are written to
    #[serde(default = "default_influx_database")]
    pub database: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_device_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "data-hub".to_string())
}

fn default_port() -> u16 {
    9980
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/data/state")
}

fn default_install_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_base_url() -> String {
    "https://updates.example.com/data-hub".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    30000
}

fn default_check_interval() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("/data/docker/compose/docker-compose.yaml")
}

fn default_protected_services() -> Vec<String> {
    vec!["update-agent".to_string(), "watchtower".to_string()]
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("/data/backups")
}

fn default_backup_max_count() -> usize {
    10
}

fn default_backup_max_age_days() -> i64 {
    30
}

fn default_influx_url() -> String {
    "http://influxdb:8086".to_string()
}

fn default_influx_database() -> String {
    "system_updates".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            device_id: default_device_id(),
            port: default_port(),
            state_dir: default_state_dir(),
            install_root: default_install_root(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig {
            base_url: default_base_url(),
            request_timeout_secs: default_request_timeout(),
            max_retries: default_max_retries(),
            retry_backoff_ms: default_backoff_ms(),
            retry_backoff_max_ms: default_backoff_max_ms(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            check_interval_secs: default_check_interval(),
            check_on_startup: true,
            compose_file: default_compose_file(),
            protected_services: default_protected_services(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            dir: default_backup_dir(),
            max_count: default_backup_max_count(),
            max_age_days: default_backup_max_age_days(),
        }
    }
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        TelemetryConfig {
            enabled: true,
            influx_url: default_influx_url(),
            database: default_influx_database(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        LogConfig {
            level: default_log_level(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            agent: AgentConfig::default(),
            source: SourceConfig::default(),
            engine: EngineConfig::default(),
            backups: BackupConfig::default(),
            telemetry: TelemetryConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}
