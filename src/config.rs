//! Configuration management for the backup agent.
//!
//! Loads configuration from TOML file; every field has a serde default so a
//! minimal file (or none at all) still yields a working configuration.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::utils::errors::{AgentError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentConfig,

    /// Ordered list of subvolumes to back up; runs iterate in this order.
    #[serde(default = "default_subvolumes")]
    pub subvolumes: Vec<SubvolumeSpec>,

    #[serde(default)]
    pub remote: RemoteConfig,

    #[serde(default)]
    pub backup: BackupConfig,

    #[serde(default)]
    pub retention: RetentionConfig,

    #[serde(default)]
    pub schedule: ScheduleConfig,

    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Prefix under the remote base path; defaults to the hostname
    #[serde(default = "default_client_id")]
    pub client_id: String,

    /// HTTP control-plane port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Directory for keyfile and lineage store
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubvolumeSpec {
    /// Name used in snapshot and archive paths (e.g. "root", "home")
    pub name: String,

    /// Mounted path of the subvolume on the client filesystem
    pub source_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default)]
    pub host: String,

    #[serde(default = "default_remote_user")]
    pub user: String,

    #[serde(default = "default_remote_port")]
    pub port: u16,

    #[serde(default = "default_remote_base_path")]
    pub base_path: String,

    /// Private key used for key-based authentication
    #[serde(default = "default_ssh_key_path")]
    pub ssh_key_path: PathBuf,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Where local read-only snapshots live
    #[serde(default = "default_snapshot_dir")]
    pub snapshot_dir: PathBuf,

    /// Compression algorithm (zstd, gzip)
    #[serde(default = "default_compress_algo")]
    pub compress_algo: String,

    /// Compression level (1-22 for zstd, 1-9 for gzip)
    #[serde(default = "default_compress_level")]
    pub compress_level: i32,

    /// Force a full backup when the last full is older than this
    #[serde(default = "default_full_interval_days")]
    pub full_interval_days: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Remote monthly retention
    #[serde(default = "default_months_to_keep")]
    pub months_to_keep: usize,

    /// Max incremental chain length and remote incremental retention (days)
    #[serde(default = "default_daily_incremental_days")]
    pub daily_incremental_days: i64,

    /// Local snapshot retention (days)
    #[serde(default = "default_local_snapshot_days")]
    pub local_snapshot_days: i64,
}

/// Stored for the external trigger; the core never evaluates these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default)]
    pub enabled: bool,

    /// 24-hour HH:MM
    #[serde(default = "default_schedule_time")]
    pub time: String,

    #[serde(default = "default_schedule_days")]
    pub days: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_client_id() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "snapsend-client".to_string())
}

fn default_port() -> u16 {
    9980
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/snapsend")
}

fn default_subvolumes() -> Vec<SubvolumeSpec> {
    vec![
        SubvolumeSpec {
            name: "root".to_string(),
            source_path: PathBuf::from("/"),
        },
        SubvolumeSpec {
            name: "home".to_string(),
            source_path: PathBuf::from("/home"),
        },
    ]
}

fn default_remote_user() -> String {
    "root".to_string()
}

fn default_remote_port() -> u16 {
    22
}

fn default_remote_base_path() -> String {
    "/mnt/backups".to_string()
}

fn default_ssh_key_path() -> PathBuf {
    PathBuf::from("/root/.ssh/snapsend_backup")
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("/.snapshots")
}

fn default_compress_algo() -> String {
    "zstd".to_string()
}

fn default_compress_level() -> i32 {
    3
}

fn default_full_interval_days() -> i64 {
    30
}

fn default_months_to_keep() -> usize {
    6
}

fn default_daily_incremental_days() -> i64 {
    30
}

fn default_local_snapshot_days() -> i64 {
    7
}

fn default_schedule_time() -> String {
    "02:00".to_string()
}

fn default_schedule_days() -> Vec<String> {
    ["mon", "tue", "wed", "thu", "fri", "sat", "sun"]
        .iter()
        .map(|d| d.to_string())
        .collect()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            client_id: default_client_id(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            host: String::new(),
            user: default_remote_user(),
            port: default_remote_port(),
            base_path: default_remote_base_path(),
            ssh_key_path: default_ssh_key_path(),
            connect_timeout_seconds: default_connect_timeout(),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        BackupConfig {
            snapshot_dir: default_snapshot_dir(),
            compress_algo: default_compress_algo(),
            compress_level: default_compress_level(),
            full_interval_days: default_full_interval_days(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            months_to_keep: default_months_to_keep(),
            daily_incremental_days: default_daily_incremental_days(),
            local_snapshot_days: default_local_snapshot_days(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        ScheduleConfig {
            enabled: false,
            time: default_schedule_time(),
            days: default_schedule_days(),
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
            subvolumes: default_subvolumes(),
            remote: RemoteConfig::default(),
            backup: BackupConfig::default(),
            retention: RetentionConfig::default(),
            schedule: ScheduleConfig::default(),
            log: LogConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AgentError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| AgentError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.subvolumes.is_empty() {
            return Err(AgentError::Config("no subvolumes configured".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for sv in &self.subvolumes {
            if sv.name.is_empty() || sv.name.contains('/') || sv.name.contains('_') {
                return Err(AgentError::Config(format!(
                    "invalid subvolume name '{}' (must be non-empty, without '/' or '_')",
                    sv.name
                )));
            }
            if !seen.insert(&sv.name) {
                return Err(AgentError::Config(format!(
                    "duplicate subvolume name '{}'",
                    sv.name
                )));
            }
        }
        crate::stages::compress::CompressAlgo::parse(&self.backup.compress_algo)?;
        validate_schedule_time(&self.schedule.time)?;
        Ok(())
    }

    /// Keyfile location under the private data directory
    pub fn keyfile_path(&self) -> PathBuf {
        self.agent.data_dir.join("backup-encryption.key")
    }

    /// Lineage store location
    pub fn store_path(&self) -> PathBuf {
        self.agent.data_dir.join("lineage.db")
    }

    /// Remote prefix for this client: `<base_path>/<client_id>`
    pub fn client_prefix(&self) -> String {
        format!(
            "{}/{}",
            self.remote.base_path.trim_end_matches('/'),
            self.agent.client_id
        )
    }

    pub fn subvolume(&self, name: &str) -> Option<&SubvolumeSpec> {
        self.subvolumes.iter().find(|s| s.name == name)
    }
}

fn validate_schedule_time(v: &str) -> Result<()> {
    let parts: Vec<&str> = v.split(':').collect();
    let valid = parts.len() == 2
        && matches!(parts[0].parse::<u8>(), Ok(h) if h <= 23)
        && matches!(parts[1].parse::<u8>(), Ok(m) if m <= 59);
    if valid {
        Ok(())
    } else {
        Err(AgentError::Config(format!(
            "schedule.time must be HH:MM, got '{}'",
            v
        )))
    }
}
