//! Deployment configuration.
//!
//! Loaded from an optional TOML/YAML file overlaid with `UPSTREAMD_*`
//! environment variables (double underscore as the nesting separator, e.g.
//! `UPSTREAMD_NGINX__RELOAD_COMMAND`). `INSTANCE_ID` is honored as a
//! fallback for the instance identity, matching the container convention.

use serde::{Deserialize, Serialize};

use crate::error::{ControlError, Result};
use crate::model::{ServerDescriptor, WeightFactors};

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    #[serde(default = "default_instance_id")]
    pub instance_id: String,

    /// Bind address for the HTTP API.
    #[serde(default = "default_api_bind")]
    pub api_bind: String,

    #[serde(default)]
    pub incoming_servers: Vec<ServerDescriptor>,

    #[serde(default)]
    pub outgoing_servers: Vec<ServerDescriptor>,

    #[serde(default)]
    pub nginx: NginxSettings,

    #[serde(default)]
    pub redis: RedisSettings,

    #[serde(default)]
    pub archive: ArchiveSettings,

    #[serde(default = "default_ewma_alpha")]
    pub ewma_alpha: f64,

    #[serde(default)]
    pub weight_factors: WeightFactors,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NginxSettings {
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    #[serde(default = "default_config_file")]
    pub config_file: String,
    #[serde(default = "default_reload_command")]
    pub reload_command: String,
    /// Keep a timestamped copy of the previous file on every write.
    #[serde(default = "default_backup_enabled")]
    pub backup_enabled: bool,
}

impl NginxSettings {
    pub fn config_path(&self) -> String {
        format!("{}/{}", self.config_dir, self.config_file)
    }
}

impl Default for NginxSettings {
    fn default() -> Self {
        Self {
            config_dir: default_config_dir(),
            config_file: default_config_file(),
            reload_command: default_reload_command(),
            backup_enabled: default_backup_enabled(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,
    #[serde(default)]
    pub keys: KeyLayout,
    #[serde(default)]
    pub ttl: TtlSettings,
    #[serde(default)]
    pub intervals: IntervalSettings,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            keys: KeyLayout::default(),
            ttl: TtlSettings::default(),
            intervals: IntervalSettings::default(),
        }
    }
}

/// Key namespaces in the shared store. All prefixes are configurable so
/// several deployments can share one Redis.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KeyLayout {
    #[serde(default = "default_metrics_prefix")]
    pub metrics_prefix: String,
    #[serde(default = "default_config_prefix")]
    pub config_prefix: String,
    #[serde(default = "default_weights_prefix")]
    pub weights_prefix: String,
    #[serde(default = "default_nginx_config_key")]
    pub nginx_config_key: String,
    #[serde(default = "default_last_update_key")]
    pub last_update_key: String,
    #[serde(default = "default_instance_prefix")]
    pub instance_prefix: String,
    #[serde(default = "default_lock_prefix")]
    pub lock_prefix: String,
}

impl Default for KeyLayout {
    fn default() -> Self {
        Self {
            metrics_prefix: default_metrics_prefix(),
            config_prefix: default_config_prefix(),
            weights_prefix: default_weights_prefix(),
            nginx_config_key: default_nginx_config_key(),
            last_update_key: default_last_update_key(),
            instance_prefix: default_instance_prefix(),
            lock_prefix: default_lock_prefix(),
        }
    }
}

/// Seconds of life for each key category.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct TtlSettings {
    #[serde(default = "default_ttl_metrics")]
    pub metrics: u64,
    #[serde(default = "default_ttl_config")]
    pub config: u64,
    #[serde(default = "default_ttl_weights")]
    pub weights: u64,
    #[serde(default = "default_ttl_nginx_config")]
    pub nginx_config: u64,
    #[serde(default = "default_ttl_heartbeat")]
    pub instance_heartbeat: u64,
}

impl Default for TtlSettings {
    fn default() -> Self {
        Self {
            metrics: default_ttl_metrics(),
            config: default_ttl_config(),
            weights: default_ttl_weights(),
            nginx_config: default_ttl_nginx_config(),
            instance_heartbeat: default_ttl_heartbeat(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct IntervalSettings {
    #[serde(default = "default_weight_cycle_secs")]
    pub weight_cycle_secs: u64,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_config_sync_secs")]
    pub config_sync_secs: u64,
    #[serde(default = "default_metrics_cleanup_secs")]
    pub metrics_cleanup_secs: u64,
}

impl Default for IntervalSettings {
    fn default() -> Self {
        Self {
            weight_cycle_secs: default_weight_cycle_secs(),
            heartbeat_secs: default_heartbeat_secs(),
            config_sync_secs: default_config_sync_secs(),
            metrics_cleanup_secs: default_metrics_cleanup_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArchiveSettings {
    #[serde(default = "default_archive_dir")]
    pub dir: String,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
}

impl Default for ArchiveSettings {
    fn default() -> Self {
        Self {
            dir: default_archive_dir(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_instance_id() -> String {
    std::env::var("INSTANCE_ID").unwrap_or_else(|_| "default-instance".to_string())
}

fn default_api_bind() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_ewma_alpha() -> f64 {
    0.3
}

fn default_config_dir() -> String {
    "/nginx-config".to_string()
}

fn default_config_file() -> String {
    "upstream.conf".to_string()
}

fn default_reload_command() -> String {
    "nginx -s reload".to_string()
}

fn default_backup_enabled() -> bool {
    true
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_metrics_prefix() -> String {
    "metrics:".to_string()
}

fn default_config_prefix() -> String {
    "config:".to_string()
}

fn default_weights_prefix() -> String {
    "weights:".to_string()
}

fn default_nginx_config_key() -> String {
    "nginx:current-config".to_string()
}

fn default_last_update_key() -> String {
    "nginx:last-update".to_string()
}

fn default_instance_prefix() -> String {
    "instance:".to_string()
}

fn default_lock_prefix() -> String {
    "lock:".to_string()
}

fn default_ttl_metrics() -> u64 {
    600
}

fn default_ttl_config() -> u64 {
    3600
}

fn default_ttl_weights() -> u64 {
    300
}

fn default_ttl_nginx_config() -> u64 {
    1800
}

fn default_ttl_heartbeat() -> u64 {
    60
}

fn default_weight_cycle_secs() -> u64 {
    60
}

fn default_heartbeat_secs() -> u64 {
    30
}

fn default_config_sync_secs() -> u64 {
    10
}

fn default_metrics_cleanup_secs() -> u64 {
    60
}

fn default_archive_dir() -> String {
    "/var/lib/upstreamd/metrics".to_string()
}

fn default_retention_days() -> i64 {
    7
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            instance_id: default_instance_id(),
            api_bind: default_api_bind(),
            incoming_servers: Vec::new(),
            outgoing_servers: Vec::new(),
            nginx: NginxSettings::default(),
            redis: RedisSettings::default(),
            archive: ArchiveSettings::default(),
            ewma_alpha: default_ewma_alpha(),
            weight_factors: WeightFactors::default(),
        }
    }
}

impl DaemonConfig {
    /// Loads configuration from an optional file plus the environment.
    pub fn load(file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(config::File::with_name(path));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix("UPSTREAMD").separator("__"))
            .build()
            .map_err(|e| ControlError::Config(e.to_string()))?;

        let config: DaemonConfig = settings
            .try_deserialize()
            .map_err(|e| ControlError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Boot-time sanity checks. A failure here is fatal to the process.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for server in self.incoming_servers.iter().chain(&self.outgoing_servers) {
            if server.host.is_empty() {
                return Err(ControlError::Config(format!(
                    "server {} has an empty host",
                    server.id
                )));
            }
            if !seen.insert(server.id.clone()) {
                return Err(ControlError::Config(format!(
                    "duplicate server id: {}",
                    server.id
                )));
            }
        }
        if self.nginx.reload_command.trim().is_empty() {
            return Err(ControlError::Config("reload command is empty".into()));
        }
        if !(0.0..=1.0).contains(&self.ewma_alpha) {
            return Err(ControlError::Config(format!(
                "ewma_alpha must be within [0, 1], got {}",
                self.ewma_alpha
            )));
        }
        Ok(())
    }
}
