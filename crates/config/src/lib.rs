use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Top level configuration shared by the scheduler and the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cluster: ClusterConfig,
    #[serde(default)]
    pub selection: SelectionConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub packages: PackagesConfig,
    #[serde(default)]
    pub rexray: RexrayConfig,
    #[serde(default)]
    pub isolator: IsolatorConfig,
    /// Skips reboots and raises the default log level
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub experimental: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub id: String,
    #[serde(default = "default_cluster_name")]
    pub name: String,
    #[serde(default)]
    pub admin_password: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Externally managed gateway (load balancer)
    #[serde(default)]
    pub lb_gateway: Option<String>,
    #[serde(default = "default_protection_domain")]
    pub protection_domain: String,
    #[serde(default = "default_storage_pool")]
    pub storage_pool: String,
    #[serde(default)]
    pub preconfig: PreconfigConfig,
}

fn default_cluster_name() -> String {
    "scaleio".to_string()
}

fn default_api_version() -> String {
    "2.0".to_string()
}

fn default_protection_domain() -> String {
    "default".to_string()
}

fn default_storage_pool() -> String {
    "default".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: default_cluster_name(),
            admin_password: String::new(),
            api_version: default_api_version(),
            lb_gateway: None,
            protection_domain: default_protection_domain(),
            storage_pool: default_storage_pool(),
            preconfig: PreconfigConfig::default(),
        }
    }
}

/// Statically configured manager addresses of an already running cluster.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PreconfigConfig {
    #[serde(default)]
    pub primary_mdm: Option<String>,
    #[serde(default)]
    pub secondary_mdm: Option<String>,
    #[serde(default)]
    pub tiebreaker_mdm: Option<String>,
    #[serde(default)]
    pub gateway: Option<String>,
}

impl PreconfigConfig {
    /// All three manager addresses are known.
    pub fn is_complete(&self) -> bool {
        self.primary_mdm.is_some() && self.secondary_mdm.is_some() && self.tiebreaker_mdm.is_some()
    }

    /// At least one manager address is known, so automatic manager selection is off.
    pub fn has_any_mdm(&self) -> bool {
        self.primary_mdm.is_some() || self.secondary_mdm.is_some() || self.tiebreaker_mdm.is_some()
    }
}

/// Thresholds for automatic manager placement.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionConfig {
    #[serde(default = "default_mdm_cpu")]
    pub mdm_cpu: f64,
    /// In MB, same unit as the `mem` offer resource
    #[serde(default = "default_mdm_memory")]
    pub mdm_memory: f64,
    #[serde(default = "default_factor")]
    pub cpu_factor: f64,
    #[serde(default = "default_factor")]
    pub memory_factor: f64,
}

fn default_mdm_cpu() -> f64 {
    1.0
}

fn default_mdm_memory() -> f64 {
    2048.0
}

fn default_factor() -> f64 {
    1.0
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            mdm_cpu: default_mdm_cpu(),
            mdm_memory: default_mdm_memory(),
            cpu_factor: default_factor(),
            memory_factor: default_factor(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_framework_role")]
    pub framework_role: String,
    #[serde(default = "default_store_dir")]
    pub store_dir: String,
    #[serde(default = "default_poll_status")]
    pub poll_status_secs: u64,
    /// Address node agents use to reach the scheduler
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default = "default_true")]
    pub steady_state_reconcile: bool,
}

fn default_framework_role() -> String {
    "scaleio".to_string()
}

fn default_store_dir() -> String {
    "/var/lib/scaleio-scheduler".to_string()
}

fn default_poll_status() -> u64 {
    5
}

fn default_true() -> bool {
    true
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            framework_role: default_framework_role(),
            store_dir: default_store_dir(),
            poll_status_secs: default_poll_status(),
            address: None,
            steady_state_reconcile: true,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_status(&self) -> Duration {
        Duration::from_secs(self.poll_status_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutorConfig {
    #[serde(default = "default_barrier_poll")]
    pub barrier_poll_secs: u64,
    /// None waits forever
    #[serde(default)]
    pub barrier_timeout_secs: Option<u64>,
    #[serde(default = "default_poll_for_changes")]
    pub poll_for_changes_secs: u64,
    #[serde(default = "default_delay_for_reboot")]
    pub delay_for_reboot_secs: u64,
    #[serde(default = "default_wait_for_reboot")]
    pub wait_for_reboot_secs: u64,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
}

fn default_barrier_poll() -> u64 {
    5
}

fn default_poll_for_changes() -> u64 {
    60
}

fn default_delay_for_reboot() -> u64 {
    30
}

fn default_wait_for_reboot() -> u64 {
    600
}

fn default_download_dir() -> String {
    "/tmp/scaleio".to_string()
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            barrier_poll_secs: default_barrier_poll(),
            barrier_timeout_secs: None,
            poll_for_changes_secs: default_poll_for_changes(),
            delay_for_reboot_secs: default_delay_for_reboot(),
            wait_for_reboot_secs: default_wait_for_reboot(),
            download_dir: default_download_dir(),
        }
    }
}

impl ExecutorConfig {
    pub fn barrier_poll(&self) -> Duration {
        Duration::from_secs(self.barrier_poll_secs)
    }

    pub fn barrier_timeout(&self) -> Option<Duration> {
        self.barrier_timeout_secs.map(Duration::from_secs)
    }

    pub fn poll_for_changes(&self) -> Duration {
        Duration::from_secs(self.poll_for_changes_secs)
    }

    pub fn delay_for_reboot(&self) -> Duration {
        Duration::from_secs(self.delay_for_reboot_secs)
    }

    pub fn wait_for_reboot(&self) -> Duration {
        Duration::from_secs(self.wait_for_reboot_secs)
    }
}

/// Package download locations per OS family.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackagesConfig {
    #[serde(default)]
    pub deb: PackageUrls,
    #[serde(default)]
    pub rpm: PackageUrls,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PackageUrls {
    #[serde(default)]
    pub mdm: String,
    #[serde(default)]
    pub sds: String,
    #[serde(default)]
    pub sdc: String,
    #[serde(default)]
    pub lia: String,
    #[serde(default)]
    pub gw: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RexrayConfig {
    #[serde(default = "default_rexray_branch")]
    pub branch: String,
    #[serde(default = "default_rexray_version")]
    pub version: String,
}

fn default_rexray_branch() -> String {
    "stable".to_string()
}

fn default_rexray_version() -> String {
    "latest".to_string()
}

impl Default for RexrayConfig {
    fn default() -> Self {
        Self {
            branch: default_rexray_branch(),
            version: default_rexray_version(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsolatorConfig {
    /// Download URL of the docker volume driver isolator; empty disables it
    #[serde(default)]
    pub binary: String,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        Ok(config)
    }
}
