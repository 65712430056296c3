//! Configuration for verilab.
//!
//! Loads settings from /etc/verilab/config.toml or uses defaults.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::{info, warn};

use crate::api::context::ApiGeneration;
use crate::api::retry::MAX_RETRY_BUDGET;

/// Config file path
pub const CONFIG_PATH: &str = "/etc/verilab/config.toml";

/// Fallback config file path
pub const DEFAULT_CONFIG_PATH: &str = "/var/lib/verilab/config.toml";

/// Management API endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Which API generation the endpoint speaks
    #[serde(default = "default_generation")]
    pub generation: ApiGeneration,

    #[serde(default)]
    pub username: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    #[serde(default)]
    pub bearer_token: Option<String>,

    /// Disable TLS certificate verification. Lab use only; never implied.
    #[serde(default)]
    pub insecure_tls: bool,

    /// Per-request timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt (0-10)
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

fn default_base_url() -> String {
    "https://mgmt.lab.local:9440".to_string()
}

fn default_generation() -> ApiGeneration {
    ApiGeneration::V4
}

fn default_api_timeout() -> u64 {
    30
}

fn default_retry_count() -> u32 {
    3
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            generation: default_generation(),
            username: None,
            password: None,
            bearer_token: None,
            insecure_tls: false,
            timeout_secs: default_api_timeout(),
            retry_count: default_retry_count(),
        }
    }
}

/// Backup catalog endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    #[serde(default = "default_catalog_url")]
    pub base_url: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_api_timeout")]
    pub timeout_secs: u64,
}

fn default_catalog_url() -> String {
    "https://backup.lab.local:9419".to_string()
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            base_url: default_catalog_url(),
            api_key: None,
            timeout_secs: default_api_timeout(),
        }
    }
}

/// Recovery orchestration configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Concurrency ceiling per tier batch
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Bound on waiting for a recovered VM to report powered-on
    #[serde(default = "default_power_on_timeout")]
    pub power_on_timeout_secs: u64,

    /// Bound on waiting for a restore task to finish
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Explicit isolated network id; takes precedence over the name
    #[serde(default)]
    pub isolated_network_id: Option<String>,

    /// Explicit isolated network name; used when no id is set
    #[serde(default)]
    pub isolated_network_name: Option<String>,

    /// Keep running remaining batches of a tier after a failure. Never
    /// affects cleanup, and never un-skips downstream tiers.
    #[serde(default)]
    pub continue_on_failure: bool,

    /// Suffix marking recovered clones, part of the synthetic recovery name
    #[serde(default = "default_name_suffix")]
    pub name_suffix: String,
}

fn default_name_suffix() -> String {
    "-verify".to_string()
}

fn default_max_concurrent() -> usize {
    3
}

fn default_power_on_timeout() -> u64 {
    300
}

fn default_task_timeout() -> u64 {
    900
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            power_on_timeout_secs: default_power_on_timeout(),
            task_timeout_secs: default_task_timeout(),
            isolated_network_id: None,
            isolated_network_name: None,
            continue_on_failure: false,
            name_suffix: default_name_suffix(),
        }
    }
}

/// Verification check configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyConfig {
    /// Power + guest-agent heartbeat check
    #[serde(default = "default_true")]
    pub heartbeat: bool,

    /// ICMP attempts per VM; the check passes if any succeeds
    #[serde(default = "default_ping_attempts")]
    pub ping_attempts: u32,

    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_secs: u64,

    /// TCP ports that must accept a connection
    #[serde(default)]
    pub tcp_ports: Vec<u16>,

    #[serde(default = "default_probe_timeout")]
    pub port_timeout_secs: u64,

    /// HTTP endpoints to probe; localhost is rewritten to the VM address
    #[serde(default)]
    pub http_urls: Vec<String>,

    #[serde(default = "default_probe_timeout")]
    pub http_timeout_secs: u64,

    /// Reverse-DNS check for the VM address
    #[serde(default)]
    pub check_dns: bool,

    /// Disable TLS certificate verification for HTTP probes. Lab use only;
    /// never implied.
    #[serde(default)]
    pub insecure_tls: bool,

    /// External verification script, invoked per VM
    #[serde(default)]
    pub script_path: Option<PathBuf>,

    #[serde(default = "default_script_timeout")]
    pub script_timeout_secs: u64,
}

fn default_true() -> bool {
    true
}

fn default_ping_attempts() -> u32 {
    4
}

fn default_ping_timeout() -> u64 {
    2
}

fn default_probe_timeout() -> u64 {
    5
}

fn default_script_timeout() -> u64 {
    60
}

impl Default for VerifyConfig {
    fn default() -> Self {
        Self {
            heartbeat: default_true(),
            ping_attempts: default_ping_attempts(),
            ping_timeout_secs: default_ping_timeout(),
            tcp_ports: Vec::new(),
            port_timeout_secs: default_probe_timeout(),
            http_urls: Vec::new(),
            http_timeout_secs: default_probe_timeout(),
            check_dns: false,
            insecure_tls: false,
            script_path: None,
            script_timeout_secs: default_script_timeout(),
        }
    }
}

/// One workload to verify
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    /// Workload name as the catalog knows it
    pub name: String,

    /// Catalog job the restore points come from
    pub job: String,

    /// Boot tier; targets without one run in the implicit final tier
    #[serde(default)]
    pub tier: Option<u32>,
}

/// Full configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub api: ApiConfig,

    #[serde(default)]
    pub catalog: CatalogConfig,

    #[serde(default)]
    pub recovery: RecoveryConfig,

    #[serde(default)]
    pub verify: VerifyConfig,

    #[serde(default)]
    pub targets: Vec<TargetConfig>,
}

impl Config {
    /// Load config from the standard locations, or return defaults.
    pub fn load() -> Self {
        Self::load_from_path(CONFIG_PATH)
            .or_else(|_| Self::load_from_path(DEFAULT_CONFIG_PATH))
            .unwrap_or_else(|e| {
                warn!("Config not found, using defaults: {}", e);
                Config::default()
            })
    }

    /// Load config from a specific path.
    pub fn load_from_path(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!("Loaded config from {}", path);
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.api.retry_count <= MAX_RETRY_BUDGET,
            "api.retry_count {} outside the supported range 0..={}",
            self.api.retry_count,
            MAX_RETRY_BUDGET
        );
        anyhow::ensure!(self.recovery.max_concurrent >= 1, "recovery.max_concurrent must be >= 1");
        Ok(())
    }
}
