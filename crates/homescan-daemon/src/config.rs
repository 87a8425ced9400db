//! Configuration loading and validation

use anyhow::{bail, Result};
use homescan_core::{CandidateDevice, PropertyValue, ScopeId};
use homescan_discovery::{Probe, ScanScope, StaticProbe, TcpPortProbe, TcpProbeConfig};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default, rename = "scope")]
    pub scopes: Vec<ScopeConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Fixed delay between background passes in seconds
    #[serde(default = "default_interval")]
    pub default_interval_secs: u64,
    /// Scan deadline in seconds
    #[serde(default = "default_timeout")]
    pub default_timeout_secs: u64,
    /// Delay before the first background pass in seconds
    #[serde(default)]
    pub initial_delay_secs: u64,
    /// Accept inbox results straight into the registry
    #[serde(default)]
    pub auto_approve: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            default_interval_secs: default_interval(),
            default_timeout_secs: default_timeout(),
            initial_delay_secs: 0,
            auto_approve: false,
        }
    }
}

fn default_interval() -> u64 {
    60
}

fn default_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

/// One bridge or controller discovery runs under
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopeConfig {
    pub id: String,
    /// Accepted type tags; empty accepts every tag
    #[serde(default)]
    pub supported_types: Vec<String>,
    /// Run background discovery for this scope
    #[serde(default = "default_true")]
    pub background: bool,
    pub interval_secs: Option<u64>,
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub remove_stale_results: bool,
    pub probe: ProbeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum ProbeConfig {
    Tcp {
        subnet: Ipv4Addr,
        #[serde(default = "default_prefix")]
        prefix_len: u8,
        port: u16,
        type_tag: String,
        #[serde(default = "default_connect_timeout")]
        connect_timeout_ms: u64,
        #[serde(default = "default_max_concurrent")]
        max_concurrent: usize,
    },
    Static {
        #[serde(default)]
        devices: Vec<StaticDeviceConfig>,
    },
}

fn default_prefix() -> u8 {
    24
}

fn default_connect_timeout() -> u64 {
    homescan_discovery::DEFAULT_CONNECT_TIMEOUT_MS
}

fn default_max_concurrent() -> usize {
    homescan_discovery::DEFAULT_MAX_CONCURRENT
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticDeviceConfig {
    pub raw_id: String,
    #[serde(default)]
    pub name: String,
    pub type_tag: String,
    #[serde(default)]
    pub properties: HashMap<String, PropertyValue>,
}

impl ProbeConfig {
    pub fn build(&self) -> Arc<dyn Probe> {
        match self {
            Self::Tcp {
                subnet,
                prefix_len,
                port,
                type_tag,
                connect_timeout_ms,
                max_concurrent,
            } => Arc::new(TcpPortProbe::new(TcpProbeConfig {
                subnet: *subnet,
                prefix_len: *prefix_len,
                port: *port,
                type_tag: type_tag.clone(),
                connect_timeout_ms: *connect_timeout_ms,
                max_concurrent: *max_concurrent,
            })),
            Self::Static { devices } => Arc::new(StaticProbe::new(
                devices
                    .iter()
                    .map(|d| CandidateDevice {
                        raw_id: d.raw_id.clone(),
                        display_name: d.name.clone(),
                        type_tag: d.type_tag.clone(),
                        properties: d.properties.clone(),
                    })
                    .collect(),
            )),
        }
    }
}

impl ScopeConfig {
    pub fn scope_id(&self) -> ScopeId {
        ScopeId::new(self.id.as_str())
    }

    /// Convert to a ScanScope, filling unset values from the daemon defaults
    pub fn to_scan_scope(&self, daemon: &DaemonConfig) -> ScanScope {
        let timeout = self.timeout_secs.unwrap_or(daemon.default_timeout_secs);
        ScanScope::new(self.scope_id())
            .with_supported_types(self.supported_types.iter().cloned())
            .with_timeout(Duration::from_secs(timeout))
            .with_remove_stale_results(self.remove_stale_results)
    }

    pub fn interval(&self, daemon: &DaemonConfig) -> Duration {
        Duration::from_secs(self.interval_secs.unwrap_or(daemon.default_interval_secs))
    }
}

impl Config {
    /// Reject configurations the engine cannot run
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for scope in &self.scopes {
            if scope.id.trim().is_empty() {
                bail!("scope id must not be empty");
            }
            if !seen.insert(scope.id.as_str()) {
                bail!("duplicate scope id {}", scope.id);
            }
            if scope.timeout_secs == Some(0) {
                bail!("scope {}: timeout_secs must be positive", scope.id);
            }
            if scope.interval_secs == Some(0) {
                bail!("scope {}: interval_secs must be positive", scope.id);
            }
            if let ProbeConfig::Tcp { max_concurrent: 0, .. } = scope.probe {
                bail!("scope {}: max_concurrent must be positive", scope.id);
            }
        }
        if self.daemon.default_timeout_secs == 0 {
            bail!("default_timeout_secs must be positive");
        }
        if self.daemon.default_interval_secs == 0 {
            bail!("default_interval_secs must be positive");
        }
        Ok(())
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!(path = %path.display(), scopes = config.scopes.len(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}

/// Save default configuration to file
pub fn save_default_config(path: &Path) -> Result<()> {
    let config = Config {
        daemon: DaemonConfig::default(),
        scopes: vec![ScopeConfig {
            id: "bridge1".to_string(),
            supported_types: vec!["controller".to_string()],
            background: true,
            interval_secs: None,
            timeout_secs: Some(15),
            remove_stale_results: true,
            probe: ProbeConfig::Tcp {
                subnet: Ipv4Addr::new(192, 168, 1, 0),
                prefix_len: default_prefix(),
                port: 80,
                type_tag: "controller".to_string(),
                connect_timeout_ms: default_connect_timeout(),
                max_concurrent: default_max_concurrent(),
            },
        }],
    };

    let content = toml::to_string_pretty(&config)?;
    std::fs::write(path, content)?;
    Ok(())
}
