//! Configuration handling for the uplink service.
//!
//! Settings come from a YAML file, then `UPLINK_*` environment variables,
//! then command line flags. A missing or unparsable file falls back to the
//! defaults.

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use uplink_channel::{
    ChannelConfig, FailoverPolicy, ServerDescriptor, ServerRole, TransportProtocolId,
    DEFAULT_KEEP_ALIVE,
};

/// Server entry as written in the config file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerEntry {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
    /// Hex encoded X25519 public key of the server
    pub public_key: String,
}

impl ServerEntry {
    /// Parse `host:port:hexkey`
    pub fn parse(entry: &str) -> Result<Self> {
        let mut parts = entry.rsplitn(3, ':');
        let (Some(public_key), Some(port), Some(host)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(anyhow!("expected host:port:public_key, got {:?}", entry));
        };
        Ok(Self {
            host: host.to_string(),
            port: port
                .parse()
                .with_context(|| format!("invalid port in {:?}", entry))?,
            public_key: public_key.to_string(),
        })
    }

    /// Descriptor for a server of `role` speaking the TCP protocol
    pub fn descriptor(&self, role: ServerRole) -> Result<ServerDescriptor> {
        let public_key = hex::decode(&self.public_key)
            .with_context(|| format!("invalid public key for {}:{}", self.host, self.port))?;
        if public_key.len() != 32 {
            return Err(anyhow!(
                "public key for {}:{} must be 32 bytes, got {}",
                self.host,
                self.port,
                public_key.len()
            ));
        }
        Ok(ServerDescriptor {
            host: self.host.clone(),
            port: self.port,
            protocol: TransportProtocolId::TCP,
            role,
            public_key,
        })
    }
}

/// Failover settings; durations use humantime notation such as `5s`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailoverSettings {
    /// Delay before the first retry
    pub retry_delay: String,
    /// Delay growth factor, 1 for a fixed delay
    pub backoff_multiplier: u32,
    /// Upper bound of the retry delay
    pub max_retry_delay: String,
    /// Consecutive failover requests before giving up
    pub max_consecutive_failures: Option<u32>,
    /// Window in which repeated failures of one server count once
    pub failure_resolution_timeout: String,
}

impl Default for FailoverSettings {
    fn default() -> Self {
        Self {
            retry_delay: "5s".to_string(),
            backoff_multiplier: 2,
            max_retry_delay: "5m".to_string(),
            max_consecutive_failures: None,
            failure_resolution_timeout: "10s".to_string(),
        }
    }
}

/// Uplink service configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UplinkConfig {
    /// Keep-alive negotiated with the server, in seconds
    pub keep_alive: u16,
    /// TCP connect timeout
    pub connect_timeout: String,
    /// `host:port` probed to tell a dead server from a dead network
    pub connectivity_probe: Option<String>,
    /// Failover policy
    pub failover: FailoverSettings,
    /// Operations servers in preference order
    pub operations_servers: Vec<ServerEntry>,
    /// Bootstrap servers in preference order
    pub bootstrap_servers: Vec<ServerEntry>,
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
            connect_timeout: "10s".to_string(),
            connectivity_probe: None,
            failover: FailoverSettings::default(),
            operations_servers: Vec::new(),
            bootstrap_servers: Vec::new(),
        }
    }
}

/// Root configuration structure (matches the YAML structure)
#[derive(Debug, Deserialize)]
struct RootConfig {
    uplink: Option<UplinkConfig>,
}

impl UplinkConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let mut config = match std::fs::read_to_string(path) {
            Ok(content) => match serde_yaml::from_str::<RootConfig>(&content) {
                Ok(RootConfig { uplink: Some(config) }) => {
                    info!("Loaded configuration from {:?}", path);
                    config
                }
                Ok(RootConfig { uplink: None }) => {
                    warn!("No uplink section in {:?}, using defaults", path);
                    Self::default()
                }
                Err(e) => {
                    warn!("Failed to parse config file {:?}: {}, using defaults", path, e);
                    Self::default()
                }
            },
            Err(_) => {
                warn!("Config file {:?} not found, using defaults", path);
                Self::default()
            }
        };

        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;

        info!(
            "Final uplink configuration: keep_alive={}s, operations_servers={}, bootstrap_servers={}, probe={:?}",
            config.keep_alive,
            config.operations_servers.len(),
            config.bootstrap_servers.len(),
            config.connectivity_probe
        );
        Ok(config)
    }

    /// Apply `UPLINK_*` overrides looked up through `lookup`
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(value) = lookup("UPLINK_KEEP_ALIVE") {
            self.keep_alive = value
                .parse()
                .with_context(|| format!("invalid UPLINK_KEEP_ALIVE {:?}", value))?;
            info!("Keep-alive overridden by environment: {}s", self.keep_alive);
        }
        if let Some(value) = lookup("UPLINK_CONNECT_TIMEOUT") {
            self.connect_timeout = value;
        }
        if let Some(value) = lookup("UPLINK_CONNECTIVITY_PROBE") {
            info!("Connectivity probe overridden by environment: {}", value);
            self.connectivity_probe = Some(value).filter(|v| !v.is_empty());
        }
        if let Some(value) = lookup("UPLINK_RETRY_DELAY") {
            self.failover.retry_delay = value;
        }
        if let Some(value) = lookup("UPLINK_MAX_CONSECUTIVE_FAILURES") {
            self.failover.max_consecutive_failures = Some(
                value
                    .parse()
                    .with_context(|| format!("invalid UPLINK_MAX_CONSECUTIVE_FAILURES {:?}", value))?,
            );
        }
        if let Some(value) = lookup("UPLINK_OPERATIONS_SERVERS") {
            self.operations_servers = parse_server_list(&value)?;
            info!(
                "Operations servers overridden by environment: {} entries",
                self.operations_servers.len()
            );
        }
        if let Some(value) = lookup("UPLINK_BOOTSTRAP_SERVERS") {
            self.bootstrap_servers = parse_server_list(&value)?;
        }
        Ok(())
    }

    /// Check that every value can be turned into runtime settings
    pub fn validate(&self) -> Result<()> {
        self.channel_config()?;
        self.failover_policy()?;
        self.operations_servers()?;
        self.bootstrap_servers()?;
        Ok(())
    }

    /// Settings for the operations channel
    pub fn channel_config(&self) -> Result<ChannelConfig> {
        Ok(ChannelConfig {
            keep_alive: self.keep_alive,
            connect_timeout: parse_duration("connect_timeout", &self.connect_timeout)?,
            ..ChannelConfig::default()
        })
    }

    /// Failover policy for the shared failover manager
    pub fn failover_policy(&self) -> Result<FailoverPolicy> {
        let settings = &self.failover;
        Ok(FailoverPolicy {
            retry_delay: parse_duration("failover.retry_delay", &settings.retry_delay)?,
            backoff_multiplier: settings.backoff_multiplier,
            max_retry_delay: parse_duration("failover.max_retry_delay", &settings.max_retry_delay)?,
            max_consecutive_failures: settings.max_consecutive_failures,
            failure_resolution_timeout: parse_duration(
                "failover.failure_resolution_timeout",
                &settings.failure_resolution_timeout,
            )?,
            ..FailoverPolicy::default()
        })
    }

    /// Operations server descriptors in preference order
    pub fn operations_servers(&self) -> Result<Vec<ServerDescriptor>> {
        self.operations_servers
            .iter()
            .map(|entry| entry.descriptor(ServerRole::Operations))
            .collect()
    }

    /// Bootstrap server descriptors in preference order
    pub fn bootstrap_servers(&self) -> Result<Vec<ServerDescriptor>> {
        self.bootstrap_servers
            .iter()
            .map(|entry| entry.descriptor(ServerRole::Bootstrap))
            .collect()
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value).with_context(|| format!("invalid {} {:?}", field, value))
}

/// Parse a comma separated list of `host:port:hexkey`
pub fn parse_server_list(value: &str) -> Result<Vec<ServerEntry>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ServerEntry::parse)
        .collect()
}
