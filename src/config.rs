use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::header::{HeaderName, HeaderValue};
use serde::Deserialize;

use crate::fabric::PortId;

/// Upper bound on flow groups per key; keeps the per-key scheduling pass cheap.
pub const MAX_NUM_GROUPS: u32 = 4096;

/// Top-level configuration for the flowsched daemon.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// SDN controller REST connection.
    #[serde(default)]
    pub controller: ControllerConfig,

    /// Epoch loop and scheduling policy.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Static fabric topology.
    #[serde(default)]
    pub topology: TopologyConfig,

    /// Path assignment publishing.
    #[serde(default)]
    pub publisher: PublisherConfig,

    /// Prometheus health metrics server configuration.
    #[serde(default)]
    pub health: HealthConfig,
}

/// SDN controller REST connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Controller REST address, "host:port" or a full URL.
    #[serde(default)]
    pub endpoint: String,

    /// Per-request timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// How switch statistics are fetched. Default: per_switch.
    #[serde(default)]
    pub poll_mode: PollMode,

    /// Concurrent per-switch polls. Default: 8.
    #[serde(default = "default_poll_workers")]
    pub poll_workers: usize,
}

/// Statistics polling strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PollMode {
    /// One flow and one port request per switch, through a bounded worker pool.
    #[default]
    PerSwitch,
    /// Two requests against the controller's `all` endpoints.
    Bulk,
}

/// Epoch loop and scheduling policy.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Flow groups per group key. Default: 2.
    #[serde(default = "default_num_groups")]
    pub num_groups: u32,

    /// Epoch interval. Default: 1s.
    #[serde(default = "default_epoch_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// How the interval relates to processing time. Default: fixed_delay.
    #[serde(default)]
    pub pacing: Pacing,

    /// Group key domain. Default: per_switch.
    #[serde(default)]
    pub grouping: GroupingMode,

    /// Group id hash. Default: ports_and_addresses.
    #[serde(default)]
    pub hash_policy: HashPolicy,

    /// Flow table whose entries are counted. Default: 200 (0xc8).
    #[serde(default = "default_stats_table_id")]
    pub stats_table_id: u8,

    /// Evict counters not seen for this many epochs (0 disables). Default: 0.
    #[serde(default)]
    pub counter_ttl_epochs: u64,
}

/// Epoch pacing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Pacing {
    /// Sleep the full interval after each epoch; epoch length drifts with
    /// processing time.
    #[default]
    FixedDelay,
    /// Interval measured start to start; overrunning epochs skip ticks.
    FixedRate,
}

/// Which identity a flow group is scheduled under.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupingMode {
    /// Group key is the switch that reported the flow.
    #[default]
    PerSwitch,
    /// Group key is the (source, destination) address pair.
    PerPair,
}

/// Inputs to the group id hash.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HashPolicy {
    /// src_port ^ dst_port.
    Ports,
    /// src_ip ^ dst_ip ^ src_port ^ dst_port.
    #[default]
    PortsAndAddresses,
}

/// Static fabric topology, inline or in a separate YAML file.
#[derive(Debug, Default, Clone, Deserialize)]
pub struct TopologyConfig {
    /// Path to a topology YAML file with a top-level `switches` list.
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Inline switch definitions.
    #[serde(default)]
    pub switches: Vec<SwitchConfig>,
}

/// One switch in the topology.
#[derive(Debug, Clone, Deserialize)]
pub struct SwitchConfig {
    /// Datapath id as reported by the controller.
    pub dpid: String,

    /// Optional friendly name for logs.
    #[serde(default)]
    pub name: String,

    /// Egress ports toward the spine layer.
    #[serde(default)]
    pub uplinks: Vec<PortId>,

    /// Endpoints directly attached to this switch.
    #[serde(default)]
    pub hosts: Vec<HostAttachment>,
}

/// An endpoint address and the switch port it hangs off.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct HostAttachment {
    pub ip: Ipv4Addr,
    pub port: PortId,
}

/// Path assignment publishing.
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Push assignments to the controller. When false, assignments are only
    /// logged. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Publisher base address. Empty means the controller endpoint.
    #[serde(default)]
    pub endpoint: String,

    /// REST path receiving the assignment. Default: "/wm/forwarding/json".
    #[serde(default = "default_publisher_path")]
    pub path: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_request_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Additional HTTP headers.
    #[serde(default)]
    pub headers: HashMap<String, String>,

    /// Body compression (none, gzip, zstd, zlib, snappy). Default: none.
    #[serde(default = "default_compression")]
    pub compression: String,
}

/// Prometheus health metrics server configuration.
#[derive(Debug, Deserialize)]
pub struct HealthConfig {
    /// Listen address. Default: ":9090".
    #[serde(default = "default_health_addr")]
    pub addr: String,
}

// --- Default value functions ---

fn default_log_level() -> String {
    "info".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_poll_workers() -> usize {
    8
}

fn default_num_groups() -> u32 {
    2
}

fn default_epoch_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_stats_table_id() -> u8 {
    0xc8
}

fn default_true() -> bool {
    true
}

fn default_publisher_path() -> String {
    "/wm/forwarding/json".to_string()
}

fn default_compression() -> String {
    "none".to_string()
}

fn default_health_addr() -> String {
    ":9090".to_string()
}

// --- Default trait impls ---

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            controller: ControllerConfig::default(),
            scheduler: SchedulerConfig::default(),
            topology: TopologyConfig::default(),
            publisher: PublisherConfig::default(),
            health: HealthConfig::default(),
        }
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_request_timeout(),
            poll_mode: PollMode::default(),
            poll_workers: default_poll_workers(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_groups: default_num_groups(),
            interval: default_epoch_interval(),
            pacing: Pacing::default(),
            grouping: GroupingMode::default(),
            hash_policy: HashPolicy::default(),
            stats_table_id: default_stats_table_id(),
            counter_ttl_epochs: 0,
        }
    }
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: String::new(),
            path: default_publisher_path(),
            timeout: default_request_timeout(),
            headers: HashMap::new(),
            compression: default_compression(),
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            addr: default_health_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Log filter to install: the command-line value when given, otherwise
    /// the configured `log_level`.
    pub fn log_filter<'a>(&'a self, flag: Option<&'a str>) -> &'a str {
        match flag {
            Some(f) if !f.is_empty() => f,
            _ if !self.log_level.is_empty() => &self.log_level,
            _ => "info",
        }
    }

    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        let mut cfg: Config = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing config file {}", path.display()))?;

        // Relative topology paths are resolved against the config file.
        if let Some(topo) = cfg.topology.path.as_mut() {
            if topo.is_relative() {
                if let Some(dir) = path.parent() {
                    *topo = dir.join(&*topo);
                }
            }
        }

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.controller.endpoint.is_empty() {
            bail!("controller.endpoint is required");
        }

        if self.controller.poll_workers == 0 {
            bail!("controller.poll_workers must be positive");
        }

        if self.scheduler.num_groups == 0 {
            bail!("scheduler.num_groups must be positive");
        }

        if self.scheduler.num_groups > MAX_NUM_GROUPS {
            bail!(
                "scheduler.num_groups must be at most {MAX_NUM_GROUPS}, got {}",
                self.scheduler.num_groups
            );
        }

        if self.scheduler.interval.is_zero() {
            bail!("scheduler.interval must be positive");
        }

        if self.topology.path.is_none() && self.topology.switches.is_empty() {
            bail!("topology.path or topology.switches is required");
        }

        if self.publisher.enabled {
            if !self.publisher.path.starts_with('/') {
                bail!("publisher.path must start with '/'");
            }

            let compression = &self.publisher.compression;
            match compression.as_str() {
                "none" | "gzip" | "zstd" | "zlib" | "snappy" => {}
                _ => bail!("invalid compression type: {compression}"),
            }

            for (name, value) in &self.publisher.headers {
                HeaderName::from_bytes(name.as_bytes())
                    .with_context(|| format!("invalid publisher header name {name:?}"))?;
                HeaderValue::from_str(value)
                    .with_context(|| format!("invalid value for publisher header {name:?}"))?;
            }
        }

        Ok(())
    }
}

impl ControllerConfig {
    /// Controller base URL with a scheme and without a trailing slash.
    pub fn base_url(&self) -> String {
        normalize_base_url(&self.endpoint)
    }
}

impl PublisherConfig {
    /// Full URL the assignment is posted to.
    pub fn url(&self, controller: &ControllerConfig) -> String {
        let base = if self.endpoint.is_empty() {
            controller.base_url()
        } else {
            normalize_base_url(&self.endpoint)
        };
        format!("{base}{}", self.path)
    }
}

fn normalize_base_url(endpoint: &str) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}
