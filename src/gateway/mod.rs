pub mod parse;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::config::ControllerConfig;
use crate::error::TransportError;
use crate::fabric::SwitchId;

pub use self::parse::{FlowBatch, PortBatch};

/// Callback type for recording controller request metrics.
/// Receives (endpoint_name, status, duration).
pub type MetricsCallback = Box<dyn Fn(&str, &str, Duration) + Send + Sync>;

const SWITCHES_PATH: &str = "/wm/core/controller/switches/json";

/// Read side of the SDN controller: switch list plus flow and port counters.
pub trait StatsGateway: Send + Sync {
    /// Switches currently connected to the controller.
    fn fetch_switches(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<SwitchId>, TransportError>> + Send;

    /// Statistics-table flow entries of one switch.
    fn fetch_flows(
        &self,
        switch: &SwitchId,
    ) -> impl std::future::Future<Output = Result<FlowBatch, TransportError>> + Send;

    /// Port counters of one switch.
    fn fetch_ports(
        &self,
        switch: &SwitchId,
    ) -> impl std::future::Future<Output = Result<PortBatch, TransportError>> + Send;

    /// Flow entries of every switch in one request.
    fn fetch_all_flows(
        &self,
    ) -> impl std::future::Future<Output = Result<BTreeMap<SwitchId, FlowBatch>, TransportError>> + Send;

    /// Port counters of every switch in one request.
    fn fetch_all_ports(
        &self,
    ) -> impl std::future::Future<Output = Result<BTreeMap<SwitchId, PortBatch>, TransportError>> + Send;
}

/// HTTP client for a Floodlight-style REST API.
pub struct Client {
    http: reqwest::Client,
    endpoint: String,
    stats_table: u8,
    metrics: Option<MetricsCallback>,
}

impl Client {
    /// Create a new controller client. Only flow entries in `stats_table`
    /// are returned.
    pub fn new(cfg: &ControllerConfig, stats_table: u8) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        Ok(Self {
            http,
            endpoint: cfg.base_url(),
            stats_table,
            metrics: None,
        })
    }

    /// Set a metrics callback for recording request stats.
    pub fn with_metrics(mut self, cb: MetricsCallback) -> Self {
        self.metrics = Some(cb);
        self
    }

    fn record_request(&self, endpoint: &str, status: &str, duration: Duration) {
        if let Some(ref cb) = self.metrics {
            cb(endpoint, status, duration);
        }
    }

    /// Perform a GET request and decode the body as untyped JSON.
    async fn get_json(&self, path: &str) -> Result<serde_json::Value, TransportError> {
        let start = Instant::now();
        let endpoint = endpoint_from_path(path);
        let url = format!("{}{}", self.endpoint, path);

        let response = match self
            .http
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await
        {
            Ok(r) => r,
            Err(source) => {
                let status = if source.is_timeout() { "timeout" } else { "error" };
                self.record_request(endpoint, status, start.elapsed());
                return Err(TransportError::Request {
                    path: path.to_string(),
                    source,
                });
            }
        };

        let status_code = response.status();

        if !status_code.is_success() {
            let body = response.text().await.unwrap_or_default();
            self.record_request(endpoint, "error", start.elapsed());
            return Err(TransportError::Status {
                path: path.to_string(),
                status: status_code.as_u16(),
                body,
            });
        }

        let value = match response.json().await {
            Ok(v) => v,
            Err(source) => {
                self.record_request(endpoint, "error", start.elapsed());
                return Err(TransportError::Decode {
                    path: path.to_string(),
                    source,
                });
            }
        };

        self.record_request(endpoint, "success", start.elapsed());

        Ok(value)
    }
}

fn flows_path(target: &str) -> String {
    format!("/wm/core/switch/{target}/flow/json")
}

fn ports_path(target: &str) -> String {
    format!("/wm/core/switch/{target}/port/json")
}

/// Extract a short endpoint name from an API path.
fn endpoint_from_path(path: &str) -> &'static str {
    if path == SWITCHES_PATH {
        return "switches";
    }

    match (path.starts_with("/wm/core/switch/all/"), path) {
        (true, p) if p.ends_with("/flow/json") => "all_flows",
        (true, p) if p.ends_with("/port/json") => "all_ports",
        (false, p) if p.ends_with("/flow/json") => "flows",
        (false, p) if p.ends_with("/port/json") => "ports",
        _ => "other",
    }
}

fn malformed(path: String, reason: String) -> TransportError {
    TransportError::Malformed { path, reason }
}

fn log_schema_errors(switch: &SwitchId, errors: &[crate::error::SchemaError]) {
    for e in errors {
        debug!(switch = %switch, error = %e, "record excluded");
    }
}

impl StatsGateway for Client {
    async fn fetch_switches(&self) -> Result<Vec<SwitchId>, TransportError> {
        debug!("fetching connected switches");

        let body = self.get_json(SWITCHES_PATH).await?;
        let (switches, errors) =
            parse::parse_switches(&body).map_err(|r| malformed(SWITCHES_PATH.to_string(), r))?;

        for e in &errors {
            debug!(error = %e, "switch entry excluded");
        }

        Ok(switches)
    }

    async fn fetch_flows(&self, switch: &SwitchId) -> Result<FlowBatch, TransportError> {
        let path = flows_path(switch.as_str());
        let body = self.get_json(&path).await?;

        let batch = parse::parse_flow_reply(&body, switch, self.stats_table)
            .map_err(|r| malformed(path, r))?;
        log_schema_errors(switch, &batch.errors);

        Ok(batch)
    }

    async fn fetch_ports(&self, switch: &SwitchId) -> Result<PortBatch, TransportError> {
        let path = ports_path(switch.as_str());
        let body = self.get_json(&path).await?;

        let batch = parse::parse_port_reply(&body, switch).map_err(|r| malformed(path, r))?;
        log_schema_errors(switch, &batch.errors);

        Ok(batch)
    }

    async fn fetch_all_flows(&self) -> Result<BTreeMap<SwitchId, FlowBatch>, TransportError> {
        let path = flows_path("all");
        let body = self.get_json(&path).await?;
        let parts = parse::split_bulk(&body).map_err(|r| malformed(path.clone(), r))?;

        let mut out = BTreeMap::new();
        for (switch, reply) in parts {
            match parse::parse_flows(reply, self.stats_table) {
                Ok(batch) => {
                    log_schema_errors(&switch, &batch.errors);
                    out.insert(switch, batch);
                }
                Err(reason) => warn!(switch = %switch, reason, "malformed flow reply in bulk payload"),
            }
        }

        Ok(out)
    }

    async fn fetch_all_ports(&self) -> Result<BTreeMap<SwitchId, PortBatch>, TransportError> {
        let path = ports_path("all");
        let body = self.get_json(&path).await?;
        let parts = parse::split_bulk(&body).map_err(|r| malformed(path.clone(), r))?;

        let mut out = BTreeMap::new();
        for (switch, reply) in parts {
            match parse::parse_ports(reply) {
                Ok(batch) => {
                    log_schema_errors(&switch, &batch.errors);
                    out.insert(switch, batch);
                }
                Err(reason) => warn!(switch = %switch, reason, "malformed port reply in bulk payload"),
            }
        }

        Ok(out)
    }
}
