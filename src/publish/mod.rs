pub mod compress;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::config::{ControllerConfig, PublisherConfig};
use crate::error::TransportError;
use crate::sched::PathAssignment;

pub use self::compress::Compression;

/// How a publish call was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The controller accepted the assignment.
    Accepted,
    /// Publishing is disabled; the assignment was only logged.
    DryRun,
}

impl PublishOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::DryRun => "dry_run",
        }
    }
}

/// Write side of the SDN controller: installs one epoch's path assignment.
pub trait PathPublisher: Send + Sync {
    fn publish(
        &self,
        assignment: &PathAssignment,
    ) -> impl std::future::Future<Output = Result<PublishOutcome, TransportError>> + Send;
}

/// Posts assignments as JSON to the controller's forwarding endpoint.
pub struct HttpPublisher {
    http: reqwest::Client,
    url: String,
    enabled: bool,
    compression: Compression,
    headers: Vec<(String, String)>,
}

impl HttpPublisher {
    pub fn new(cfg: &PublisherConfig, controller: &ControllerConfig) -> Result<Self> {
        let timeout = if cfg.timeout.is_zero() {
            Duration::from_secs(10)
        } else {
            cfg.timeout
        };

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building HTTP client")?;

        let mut headers: Vec<(String, String)> = cfg
            .headers
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        headers.sort();

        Ok(Self {
            http,
            url: cfg.url(controller),
            enabled: cfg.enabled,
            compression: Compression::from_name(&cfg.compression)?,
            headers,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl PathPublisher for HttpPublisher {
    async fn publish(&self, assignment: &PathAssignment) -> Result<PublishOutcome, TransportError> {
        let body =
            serde_json::to_vec(assignment).map_err(|e| TransportError::Encode(e.to_string()))?;

        if !self.enabled {
            info!(
                keys = assignment.len(),
                body = %String::from_utf8_lossy(&body),
                "publishing disabled, assignment not sent",
            );
            return Ok(PublishOutcome::DryRun);
        }

        let raw_len = body.len();
        let start = Instant::now();

        let payload = self
            .compression
            .compress(&body)
            .map_err(|e| TransportError::Encode(format!("{e:#}")))?;

        let mut request = self
            .http
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(payload);

        if let Some(encoding) = self.compression.content_encoding() {
            request = request.header("Content-Encoding", encoding);
        }

        for (k, v) in &self.headers {
            request = request.header(k.as_str(), v.as_str());
        }

        let resp = request.send().await.map_err(|source| TransportError::Request {
            path: self.url.clone(),
            source,
        })?;

        let status = resp.status();
        // Drain body for connection reuse.
        let text = resp.text().await.unwrap_or_default();

        if !status.is_success() {
            return Err(TransportError::Status {
                path: self.url.clone(),
                status: status.as_u16(),
                body: text,
            });
        }

        debug!(
            keys = assignment.len(),
            bytes = raw_len,
            status = status.as_u16(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "published path assignment",
        );

        Ok(PublishOutcome::Accepted)
    }
}
