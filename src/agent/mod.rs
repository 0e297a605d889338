pub mod epoch;

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::export::health::HealthMetrics;
use crate::fabric::TopologyView;
use crate::gateway::{self, StatsGateway};
use crate::publish::HttpPublisher;

pub use self::epoch::{DriverSettings, EpochDriver, EpochOutcome, EpochReport, Phase};

/// Agent wires configuration, controller clients and metrics together and
/// owns the epoch driver task.
pub struct Agent {
    cfg: Config,
    health: Arc<HealthMetrics>,
    driver: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

impl Agent {
    /// Creates a new Agent, initializing health metrics.
    pub fn new(cfg: Config) -> Result<Self> {
        let health =
            Arc::new(HealthMetrics::new(&cfg.health.addr).context("creating health metrics")?);

        Ok(Self {
            cfg,
            health,
            driver: None,
            cancel: CancellationToken::new(),
        })
    }

    /// Run startup checks and spawn the epoch loop.
    ///
    /// An unloadable topology or an unreachable controller is fatal here;
    /// once the loop runs, failures are contained to a single epoch.
    pub async fn start(&mut self) -> Result<()> {
        // 0. Start health metrics server first so probes respond.
        self.health
            .start()
            .await
            .context("starting health metrics server")?;

        // 1. Load the static topology.
        let topology = TopologyView::load(&self.cfg.topology).context("loading topology")?;

        // 2. Reach the controller.
        let gateway = self.create_gateway()?;

        let switches = gateway
            .fetch_switches()
            .await
            .context("fetching connected switches")?;

        if switches.is_empty() {
            warn!("controller reports no connected switches yet");
        }

        info!(
            connected = switches.len(),
            endpoint = %self.cfg.controller.base_url(),
            "controller reachable",
        );
        self.health.switches_connected.set(switches.len() as f64);

        for switch in topology.switches() {
            if !switches.contains(switch) {
                warn!(switch = %switch, "topology switch not connected to controller");
            }
        }

        // 3. Path publisher.
        let publisher = HttpPublisher::new(&self.cfg.publisher, &self.cfg.controller)
            .context("creating path publisher")?;

        if publisher.is_enabled() {
            info!(
                url = publisher.url(),
                compression = %self.cfg.publisher.compression,
                "path publisher configured",
            );
        } else {
            warn!("path publisher disabled, assignments will only be logged");
        }

        // 4. Spawn the epoch loop.
        let driver = EpochDriver::new(
            DriverSettings::from_config(&self.cfg),
            topology,
            Arc::new(gateway),
            publisher,
        )
        .with_metrics(Arc::clone(&self.health));

        self.driver = Some(tokio::spawn(driver.run(self.cancel.child_token())));

        info!("agent fully started");

        Ok(())
    }

    /// Stop the epoch loop and the health server.
    pub async fn stop(&mut self) -> Result<()> {
        self.cancel.cancel();

        if let Some(handle) = self.driver.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "epoch driver task failed");
            }
        }

        self.health.stop().await?;

        Ok(())
    }

    /// Create a controller client with metrics callback.
    fn create_gateway(&self) -> Result<gateway::Client> {
        let client = gateway::Client::new(
            &self.cfg.controller,
            self.cfg.scheduler.stats_table_id,
        )
        .context("creating controller client")?;

        let health = Arc::clone(&self.health);
        let client = client.with_metrics(Box::new(move |endpoint, status, duration| {
            health
                .gateway_requests_total
                .with_label_values(&[endpoint, status])
                .inc();
            health
                .gateway_request_duration
                .with_label_values(&[endpoint])
                .observe(duration.as_secs_f64());
        }));

        Ok(client)
    }
}
