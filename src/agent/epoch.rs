//! The per-epoch control loop.
//!
//! One epoch walks Polling, Classifying, Tracking, Scheduling, Publishing and
//! then Sleeping. Polling fans out over a bounded worker pool; everything
//! after it runs on the driver task alone, one group key at a time, so no two
//! placements ever share a tentative port load.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{Config, GroupingMode, HashPolicy, Pacing, PollMode};
use crate::error::{ConfigurationError, TransportError};
use crate::export::HealthMetrics;
use crate::fabric::{FlowCounterSample, FlowKey, FlowRecord, SwitchId, TopologyView};
use crate::gateway::{FlowBatch, PortBatch, StatsGateway};
use crate::publish::{PathPublisher, PublishOutcome};
use crate::sched::{
    CongestionTracker, CounterStore, FlowClassifier, GreedyScheduler, GroupKey, GroupTable,
    PathAssignment,
};

/// Where the driver currently is within an epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Polling,
    Classifying,
    Tracking,
    Scheduling,
    Publishing,
    Sleeping,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Polling => "polling",
            Self::Classifying => "classifying",
            Self::Tracking => "tracking",
            Self::Scheduling => "scheduling",
            Self::Publishing => "publishing",
            Self::Sleeping => "sleeping",
        }
    }
}

/// How an epoch ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpochOutcome {
    /// Assignment accepted by the controller.
    Published,
    /// Assignment computed and logged, publishing disabled.
    DryRun,
    /// No group key could be scheduled; nothing was published.
    Empty,
    /// The controller rejected or never received the assignment.
    PublishFailed,
    /// The switch list or bulk statistics could not be fetched.
    PollFailed,
    /// Shutdown was requested mid-epoch.
    Cancelled,
}

impl EpochOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::DryRun => "dry_run",
            Self::Empty => "empty",
            Self::PublishFailed => "publish_failed",
            Self::PollFailed => "poll_failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Summary of one epoch, logged and fed to metrics.
#[derive(Debug, Clone)]
pub struct EpochReport {
    pub epoch: u64,
    pub started_at: DateTime<Utc>,
    pub switches_connected: usize,
    pub switches_polled: usize,
    pub switches_failed: usize,
    /// Flow records whose bytes went into a group.
    pub flows_counted: usize,
    /// Outside the statistics table or without a full 4-tuple.
    pub flows_skipped: usize,
    /// Seen on a hop other than the source leaf (per-pair grouping only).
    pub flows_transit: usize,
    pub flows_invalid: usize,
    pub flows_unknown: usize,
    pub ports_sampled: usize,
    pub ports_invalid: usize,
    pub keys_scheduled: usize,
    pub keys_skipped: usize,
    pub counters_evicted: usize,
    pub outcome: EpochOutcome,
    pub duration: Duration,
}

impl EpochReport {
    fn new(epoch: u64) -> Self {
        Self {
            epoch,
            started_at: Utc::now(),
            switches_connected: 0,
            switches_polled: 0,
            switches_failed: 0,
            flows_counted: 0,
            flows_skipped: 0,
            flows_transit: 0,
            flows_invalid: 0,
            flows_unknown: 0,
            ports_sampled: 0,
            ports_invalid: 0,
            keys_scheduled: 0,
            keys_skipped: 0,
            counters_evicted: 0,
            outcome: EpochOutcome::Empty,
            duration: Duration::ZERO,
        }
    }
}

/// Loop and policy knobs, taken from [`Config`].
#[derive(Debug, Clone)]
pub struct DriverSettings {
    pub interval: Duration,
    pub pacing: Pacing,
    pub poll_mode: PollMode,
    pub poll_workers: usize,
    pub num_groups: u32,
    pub grouping: GroupingMode,
    pub hash_policy: HashPolicy,
    pub counter_ttl_epochs: u64,
}

impl DriverSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            interval: cfg.scheduler.interval,
            pacing: cfg.scheduler.pacing,
            poll_mode: cfg.controller.poll_mode,
            poll_workers: cfg.controller.poll_workers,
            num_groups: cfg.scheduler.num_groups,
            grouping: cfg.scheduler.grouping,
            hash_policy: cfg.scheduler.hash_policy,
            counter_ttl_epochs: cfg.scheduler.counter_ttl_epochs,
        }
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Both replies of one successfully polled switch.
struct SwitchStats {
    flows: FlowBatch,
    ports: PortBatch,
}

struct Poll {
    connected: usize,
    stats: BTreeMap<SwitchId, SwitchStats>,
    failures: Vec<(SwitchId, TransportError)>,
    /// Poll tasks that died without reporting a switch.
    lost: usize,
}

/// Owns the counter store and runs epochs until cancelled.
pub struct EpochDriver<G, P> {
    settings: DriverSettings,
    topology: TopologyView,
    gateway: Arc<G>,
    publisher: P,
    classifier: FlowClassifier,
    scheduler: GreedyScheduler,
    store: CounterStore,
    phase: Phase,
    health: Option<Arc<HealthMetrics>>,
}

impl<G, P> EpochDriver<G, P>
where
    G: StatsGateway + 'static,
    P: PathPublisher,
{
    pub fn new(settings: DriverSettings, topology: TopologyView, gateway: Arc<G>, publisher: P) -> Self {
        let classifier =
            FlowClassifier::new(settings.num_groups, settings.grouping, settings.hash_policy);

        Self {
            settings,
            topology,
            gateway,
            publisher,
            classifier,
            scheduler: GreedyScheduler::new(),
            store: CounterStore::new(),
            phase: Phase::Sleeping,
            health: None,
        }
    }

    /// Report epoch results to Prometheus.
    pub fn with_metrics(mut self, health: Arc<HealthMetrics>) -> Self {
        self.health = Some(health);
        self
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn counters(&self) -> &CounterStore {
        &self.store
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Run epochs until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            interval = ?self.settings.interval,
            pacing = ?self.settings.pacing,
            poll_mode = ?self.settings.poll_mode,
            grouping = ?self.settings.grouping,
            num_groups = self.settings.num_groups,
            "epoch driver started",
        );

        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            if self.settings.pacing == Pacing::FixedRate {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
            }

            if cancel.is_cancelled() {
                break;
            }

            let report = self.run_epoch(&cancel).await;
            if report.outcome == EpochOutcome::Cancelled {
                break;
            }

            if self.settings.pacing == Pacing::FixedDelay {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settings.interval) => {}
                }
            }
        }

        info!(epochs = self.store.epoch(), "epoch driver stopped");
    }

    /// Run a single epoch to completion. Never fails: every error is
    /// contained to the switch, record or group key it concerns.
    pub async fn run_epoch(&mut self, cancel: &CancellationToken) -> EpochReport {
        let start = Instant::now();
        let epoch = self.store.begin_epoch();
        let mut report = EpochReport::new(epoch);

        self.enter(epoch, Phase::Polling);
        let poll = match self.poll(cancel).await {
            Ok(poll) => poll,
            Err(TransportError::Cancelled) => {
                report.outcome = EpochOutcome::Cancelled;
                return self.finish(report, start);
            }
            Err(e) => {
                warn!(epoch, error = %e, kind = e.kind(), "statistics poll failed, skipping epoch");
                if let Some(health) = &self.health {
                    health
                        .switch_poll_failures
                        .with_label_values(&[e.kind()])
                        .inc();
                }
                report.outcome = EpochOutcome::PollFailed;
                return self.finish(report, start);
            }
        };

        report.switches_connected = poll.connected;
        report.switches_polled = poll.stats.len();
        report.switches_failed = poll.failures.len() + poll.lost;

        for (switch, e) in &poll.failures {
            warn!(epoch, switch = %switch, error = %e, kind = e.kind(), "switch poll failed");
            if let Some(health) = &self.health {
                health
                    .switch_poll_failures
                    .with_label_values(&[e.kind()])
                    .inc();
            }
        }

        self.enter(epoch, Phase::Classifying);
        let table = self.classify(&poll.stats, &mut report);

        self.enter(epoch, Phase::Tracking);
        for (switch, stats) in &poll.stats {
            for record in &stats.ports.records {
                self.store.update_port(switch, record.port, record.sample);
            }
            report.ports_sampled += stats.ports.records.len();
            report.ports_invalid += stats.ports.errors.len();
        }

        self.enter(epoch, Phase::Scheduling);
        let assignment = self.schedule(&table, &mut report);

        self.enter(epoch, Phase::Publishing);
        report.outcome = self.publish(&assignment, cancel).await;

        report.counters_evicted = self.store.sweep(self.settings.counter_ttl_epochs);

        self.finish(report, start)
    }

    fn enter(&mut self, epoch: u64, phase: Phase) {
        self.phase = phase;
        debug!(epoch, phase = phase.as_str(), "epoch phase");
    }

    async fn poll(&self, cancel: &CancellationToken) -> Result<Poll, TransportError> {
        match self.settings.poll_mode {
            PollMode::PerSwitch => self.poll_per_switch(cancel).await,
            PollMode::Bulk => self.poll_bulk(cancel).await,
        }
    }

    /// Fetch the switch list, then both replies of every switch through a
    /// bounded pool of concurrent requests.
    async fn poll_per_switch(&self, cancel: &CancellationToken) -> Result<Poll, TransportError> {
        let switches = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            r = self.gateway.fetch_switches() => r?,
        };

        let semaphore = Arc::new(Semaphore::new(self.settings.poll_workers.max(1)));
        let mut in_flight = JoinSet::new();

        for switch in &switches {
            let gateway = Arc::clone(&self.gateway);
            let semaphore = Arc::clone(&semaphore);
            let switch = switch.clone();

            in_flight.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return (switch, Err(TransportError::Cancelled)),
                };

                let result = match gateway.fetch_flows(&switch).await {
                    Ok(flows) => gateway
                        .fetch_ports(&switch)
                        .await
                        .map(|ports| SwitchStats { flows, ports }),
                    Err(e) => Err(e),
                };

                (switch, result)
            });
        }

        let mut poll = Poll {
            connected: switches.len(),
            stats: BTreeMap::new(),
            failures: Vec::new(),
            lost: 0,
        };

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    in_flight.abort_all();
                    return Err(TransportError::Cancelled);
                }
                next = in_flight.join_next() => next,
            };

            match next {
                None => break,
                Some(Ok((switch, Ok(stats)))) => {
                    poll.stats.insert(switch, stats);
                }
                Some(Ok((switch, Err(e)))) => poll.failures.push((switch, e)),
                Some(Err(e)) => {
                    warn!(error = %e, "switch poll task failed");
                    poll.lost += 1;
                }
            }
        }

        Ok(poll)
    }

    /// Fetch all flows and all ports with one request each. A switch missing
    /// from either reply counts as failed.
    async fn poll_bulk(&self, cancel: &CancellationToken) -> Result<Poll, TransportError> {
        let fetch = async {
            tokio::try_join!(
                self.gateway.fetch_all_flows(),
                self.gateway.fetch_all_ports()
            )
        };

        let (flows, mut ports) = tokio::select! {
            _ = cancel.cancelled() => return Err(TransportError::Cancelled),
            r = fetch => r?,
        };

        let connected: BTreeSet<&SwitchId> = flows.keys().chain(ports.keys()).collect();
        let mut poll = Poll {
            connected: connected.len(),
            stats: BTreeMap::new(),
            failures: Vec::new(),
            lost: 0,
        };

        for (switch, flow_batch) in flows {
            match ports.remove(&switch) {
                Some(port_batch) => {
                    poll.stats.insert(
                        switch,
                        SwitchStats {
                            flows: flow_batch,
                            ports: port_batch,
                        },
                    );
                }
                None => poll.failures.push((
                    switch,
                    TransportError::Malformed {
                        path: "bulk".to_string(),
                        reason: "switch missing from port reply".to_string(),
                    },
                )),
            }
        }

        for switch in ports.into_keys() {
            poll.failures.push((
                switch,
                TransportError::Malformed {
                    path: "bulk".to_string(),
                    reason: "switch missing from flow reply".to_string(),
                },
            ));
        }

        Ok(poll)
    }

    /// Diff flow counters and bucket the deltas into groups.
    fn classify(
        &mut self,
        stats: &BTreeMap<SwitchId, SwitchStats>,
        report: &mut EpochReport,
    ) -> GroupTable {
        let mut table = GroupTable::new(self.classifier.num_groups());
        let mut unknown = BTreeSet::new();

        for (switch, s) in stats {
            report.flows_skipped += s.flows.skipped;
            report.flows_invalid += s.flows.errors.len();

            if self.classifier.grouping() == GroupingMode::PerSwitch
                && self.topology.contains(switch)
            {
                table.ensure(GroupKey::Switch(switch.clone()));
            }

            for record in merge_duplicates(&s.flows.records) {
                let delta = self.store.update_flow(switch, record.key, record.sample);

                match self.attribute(switch, &record) {
                    Ok(Some(key)) => {
                        table.add(key, self.classifier.group_id(&record.key), delta.bytes);
                        report.flows_counted += 1;
                    }
                    Ok(None) => report.flows_transit += 1,
                    Err(e) => {
                        debug!(switch = %switch, flow = %record.key, error = %e, "flow excluded");
                        report.flows_unknown += 1;
                        unknown.insert(e);
                    }
                }
            }
        }

        for e in &unknown {
            warn!(epoch = report.epoch, error = %e, "group key skipped");
            if let Some(health) = &self.health {
                health
                    .schedule_errors_total
                    .with_label_values(&[e.kind()])
                    .inc();
            }
        }
        report.keys_skipped += unknown.len();

        table
    }

    /// Group key a flow counts toward on `switch`, `None` when this switch is
    /// not where the flow is accounted.
    fn attribute(
        &self,
        switch: &SwitchId,
        record: &FlowRecord,
    ) -> Result<Option<GroupKey>, ConfigurationError> {
        let key = self.classifier.group_key(switch, &record.key);

        match self.classifier.grouping() {
            GroupingMode::PerSwitch => {
                if self.topology.contains(switch) {
                    Ok(Some(key))
                } else {
                    Err(ConfigurationError::UnknownGroupKey(key))
                }
            }
            GroupingMode::PerPair => match self.topology.attachment(record.key.src_ip) {
                None => Err(ConfigurationError::UnknownGroupKey(key)),
                Some((leaf, _)) if leaf == switch => Ok(Some(key)),
                Some(_) => Ok(None),
            },
        }
    }

    /// Place every group key independently, each from a fresh port load.
    fn schedule(&self, table: &GroupTable, report: &mut EpochReport) -> PathAssignment {
        let tracker = CongestionTracker::new(&self.store);
        let mut assignment = PathAssignment::new();

        for (key, groups) in table.iter() {
            let placed = self.topology.candidates(key).and_then(|candidates| {
                self.scheduler
                    .schedule(key, groups, &candidates, &tracker)
                    .map(|outcome| (candidates, outcome))
            });

            match placed {
                Ok((candidates, outcome)) => {
                    debug!(
                        key = %key,
                        ports = candidates.ports.len(),
                        imbalance = outcome.imbalance(),
                        "group key scheduled",
                    );

                    if let Some(health) = &self.health {
                        for (port, load) in &outcome.loads {
                            let port = port.to_string();
                            health
                                .port_load_bytes
                                .with_label_values(&[candidates.switch.as_str(), port.as_str()])
                                .set(*load as f64);
                        }
                    }

                    assignment.insert(key.clone(), outcome.assignment);
                    report.keys_scheduled += 1;
                }
                // Switches without uplinks (spines) own no traffic to place.
                Err(e @ ConfigurationError::EmptyCandidateSet(_))
                    if groups.iter().all(|&bytes| bytes == 0) =>
                {
                    debug!(epoch = report.epoch, key = %key, error = %e, "idle group key skipped");
                    report.keys_skipped += 1;
                }
                Err(e) => {
                    warn!(epoch = report.epoch, key = %key, error = %e, "group key skipped");
                    if let Some(health) = &self.health {
                        health
                            .schedule_errors_total
                            .with_label_values(&[e.kind()])
                            .inc();
                    }
                    report.keys_skipped += 1;
                }
            }
        }

        assignment
    }

    async fn publish(
        &self,
        assignment: &PathAssignment,
        cancel: &CancellationToken,
    ) -> EpochOutcome {
        if assignment.is_empty() {
            debug!("empty assignment, nothing to publish");
            return EpochOutcome::Empty;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => return EpochOutcome::Cancelled,
            r = self.publisher.publish(assignment) => r,
        };

        let (outcome, status) = match result {
            Ok(PublishOutcome::Accepted) => (EpochOutcome::Published, "accepted"),
            Ok(PublishOutcome::DryRun) => (EpochOutcome::DryRun, "dry_run"),
            Err(e) => {
                warn!(keys = assignment.len(), error = %e, kind = e.kind(), "publishing assignment failed");
                (EpochOutcome::PublishFailed, e.kind())
            }
        };

        if let Some(health) = &self.health {
            health.publish_total.with_label_values(&[status]).inc();
        }

        outcome
    }

    fn finish(&mut self, mut report: EpochReport, start: Instant) -> EpochReport {
        report.duration = start.elapsed();
        self.enter(report.epoch, Phase::Sleeping);

        info!(
            epoch = report.epoch,
            started_at = %report.started_at.format("%Y-%m-%d %H:%M:%S%.3f"),
            outcome = report.outcome.as_str(),
            switches = report.switches_polled,
            failed = report.switches_failed,
            flows = report.flows_counted,
            keys = report.keys_scheduled,
            skipped_keys = report.keys_skipped,
            elapsed_ms = report.duration.as_millis() as u64,
            "epoch complete",
        );

        if let Some(health) = self.health.clone() {
            self.observe(&health, &report);
        }

        report
    }

    fn observe(&mut self, health: &HealthMetrics, report: &EpochReport) {
        health
            .epochs_total
            .with_label_values(&[report.outcome.as_str()])
            .inc();
        health
            .epoch_duration
            .observe(report.duration.as_secs_f64());

        if report.outcome == EpochOutcome::PollFailed || report.outcome == EpochOutcome::Cancelled {
            return;
        }

        health.switches_connected.set(report.switches_connected as f64);
        health.group_keys_scheduled.set(report.keys_scheduled as f64);

        for (result, n) in [
            ("counted", report.flows_counted),
            ("skipped", report.flows_skipped),
            ("transit", report.flows_transit),
            ("invalid", report.flows_invalid),
            ("unknown_key", report.flows_unknown),
        ] {
            if n > 0 {
                health
                    .flow_records_total
                    .with_label_values(&[result])
                    .inc_by(n as f64);
            }
        }

        health
            .counter_regressions
            .inc_by(self.store.take_regressions() as f64);
        health
            .counter_evictions
            .inc_by(report.counters_evicted as f64);
        health
            .counter_entries
            .with_label_values(&["port"])
            .set(self.store.port_entries() as f64);
        health
            .counter_entries
            .with_label_values(&["flow"])
            .set(self.store.flow_entries() as f64);
    }
}

/// Sum entries of one reply that share a 4-tuple (e.g. two statistics-table
/// rules with different priorities) so each flow is diffed exactly once.
fn merge_duplicates(records: &[FlowRecord]) -> Vec<FlowRecord> {
    let mut merged: BTreeMap<FlowKey, FlowCounterSample> = BTreeMap::new();

    for record in records {
        let sample = merged.entry(record.key).or_default();
        sample.packet_count = sample
            .packet_count
            .saturating_add(record.sample.packet_count);
        sample.byte_count = sample.byte_count.saturating_add(record.sample.byte_count);
    }

    merged
        .into_iter()
        .map(|(key, sample)| FlowRecord { key, sample })
        .collect()
}
