//! Static fabric topology: which egress ports may carry a group's traffic.
//!
//! Loaded once at startup and never mutated. Topology changes need a
//! restart.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use tracing::{info, warn};

use super::{PortId, SwitchId};
use crate::config::{SwitchConfig, TopologyConfig};
use crate::error::ConfigurationError;
use crate::sched::GroupKey;

/// Topology file layout when `topology.path` is used.
#[derive(Debug, Deserialize)]
struct TopologyFile {
    #[serde(default)]
    switches: Vec<SwitchConfig>,
}

#[derive(Debug, Clone)]
struct SwitchEntry {
    name: String,
    /// Sorted, deduplicated.
    uplinks: Vec<PortId>,
}

/// Ports eligible for one group key, scoped to the switch that owns them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateSet {
    pub switch: SwitchId,
    pub ports: Vec<PortId>,
}

/// Immutable view of the configured fabric.
#[derive(Debug, Clone)]
pub struct TopologyView {
    switches: BTreeMap<SwitchId, SwitchEntry>,
    attachments: HashMap<Ipv4Addr, (SwitchId, PortId)>,
}

impl TopologyView {
    /// Build the view from configuration, reading `topology.path` if set.
    pub fn load(cfg: &TopologyConfig) -> Result<Self> {
        let switches = match &cfg.path {
            Some(path) => {
                if !cfg.switches.is_empty() {
                    bail!("topology.path and inline topology.switches are mutually exclusive");
                }
                read_topology_file(path)?
            }
            None => cfg.switches.clone(),
        };

        let view = Self::from_switches(&switches)?;

        info!(
            switches = view.switches.len(),
            hosts = view.attachments.len(),
            "topology loaded",
        );

        Ok(view)
    }

    /// Build and validate the view from switch definitions.
    pub fn from_switches(switches: &[SwitchConfig]) -> Result<Self> {
        if switches.is_empty() {
            bail!("topology has no switches");
        }

        let mut by_id = BTreeMap::new();
        let mut attachments = HashMap::new();

        for sw in switches {
            if sw.dpid.is_empty() {
                bail!("topology switch with empty dpid");
            }

            let id = SwitchId::from(sw.dpid.as_str());

            let mut uplinks = sw.uplinks.clone();
            uplinks.sort_unstable();
            uplinks.dedup();

            if uplinks.is_empty() {
                warn!(switch = %id, "switch has no uplink ports; it cannot own a group key");
            }

            for host in &sw.hosts {
                if let Some((other, _)) = attachments.insert(host.ip, (id.clone(), host.port)) {
                    bail!(
                        "host {} is attached to both {} and {}",
                        host.ip,
                        other,
                        id
                    );
                }
            }

            let entry = SwitchEntry {
                name: sw.name.clone(),
                uplinks,
            };

            if by_id.insert(id.clone(), entry).is_some() {
                bail!("duplicate switch dpid in topology: {id}");
            }
        }

        Ok(Self {
            switches: by_id,
            attachments,
        })
    }

    /// Whether the switch is part of the configured fabric.
    pub fn contains(&self, switch: &SwitchId) -> bool {
        self.switches.contains_key(switch)
    }

    /// All configured switches, in dpid order.
    pub fn switches(&self) -> impl Iterator<Item = &SwitchId> {
        self.switches.keys()
    }

    /// Human-readable name configured for a switch, if any.
    pub fn name(&self, switch: &SwitchId) -> Option<&str> {
        self.switches
            .get(switch)
            .map(|e| e.name.as_str())
            .filter(|n| !n.is_empty())
    }

    /// The switch and port an endpoint address is attached to.
    pub fn attachment(&self, ip: Ipv4Addr) -> Option<(&SwitchId, PortId)> {
        self.attachments.get(&ip).map(|(sw, port)| (sw, *port))
    }

    /// Candidate egress ports for a group key.
    ///
    /// Per-switch keys use the switch's uplinks. Per-pair keys use the
    /// destination's attachment port when both ends share a leaf, otherwise
    /// the source leaf's uplinks.
    pub fn candidates(&self, key: &GroupKey) -> Result<CandidateSet, ConfigurationError> {
        let set = match key {
            GroupKey::Switch(switch) => {
                let entry = self
                    .switches
                    .get(switch)
                    .ok_or_else(|| ConfigurationError::UnknownSwitch(switch.clone()))?;
                CandidateSet {
                    switch: switch.clone(),
                    ports: entry.uplinks.clone(),
                }
            }
            GroupKey::Pair { src, dst } => {
                let (src_switch, _) = self
                    .attachments
                    .get(src)
                    .ok_or_else(|| ConfigurationError::UnknownGroupKey(key.clone()))?;

                match self.attachments.get(dst) {
                    Some((dst_switch, dst_port)) if dst_switch == src_switch => CandidateSet {
                        switch: src_switch.clone(),
                        ports: vec![*dst_port],
                    },
                    _ => {
                        let entry = self
                            .switches
                            .get(src_switch)
                            .ok_or_else(|| ConfigurationError::UnknownGroupKey(key.clone()))?;
                        CandidateSet {
                            switch: src_switch.clone(),
                            ports: entry.uplinks.clone(),
                        }
                    }
                }
            }
        };

        if set.ports.is_empty() {
            return Err(ConfigurationError::EmptyCandidateSet(key.clone()));
        }

        Ok(set)
    }
}

fn read_topology_file(path: &Path) -> Result<Vec<SwitchConfig>> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading topology file {}", path.display()))?;

    let file: TopologyFile = serde_yaml::from_str(&data)
        .with_context(|| format!("parsing topology file {}", path.display()))?;

    Ok(file.switches)
}
