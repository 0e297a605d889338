use std::collections::BTreeMap;

use crate::fabric::topology::CandidateSet;
use crate::fabric::PortId;

use super::CounterStore;

/// Tentative egress load per candidate port, ordered by port id.
pub type PortLoad = BTreeMap<PortId, u64>;

/// Read-only view over the counter store that turns port deltas into load.
#[derive(Debug, Clone, Copy)]
pub struct CongestionTracker<'a> {
    store: &'a CounterStore,
}

impl<'a> CongestionTracker<'a> {
    pub fn new(store: &'a CounterStore) -> Self {
        Self { store }
    }

    /// Load of every candidate port: its most recent transmit-bytes delta,
    /// zero when the port has never been sampled.
    ///
    /// Returns a fresh map on every call; the scheduler mutates it.
    pub fn port_load(&self, candidates: &CandidateSet) -> PortLoad {
        candidates
            .ports
            .iter()
            .map(|&port| {
                let load = self
                    .store
                    .tx_bytes_delta(&candidates.switch, port)
                    .unwrap_or(0);
                (port, load)
            })
            .collect()
    }
}
