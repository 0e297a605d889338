use std::collections::HashMap;

use crate::fabric::{FlowCounterSample, FlowKey, PortCounterSample, PortId, SwitchId};

/// Per-epoch increase of one monotonic counter. Never negative: a counter
/// that went backwards (reset or wrap) yields zero.
#[inline]
pub fn clamped_delta(current: u64, previous: u64) -> u64 {
    current.saturating_sub(previous)
}

/// Directional port counter deltas for one epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortDelta {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// Flow entry deltas for one epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowDelta {
    pub packets: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct PortEntry {
    baseline: PortCounterSample,
    last_delta: PortDelta,
    last_seen: u64,
}

#[derive(Debug, Clone, Copy)]
struct FlowEntry {
    baseline: FlowCounterSample,
    last_seen: u64,
}

/// Previous-epoch counters per port and per flow, used only for diffing.
///
/// First observation of a key stores the sample as baseline and reports a
/// zero delta. Later observations report `current - previous` clamped at
/// zero and replace the baseline unconditionally, so a counter reset heals
/// after one epoch. Keys missing from a poll are left untouched.
#[derive(Debug, Default)]
pub struct CounterStore {
    ports: HashMap<(SwitchId, PortId), PortEntry>,
    flows: HashMap<(SwitchId, FlowKey), FlowEntry>,
    epoch: u64,
    regressions: u64,
}

impl CounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Advance the epoch stamp used for staleness tracking.
    pub fn begin_epoch(&mut self) -> u64 {
        self.epoch += 1;
        self.epoch
    }

    /// Current epoch stamp.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Record a port sample and return its delta against the previous one.
    pub fn update_port(
        &mut self,
        switch: &SwitchId,
        port: PortId,
        sample: PortCounterSample,
    ) -> PortDelta {
        let epoch = self.epoch;

        match self.ports.get_mut(&(switch.clone(), port)) {
            Some(entry) => {
                let prev = entry.baseline;
                if sample.rx_packets < prev.rx_packets
                    || sample.rx_bytes < prev.rx_bytes
                    || sample.tx_packets < prev.tx_packets
                    || sample.tx_bytes < prev.tx_bytes
                {
                    self.regressions += 1;
                }

                let delta = PortDelta {
                    rx_packets: clamped_delta(sample.rx_packets, prev.rx_packets),
                    rx_bytes: clamped_delta(sample.rx_bytes, prev.rx_bytes),
                    tx_packets: clamped_delta(sample.tx_packets, prev.tx_packets),
                    tx_bytes: clamped_delta(sample.tx_bytes, prev.tx_bytes),
                };

                entry.baseline = sample;
                entry.last_delta = delta;
                entry.last_seen = epoch;
                delta
            }
            None => {
                self.ports.insert(
                    (switch.clone(), port),
                    PortEntry {
                        baseline: sample,
                        last_delta: PortDelta::default(),
                        last_seen: epoch,
                    },
                );
                PortDelta::default()
            }
        }
    }

    /// Record a flow sample (scoped to the switch that reported it) and
    /// return its delta against the previous one.
    pub fn update_flow(
        &mut self,
        switch: &SwitchId,
        key: FlowKey,
        sample: FlowCounterSample,
    ) -> FlowDelta {
        let epoch = self.epoch;

        match self.flows.get_mut(&(switch.clone(), key)) {
            Some(entry) => {
                let prev = entry.baseline;
                if sample.packet_count < prev.packet_count || sample.byte_count < prev.byte_count
                {
                    self.regressions += 1;
                }

                let delta = FlowDelta {
                    packets: clamped_delta(sample.packet_count, prev.packet_count),
                    bytes: clamped_delta(sample.byte_count, prev.byte_count),
                };

                entry.baseline = sample;
                entry.last_seen = epoch;
                delta
            }
            None => {
                self.flows.insert(
                    (switch.clone(), key),
                    FlowEntry {
                        baseline: sample,
                        last_seen: epoch,
                    },
                );
                FlowDelta::default()
            }
        }
    }

    /// Most recent transmit-bytes delta for a port, if it was ever sampled.
    pub fn tx_bytes_delta(&self, switch: &SwitchId, port: PortId) -> Option<u64> {
        self.ports
            .get(&(switch.clone(), port))
            .map(|e| e.last_delta.tx_bytes)
    }

    /// Evict entries not seen during the last `ttl_epochs` epochs.
    /// Returns the number of evicted entries. `ttl_epochs == 0` is a no-op.
    pub fn sweep(&mut self, ttl_epochs: u64) -> usize {
        if ttl_epochs == 0 {
            return 0;
        }

        let epoch = self.epoch;
        let before = self.ports.len() + self.flows.len();

        self.ports
            .retain(|_, e| epoch.saturating_sub(e.last_seen) < ttl_epochs);
        self.flows
            .retain(|_, e| epoch.saturating_sub(e.last_seen) < ttl_epochs);

        before - (self.ports.len() + self.flows.len())
    }

    /// Number of tracked port entries.
    pub fn port_entries(&self) -> usize {
        self.ports.len()
    }

    /// Number of tracked flow entries.
    pub fn flow_entries(&self) -> usize {
        self.flows.len()
    }

    /// Read and reset the count of clamped counter regressions.
    pub fn take_regressions(&mut self) -> u64 {
        std::mem::take(&mut self.regressions)
    }
}
