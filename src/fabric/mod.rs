pub mod topology;

use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

pub use self::topology::TopologyView;

/// Port number, unique within one switch.
pub type PortId = u32;

/// Datapath id of a fabric switch (e.g. "00:65:5c:8a:38:3e:cd:28").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SwitchId(Arc<str>);

impl SwitchId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SwitchId {
    fn from(s: &str) -> Self {
        Self(Arc::from(s))
    }
}

impl From<String> for SwitchId {
    fn from(s: String) -> Self {
        Self(Arc::from(s))
    }
}

impl fmt::Display for SwitchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// TCP 4-tuple identifying one flow entry in the statistics table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FlowKey {
    pub src_ip: Ipv4Addr,
    pub dst_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

impl FlowKey {
    pub fn new(src_ip: Ipv4Addr, dst_ip: Ipv4Addr, src_port: u16, dst_port: u16) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
        }
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}->{}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Cumulative flow-entry counters as reported in one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounterSample {
    pub packet_count: u64,
    pub byte_count: u64,
}

/// Cumulative port counters as reported in one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortCounterSample {
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_packets: u64,
    pub tx_bytes: u64,
}

/// One flow entry from a switch's flow table, already filtered to the
/// statistics table and to entries carrying the full 4-tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRecord {
    pub key: FlowKey,
    pub sample: FlowCounterSample,
}

/// One port entry from a switch's port-stats reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRecord {
    pub port: PortId,
    pub sample: PortCounterSample,
}

/// Big-endian integer value of an IPv4 address.
pub fn ip_to_u32(ip: Ipv4Addr) -> u32 {
    u32::from(ip)
}
