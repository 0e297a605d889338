//! Congestion-aware multipath scheduling core.
//!
//! Counter diffs feed flow groups, flow groups feed the greedy placement.
//! Everything here is synchronous and single-threaded; the epoch driver owns
//! the only mutable state ([`CounterStore`]).

pub mod assignment;
pub mod classify;
pub mod congestion;
pub mod counters;
pub mod greedy;

use std::fmt;
use std::net::Ipv4Addr;

use crate::fabric::SwitchId;

pub use self::assignment::PathAssignment;
pub use self::classify::{FlowClassifier, GroupTable};
pub use self::congestion::{CongestionTracker, PortLoad};
pub use self::counters::{CounterStore, FlowDelta, PortDelta};
pub use self::greedy::{GreedyScheduler, ScheduleOutcome};

/// Index of a flow group within one group key, in `[0, num_groups)`.
pub type GroupId = u32;

/// Identity that a set of flow groups is scheduled under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum GroupKey {
    /// All flows reported by one switch.
    Switch(SwitchId),
    /// All flows between two endpoints.
    Pair { src: Ipv4Addr, dst: Ipv4Addr },
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Switch(id) => write!(f, "{id}"),
            Self::Pair { src, dst } => write!(f, "{src},{dst}"),
        }
    }
}
