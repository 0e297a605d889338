use std::collections::BTreeMap;

use crate::config::{GroupingMode, HashPolicy};
use crate::fabric::{ip_to_u32, FlowKey, SwitchId};

use super::{GroupId, GroupKey};

/// Maps flow keys onto (group key, group id) buckets.
///
/// Pure and deterministic: the same flow key always lands in the same group,
/// in this run and the next, which keeps a flow pinned to one path for as
/// long as competing groups stay put.
#[derive(Debug, Clone, Copy)]
pub struct FlowClassifier {
    num_groups: u32,
    grouping: GroupingMode,
    hash_policy: HashPolicy,
}

impl FlowClassifier {
    /// `num_groups` is validated by the config layer; zero is treated as one.
    pub fn new(num_groups: u32, grouping: GroupingMode, hash_policy: HashPolicy) -> Self {
        Self {
            num_groups: num_groups.max(1),
            grouping,
            hash_policy,
        }
    }

    pub fn num_groups(&self) -> u32 {
        self.num_groups
    }

    pub fn grouping(&self) -> GroupingMode {
        self.grouping
    }

    /// Group id of a flow, in `[0, num_groups)`.
    pub fn group_id(&self, key: &FlowKey) -> GroupId {
        let ports = u32::from(key.src_port) ^ u32::from(key.dst_port);

        let hash = match self.hash_policy {
            HashPolicy::Ports => ports,
            HashPolicy::PortsAndAddresses => ip_to_u32(key.src_ip) ^ ip_to_u32(key.dst_ip) ^ ports,
        };

        hash % self.num_groups
    }

    /// Group key a flow reported by `switch` is scheduled under.
    pub fn group_key(&self, switch: &SwitchId, key: &FlowKey) -> GroupKey {
        match self.grouping {
            GroupingMode::PerSwitch => GroupKey::Switch(switch.clone()),
            GroupingMode::PerPair => GroupKey::Pair {
                src: key.src_ip,
                dst: key.dst_ip,
            },
        }
    }

    pub fn classify(&self, switch: &SwitchId, key: &FlowKey) -> (GroupKey, GroupId) {
        (self.group_key(switch, key), self.group_id(key))
    }
}

/// Per-epoch byte totals: group key to a dense `group id -> bytes` table.
///
/// Every key that is present carries all `num_groups` entries, so empty
/// groups are explicit zeroes rather than missing.
#[derive(Debug, Clone)]
pub struct GroupTable {
    num_groups: u32,
    groups: BTreeMap<GroupKey, Vec<u64>>,
}

impl GroupTable {
    pub fn new(num_groups: u32) -> Self {
        Self {
            num_groups: num_groups.max(1),
            groups: BTreeMap::new(),
        }
    }

    /// Make sure `key` has a zero-initialised table.
    pub fn ensure(&mut self, key: GroupKey) -> &mut Vec<u64> {
        let n = self.num_groups as usize;
        self.groups.entry(key).or_insert_with(|| vec![0; n])
    }

    /// Add `bytes` to one group. Out-of-range ids are ignored.
    pub fn add(&mut self, key: GroupKey, id: GroupId, bytes: u64) {
        let table = self.ensure(key);
        if let Some(slot) = table.get_mut(id as usize) {
            *slot = slot.saturating_add(bytes);
        }
    }

    pub fn get(&self, key: &GroupKey) -> Option<&[u64]> {
        self.groups.get(key).map(Vec::as_slice)
    }

    /// Keys in deterministic order.
    pub fn iter(&self) -> impl Iterator<Item = (&GroupKey, &[u64])> {
        self.groups.iter().map(|(k, v)| (k, v.as_slice()))
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Sum of all group bytes across all keys.
    pub fn total_bytes(&self) -> u64 {
        self.groups
            .values()
            .flat_map(|v| v.iter())
            .fold(0u64, |acc, b| acc.saturating_add(*b))
    }
}
