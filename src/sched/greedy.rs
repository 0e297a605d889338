use std::cmp::Reverse;
use std::collections::BTreeMap;

use crate::error::ConfigurationError;
use crate::fabric::topology::CandidateSet;
use crate::fabric::PortId;

use super::{CongestionTracker, GroupId, GroupKey, PortLoad};

/// Result of one scheduling pass for one group key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleOutcome {
    /// Every group id in `[0, num_groups)` mapped to a candidate port.
    pub assignment: BTreeMap<GroupId, PortId>,
    /// Simulated per-port load after all groups were placed.
    pub loads: PortLoad,
}

impl ScheduleOutcome {
    /// Difference between the most and least loaded candidate port.
    pub fn imbalance(&self) -> u64 {
        let max = self.loads.values().copied().max().unwrap_or(0);
        let min = self.loads.values().copied().min().unwrap_or(0);
        max - min
    }
}

/// Longest-processing-time-first placement of flow groups onto the least
/// loaded candidate port.
#[derive(Debug, Default, Clone, Copy)]
pub struct GreedyScheduler;

impl GreedyScheduler {
    pub fn new() -> Self {
        Self
    }

    /// Place every group of `key` onto one of `candidates`, seeding port load
    /// from the tracker.
    pub fn schedule(
        &self,
        key: &GroupKey,
        groups: &[u64],
        candidates: &CandidateSet,
        tracker: &CongestionTracker<'_>,
    ) -> Result<ScheduleOutcome, ConfigurationError> {
        if candidates.ports.is_empty() {
            return Err(ConfigurationError::EmptyCandidateSet(key.clone()));
        }

        self.place(key, groups, tracker.port_load(candidates))
    }

    /// Greedy core over an explicit initial load.
    ///
    /// Groups are taken heaviest first, ties by ascending id. Each goes to the
    /// port with the smallest tentative load, ties by smallest port id, and
    /// that port's load grows by the group's bytes.
    pub fn place(
        &self,
        key: &GroupKey,
        groups: &[u64],
        mut loads: PortLoad,
    ) -> Result<ScheduleOutcome, ConfigurationError> {
        if loads.is_empty() {
            return Err(ConfigurationError::EmptyCandidateSet(key.clone()));
        }

        let mut order: Vec<usize> = (0..groups.len()).collect();
        // Stable sort keeps ascending ids within equal byte counts.
        order.sort_by_key(|&id| Reverse(groups[id]));

        let mut assignment = BTreeMap::new();

        for id in order {
            let Some(port) = least_loaded(&loads) else {
                break;
            };

            if let Some(load) = loads.get_mut(&port) {
                *load = load.saturating_add(groups[id]);
            }

            assignment.insert(id as GroupId, port);
        }

        Ok(ScheduleOutcome { assignment, loads })
    }
}

/// Port with the smallest load; the map's ascending order makes the first
/// minimum the smallest port id.
fn least_loaded(loads: &PortLoad) -> Option<PortId> {
    let mut best: Option<(PortId, u64)> = None;

    for (&port, &load) in loads {
        match best {
            Some((_, b)) if load >= b => {}
            _ => best = Some((port, load)),
        }
    }

    best.map(|(port, _)| port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fabric::{PortCounterSample, SwitchId};
    use crate::sched::CounterStore;

    fn key() -> GroupKey {
        GroupKey::Switch(SwitchId::from("00:00:00:00:00:00:00:01"))
    }

    fn loads(pairs: &[(PortId, u64)]) -> PortLoad {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_heaviest_group_goes_to_idle_port() {
        // Ports 1 and 2 start at [100, 0]; groups 50, 30, 10.
        let out = GreedyScheduler::new()
            .place(&key(), &[50, 30, 10], loads(&[(1, 100), (2, 0)]))
            .expect("candidates present");

        assert_eq!(out.assignment.get(&0), Some(&2));
        assert_eq!(out.assignment.get(&1), Some(&2));
        assert_eq!(out.assignment.get(&2), Some(&2));
        assert_eq!(out.loads, loads(&[(1, 100), (2, 90)]));
        assert_eq!(out.imbalance(), 10);
    }

    #[test]
    fn test_sort_is_descending_with_id_tiebreak() {
        // Group 2 is heaviest, groups 0 and 1 tie and keep id order.
        let out = GreedyScheduler::new()
            .place(&key(), &[10, 10, 40], loads(&[(1, 0), (2, 0), (3, 0)]))
            .expect("candidates present");

        assert_eq!(out.assignment.get(&2), Some(&1));
        assert_eq!(out.assignment.get(&0), Some(&2));
        assert_eq!(out.assignment.get(&1), Some(&3));
    }

    #[test]
    fn test_port_ties_pick_smallest_id() {
        let out = GreedyScheduler::new()
            .place(&key(), &[5], loads(&[(69, 0), (5, 0), (33, 0)]))
            .expect("candidates present");
        assert_eq!(out.assignment.get(&0), Some(&5));
    }

    #[test]
    fn test_assignment_is_total() {
        let groups = vec![0u64; 16];
        let out = GreedyScheduler::new()
            .place(&key(), &groups, loads(&[(1, 0), (5, 0)]))
            .expect("candidates present");

        let ids: Vec<GroupId> = out.assignment.keys().copied().collect();
        assert_eq!(ids, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_zero_traffic_is_deterministic() {
        let groups = vec![0u64; 8];
        let first = GreedyScheduler::new()
            .place(&key(), &groups, loads(&[(1, 300), (5, 100), (33, 100)]))
            .expect("candidates present");

        for _ in 0..5 {
            let again = GreedyScheduler::new()
                .place(&key(), &groups, loads(&[(1, 300), (5, 100), (33, 100)]))
                .expect("candidates present");
            assert_eq!(again, first);
        }

        // Zero-byte groups never change load, so all land on port 5.
        assert!(first.assignment.values().all(|&p| p == 5));
    }

    #[test]
    fn test_greedy_bound_from_equal_start() {
        let groups = [90u64, 70, 60, 55, 40, 30, 30, 10, 5, 1];
        let max = *groups.iter().max().expect("non-empty");
        let out = GreedyScheduler::new()
            .place(&key(), &groups, loads(&[(1, 0), (5, 0), (33, 0)]))
            .expect("candidates present");
        assert!(out.imbalance() <= max);
    }

    #[test]
    fn test_empty_candidates_is_configuration_error() {
        let store = CounterStore::new();
        let tracker = CongestionTracker::new(&store);
        let set = CandidateSet {
            switch: SwitchId::from("00:00:00:00:00:00:00:01"),
            ports: vec![],
        };

        let err = GreedyScheduler::new()
            .schedule(&key(), &[1, 2], &set, &tracker)
            .expect_err("no candidates");
        assert_eq!(err, ConfigurationError::EmptyCandidateSet(key()));
    }

    #[test]
    fn test_schedule_seeds_from_tracker() {
        let sw = SwitchId::from("00:00:00:00:00:00:00:01");
        let mut store = CounterStore::new();
        for (port, before, after) in [(1, 0, 100), (2, 0, 0)] {
            let mut s = PortCounterSample::default();
            s.tx_bytes = before;
            store.update_port(&sw, port, s);
            s.tx_bytes = after;
            store.update_port(&sw, port, s);
        }

        let tracker = CongestionTracker::new(&store);
        let set = CandidateSet {
            switch: sw,
            ports: vec![1, 2],
        };
        let out = GreedyScheduler::new()
            .schedule(&key(), &[50, 30, 10], &set, &tracker)
            .expect("candidates present");

        assert_eq!(out.loads, loads(&[(1, 100), (2, 90)]));
    }
}
