use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::fabric::PortId;

use super::{GroupId, GroupKey};

/// One epoch's placement decisions, rebuilt from scratch every epoch.
///
/// Serializes to the publisher wire format: an object keyed by the group
/// key's string form, each value an object of `"group id": port`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathAssignment {
    entries: BTreeMap<GroupKey, BTreeMap<GroupId, PortId>>,
}

impl PathAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the full placement for one key, replacing any earlier one.
    pub fn insert(&mut self, key: GroupKey, placement: BTreeMap<GroupId, PortId>) {
        self.entries.insert(key, placement);
    }

    pub fn get(&self, key: &GroupKey) -> Option<&BTreeMap<GroupId, PortId>> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &GroupKey) -> bool {
        self.entries.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &GroupKey> {
        self.entries.keys()
    }

    /// Number of group keys.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for PathAssignment {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, placement) in &self.entries {
            map.serialize_entry(&key.to_string(), placement)?;
        }
        map.end()
    }
}
