use std::collections::BTreeMap;

use facet::Facet;

/// Distance assigned to nodes the root cannot reach.
pub const UNREACHABLE_DISTANCE: u32 = 100_000_000;

/// Per-class rollup over a snapshot or a filtered part of it.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct Aggregate {
    pub name: String,
    pub count: u32,
    /// Smallest distance from the root among the instances.
    pub distance: u32,
    pub shallow_size: u64,
    pub retained_size: u64,
    pub node_indexes: Vec<u32>,
}

/// Aggregates keyed by class name.
pub type Aggregates = BTreeMap<String, Aggregate>;

pub fn aggregates_by_name(list: Vec<Aggregate>) -> Aggregates {
    list.into_iter()
        .map(|aggregate| (aggregate.name.clone(), aggregate))
        .collect()
}

/// Digest of one class in a base snapshot, copied by value into the
/// snapshot that computes the diff. `ids` is sorted ascending and the other
/// two vectors are parallel to it.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct AggregateForDiff {
    pub name: String,
    pub node_indexes: Vec<u32>,
    pub ids: Vec<u64>,
    pub shallow_sizes: Vec<u64>,
}

#[derive(Facet, Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffForClass {
    pub name: String,
    pub added_count: u32,
    pub removed_count: u32,
    pub added_size: u64,
    pub removed_size: u64,
    pub count_delta: i64,
    pub size_delta: i64,
    /// Node indexes of added instances, in the newer snapshot.
    pub added_indexes: Vec<u32>,
    /// Node indexes of removed instances, in the base snapshot.
    pub deleted_indexes: Vec<u32>,
}

impl DiffForClass {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn has_changes(&self) -> bool {
        self.added_count > 0 || self.removed_count > 0
    }

    pub fn finish(&mut self) {
        self.count_delta = i64::from(self.added_count) - i64::from(self.removed_count);
        self.size_delta = self.added_size as i64 - self.removed_size as i64;
    }
}
