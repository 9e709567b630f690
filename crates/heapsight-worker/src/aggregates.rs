use std::collections::{BTreeMap, HashMap, HashSet};

use heapsight_types::aggregate::UNREACHABLE_DISTANCE;
use heapsight_types::{Aggregate, AggregateForDiff, DiffForClass, NodeFilter, SearchConfig};
use regex::RegexBuilder;

use crate::WorkerError;
use crate::snapshot::HeapSnapshot;

/// A [`NodeFilter`] resolved against one snapshot.
pub(crate) struct NodePredicate {
    filter: NodeFilter,
    trace_ids: Option<HashSet<u64>>,
}

impl NodePredicate {
    pub(crate) fn accepts(&self, snapshot: &HeapSnapshot, ordinal: u32) -> bool {
        let index = ordinal as usize;
        if !self.filter.accepts_id(snapshot.raw.node_ids[index]) {
            return false;
        }
        match &self.trace_ids {
            Some(ids) => ids.contains(&snapshot.raw.node_trace_ids[index]),
            None => true,
        }
    }
}

impl HeapSnapshot {
    pub(crate) fn predicate(&self, filter: &NodeFilter) -> NodePredicate {
        NodePredicate {
            filter: filter.clone(),
            trace_ids: filter
                .allocation_node_id
                .map(|id| self.trace_ids_for_allocation_node(id)),
        }
    }

    /// Zero-sized nodes only count when they are native.
    pub(crate) fn is_aggregated(&self, predicate: &NodePredicate, ordinal: u32) -> bool {
        if !predicate.accepts(self, ordinal) {
            return false;
        }
        self.raw.node_self_sizes[ordinal as usize] != 0 || self.node_type_name(ordinal) == "native"
    }

    pub fn aggregates_with_filter(&self, filter: &NodeFilter) -> Vec<Aggregate> {
        let predicate = self.predicate(filter);
        let mut included = vec![false; self.node_count()];
        let mut by_class: HashMap<u32, Aggregate> = HashMap::new();
        for ordinal in 0..self.node_count() as u32 {
            if !self.is_aggregated(&predicate, ordinal) {
                continue;
            }
            included[ordinal as usize] = true;
            let class = self.node_classes[ordinal as usize];
            let aggregate = by_class.entry(class).or_insert_with(|| Aggregate {
                name: self.class_names[class as usize].clone(),
                count: 0,
                distance: UNREACHABLE_DISTANCE,
                shallow_size: 0,
                retained_size: 0,
                node_indexes: Vec::new(),
            });
            aggregate.count += 1;
            aggregate.shallow_size += self.raw.node_self_sizes[ordinal as usize];
            aggregate.distance = aggregate.distance.min(self.distances[ordinal as usize]);
            aggregate.node_indexes.push(ordinal);
        }
        self.add_class_retained_sizes(&included, &mut by_class);

        let mut aggregates: Vec<Aggregate> = by_class.into_values().collect();
        aggregates.sort_by(|a, b| a.name.cmp(&b.name));
        aggregates
    }

    /// Walks the dominator tree and credits each included instance whose
    /// dominator chain holds no other included instance of its class, so
    /// nested instances are not counted twice.
    fn add_class_retained_sizes(&self, included: &[bool], by_class: &mut HashMap<u32, Aggregate>) {
        let mut open = vec![0u32; self.class_names.len()];
        let mut stack: Vec<(u32, bool)> = vec![(0, false)];
        while let Some((node, exiting)) = stack.pop() {
            let counted = included[node as usize];
            let class = self.node_classes[node as usize];
            if exiting {
                if counted {
                    open[class as usize] -= 1;
                }
                continue;
            }
            if counted {
                if open[class as usize] == 0
                    && let Some(aggregate) = by_class.get_mut(&class)
                {
                    aggregate.retained_size += self.retained_sizes[node as usize];
                }
                open[class as usize] += 1;
            }
            stack.push((node, true));
            stack.extend(self.dominated_by(node).iter().map(|&child| (child, false)));
        }
    }

    pub fn aggregates_for_diff(&self) -> Vec<AggregateForDiff> {
        let predicate = self.predicate(&NodeFilter::everything());
        let mut by_name: BTreeMap<&str, Vec<(u64, u32, u64)>> = BTreeMap::new();
        for ordinal in 0..self.node_count() as u32 {
            if !self.is_aggregated(&predicate, ordinal) {
                continue;
            }
            let index = ordinal as usize;
            by_name.entry(self.class_name(ordinal)).or_default().push((
                self.raw.node_ids[index],
                ordinal,
                self.raw.node_self_sizes[index],
            ));
        }
        by_name
            .into_iter()
            .map(|(name, mut instances)| {
                instances.sort_unstable_by_key(|&(id, _, _)| id);
                AggregateForDiff {
                    name: name.to_string(),
                    ids: instances.iter().map(|&(id, _, _)| id).collect(),
                    node_indexes: instances.iter().map(|&(_, ordinal, _)| ordinal).collect(),
                    shallow_sizes: instances.iter().map(|&(_, _, size)| size).collect(),
                }
            })
            .collect()
    }

    /// Compares `base`, a digest of an older snapshot, against this one.
    /// Only classes that gained or lost instances are returned.
    pub fn calculate_snapshot_diff(&self, base: &[AggregateForDiff]) -> Vec<DiffForClass> {
        let current: BTreeMap<String, AggregateForDiff> = self
            .aggregates_for_diff()
            .into_iter()
            .map(|aggregate| (aggregate.name.clone(), aggregate))
            .collect();
        let mut diffs = Vec::new();
        let mut seen = HashSet::new();
        for base_class in base {
            seen.insert(base_class.name.as_str());
            let diff = match current.get(&base_class.name) {
                Some(this) => diff_class(base_class, this),
                None => diff_class(base_class, &empty_like(base_class)),
            };
            if diff.has_changes() {
                diffs.push(diff);
            }
        }
        for (name, this) in &current {
            if seen.contains(name.as_str()) {
                continue;
            }
            let diff = diff_class(&empty_like(this), this);
            if diff.has_changes() {
                diffs.push(diff);
            }
        }
        diffs.sort_by(|a, b| a.name.cmp(&b.name));
        diffs
    }

    pub fn search(&self, config: &SearchConfig, filter: &NodeFilter) -> Result<Vec<u64>, WorkerError> {
        let matcher = Matcher::new(config)?;
        let predicate = self.predicate(filter);
        let wanted_id = config
            .query
            .strip_prefix('@')
            .and_then(|id| id.parse::<u64>().ok());
        let mut ids: Vec<u64> = (0..self.node_count() as u32)
            .filter(|&ordinal| self.is_aggregated(&predicate, ordinal))
            .filter(|&ordinal| {
                let id = self.raw.node_ids[ordinal as usize];
                wanted_id == Some(id)
                    || matcher.matches(self.class_name(ordinal))
                    || matcher.matches(self.node_name(ordinal))
            })
            .map(|ordinal| self.raw.node_ids[ordinal as usize])
            .collect();
        ids.sort_unstable();
        ids.dedup();
        Ok(ids)
    }
}

fn empty_like(aggregate: &AggregateForDiff) -> AggregateForDiff {
    AggregateForDiff {
        name: aggregate.name.clone(),
        node_indexes: Vec::new(),
        ids: Vec::new(),
        shallow_sizes: Vec::new(),
    }
}

/// Merges two id-sorted instance lists.
fn diff_class(base: &AggregateForDiff, this: &AggregateForDiff) -> DiffForClass {
    let mut diff = DiffForClass::new(base.name.clone());
    let (mut i, mut j) = (0, 0);
    let removed = |diff: &mut DiffForClass, i: usize| {
        diff.removed_count += 1;
        diff.removed_size += base.shallow_sizes[i];
        diff.deleted_indexes.push(base.node_indexes[i]);
    };
    let added = |diff: &mut DiffForClass, j: usize| {
        diff.added_count += 1;
        diff.added_size += this.shallow_sizes[j];
        diff.added_indexes.push(this.node_indexes[j]);
    };
    while i < base.ids.len() && j < this.ids.len() {
        if base.ids[i] < this.ids[j] {
            removed(&mut diff, i);
            i += 1;
        } else if base.ids[i] > this.ids[j] {
            added(&mut diff, j);
            j += 1;
        } else {
            i += 1;
            j += 1;
        }
    }
    for i in i..base.ids.len() {
        removed(&mut diff, i);
    }
    for j in j..this.ids.len() {
        added(&mut diff, j);
    }
    diff.finish();
    diff
}

enum Matcher {
    Regex(regex::Regex),
    Exact(String),
    Folded(String),
}

impl Matcher {
    fn new(config: &SearchConfig) -> Result<Self, WorkerError> {
        if config.is_regex {
            let regex = RegexBuilder::new(&config.query)
                .case_insensitive(!config.case_sensitive)
                .build()
                .map_err(|e| WorkerError::InvalidSearch(e.to_string()))?;
            return Ok(Self::Regex(regex));
        }
        if config.query.is_empty() {
            return Err(WorkerError::InvalidSearch("empty query".to_string()));
        }
        if config.case_sensitive {
            Ok(Self::Exact(config.query.clone()))
        } else {
            Ok(Self::Folded(config.query.to_lowercase()))
        }
    }

    fn matches(&self, text: &str) -> bool {
        match self {
            Self::Regex(regex) => regex.is_match(text),
            Self::Exact(query) => text.contains(query.as_str()),
            Self::Folded(query) => text.to_lowercase().contains(query.as_str()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SnapshotBuilder;
    use heapsight_types::ProfileUid;

    fn build(builder: &SnapshotBuilder) -> HeapSnapshot {
        let uid = ProfileUid::new(1).expect("non-zero uid");
        HeapSnapshot::build(uid, &builder.to_json(), &mut |_| {}).expect("snapshot builds")
    }

    /// Foo x10 of 10B, Bar x5 of 10B, Baz x1 of 5B, all hanging off the root.
    fn three_classes() -> SnapshotBuilder {
        let mut builder = SnapshotBuilder::new();
        for (name, count, size) in [("Foo", 10, 10), ("Bar", 5, 10), ("Baz", 1, 5)] {
            for i in 0..count {
                let node = builder.object(name, size);
                builder.property(SnapshotBuilder::ROOT, node, &format!("{name}{i}"));
            }
        }
        builder
    }

    #[test]
    fn aggregates_group_by_class() {
        let snapshot = build(&three_classes());
        let aggregates = snapshot.aggregates_with_filter(&NodeFilter::everything());
        let summary: Vec<(&str, u32, u64)> = aggregates
            .iter()
            .map(|a| (a.name.as_str(), a.count, a.shallow_size))
            .collect();
        assert_eq!(summary, [("Bar", 5, 50), ("Baz", 1, 5), ("Foo", 10, 100)]);
        for aggregate in &aggregates {
            assert!(aggregate.retained_size >= aggregate.shallow_size);
            assert_eq!(aggregate.distance, 1);
        }
    }

    #[test]
    fn nested_instances_are_not_counted_twice_in_retained_size() {
        let mut builder = SnapshotBuilder::new();
        let outer = builder.object("Node", 10);
        let inner = builder.object("Node", 10);
        let leaf = builder.object("Leaf", 7);
        builder.property(SnapshotBuilder::ROOT, outer, "head");
        builder.property(outer, inner, "next");
        builder.property(inner, leaf, "value");
        let snapshot = build(&builder);

        let aggregates = snapshot.aggregates_with_filter(&NodeFilter::everything());
        let node = aggregates.iter().find(|a| a.name == "Node").expect("Node class");
        assert_eq!(node.shallow_size, 20);
        assert_eq!(node.retained_size, 27);
    }

    #[test]
    fn id_range_filter_limits_instances() {
        let mut builder = SnapshotBuilder::new();
        for id in [11, 13, 15, 17] {
            let node = builder.object_with_id("Foo", 4, id);
            builder.property(SnapshotBuilder::ROOT, node, "foo");
        }
        let snapshot = build(&builder);
        let aggregates = snapshot.aggregates_with_filter(&NodeFilter::id_range(11, 15));
        assert_eq!(aggregates.len(), 1);
        assert_eq!(aggregates[0].count, 2);
        assert_eq!(aggregates[0].shallow_size, 8);
    }

    #[test]
    fn diff_counts_added_and_removed_instances() {
        // Base: Foo {11, 13}, Bar {21, 23}. Current: Foo {11, 13, 15, 17}, Bar {21}.
        let mut base = SnapshotBuilder::new();
        for (name, id) in [("Foo", 11), ("Foo", 13), ("Bar", 21), ("Bar", 23)] {
            let node = base.object_with_id(name, 8, id);
            base.property(SnapshotBuilder::ROOT, node, "x");
        }
        let mut current = SnapshotBuilder::new();
        for (name, id) in [("Foo", 11), ("Foo", 13), ("Foo", 15), ("Foo", 17), ("Bar", 21)] {
            let node = current.object_with_id(name, 8, id);
            current.property(SnapshotBuilder::ROOT, node, "x");
        }
        let base = build(&base);
        let current = build(&current);

        let diffs = current.calculate_snapshot_diff(&base.aggregates_for_diff());
        let foo = diffs.iter().find(|d| d.name == "Foo").expect("Foo diff");
        let bar = diffs.iter().find(|d| d.name == "Bar").expect("Bar diff");
        assert_eq!(foo.count_delta, 2);
        assert_eq!(foo.added_size, 16);
        assert_eq!(foo.added_indexes.len(), 2);
        assert_eq!(bar.count_delta, -1);
        assert_eq!(bar.removed_count, 1);
        assert_eq!(bar.size_delta, -8);
        assert_eq!(bar.deleted_indexes.len(), 1);
    }

    #[test]
    fn unchanged_classes_are_left_out_of_the_diff() {
        let snapshot = build(&three_classes());
        let diffs = snapshot.calculate_snapshot_diff(&snapshot.aggregates_for_diff());
        assert!(diffs.is_empty());
    }

    #[test]
    fn search_matches_names_and_ids() {
        let snapshot = build(&three_classes());
        let hits = snapshot
            .search(&SearchConfig::substring("baz"), &NodeFilter::everything())
            .expect("search");
        assert_eq!(hits.len(), 1);

        let regex = SearchConfig {
            query: "^(Foo|Bar)$".to_string(),
            case_sensitive: true,
            is_regex: true,
        };
        let hits = snapshot.search(&regex, &NodeFilter::everything()).expect("search");
        assert_eq!(hits.len(), 15);

        let by_id = SearchConfig::substring(format!("@{}", hits[0]));
        let found = snapshot.search(&by_id, &NodeFilter::everything()).expect("search");
        assert_eq!(found, [hits[0]]);
    }

    #[test]
    fn invalid_regex_is_reported() {
        let snapshot = build(&three_classes());
        let bad = SearchConfig {
            query: "(".to_string(),
            case_sensitive: false,
            is_regex: true,
        };
        let err = snapshot
            .search(&bad, &NodeFilter::everything())
            .expect_err("must fail");
        assert!(matches!(err, WorkerError::InvalidSearch(_)));
    }
}
