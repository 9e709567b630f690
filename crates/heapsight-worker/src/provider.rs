use std::sync::Arc;

use heapsight_types::{
    ComparatorConfig, EdgeItem, ItemsRange, NodeFilter, ProviderItem, SortField, SortKey,
};

use crate::WorkerError;
use crate::snapshot::HeapSnapshot;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Row {
    Node(u32),
    /// An edge and the node it leads to (or, for retainers, comes from).
    Edge { edge: u32, node: u32 },
}

impl Row {
    fn node(self) -> u32 {
        match self {
            Self::Node(node) | Self::Edge { node, .. } => node,
        }
    }
}

/// Ordered, sortable cursor over nodes or edges of one snapshot.
pub struct Provider {
    snapshot: Arc<HeapSnapshot>,
    rows: Vec<Row>,
    position: u32,
}

impl Provider {
    fn new(snapshot: Arc<HeapSnapshot>, rows: Vec<Row>) -> Self {
        Self {
            snapshot,
            rows,
            position: 0,
        }
    }

    pub fn edges(snapshot: Arc<HeapSnapshot>, node: u32) -> Result<Self, WorkerError> {
        snapshot.check_node(node)?;
        let rows = snapshot
            .edges_of(node)
            .map(|edge| Row::Edge {
                edge,
                node: snapshot.raw.edge_targets[edge as usize],
            })
            .collect();
        Ok(Self::new(snapshot, rows))
    }

    /// Weak references do not keep a node alive, so they are not listed.
    pub fn retainers(snapshot: Arc<HeapSnapshot>, node: u32) -> Result<Self, WorkerError> {
        snapshot.check_node(node)?;
        let rows = snapshot
            .retainers_of(node)
            .map(|slot| snapshot.retaining_edges[slot as usize])
            .filter(|&edge| snapshot.edge_type_name(edge) != "weak")
            .map(|edge| Row::Edge {
                edge,
                node: snapshot.edge_sources[edge as usize],
            })
            .collect();
        Ok(Self::new(snapshot, rows))
    }

    pub fn nodes(snapshot: Arc<HeapSnapshot>, node_indexes: Vec<u32>) -> Result<Self, WorkerError> {
        for &node in &node_indexes {
            snapshot.check_node(node)?;
        }
        let rows = node_indexes.into_iter().map(Row::Node).collect();
        Ok(Self::new(snapshot, rows))
    }

    pub fn nodes_for_class(
        snapshot: Arc<HeapSnapshot>,
        class_name: &str,
        filter: &NodeFilter,
    ) -> Self {
        let predicate = snapshot.predicate(filter);
        let rows = (0..snapshot.node_count() as u32)
            .filter(|&ordinal| snapshot.class_name(ordinal) == class_name)
            .filter(|&ordinal| snapshot.is_aggregated(&predicate, ordinal))
            .map(Row::Node)
            .collect();
        Self::new(snapshot, rows)
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn len(&self) -> u32 {
        self.rows.len() as u32
    }

    pub fn position(&self) -> u32 {
        self.position
    }

    pub fn sort_and_rewind(&mut self, comparator: &ComparatorConfig) {
        let snapshot = &self.snapshot;
        self.rows
            .sort_by(|a, b| comparator.compare(a, b, |row, field| sort_key(snapshot, *row, field)));
        self.position = 0;
    }

    /// Serializes `[start, end)`, clamped to the row count.
    pub fn serialize_items_range(&mut self, start: u32, end: u32) -> ItemsRange {
        let total = self.len();
        let end = end.min(total);
        let start = start.min(end);
        let items = self.rows[start as usize..end as usize]
            .iter()
            .map(|&row| self.item(row))
            .collect();
        self.position = end;
        ItemsRange {
            start_position: start,
            end_position: end,
            total_length: total,
            items,
        }
    }

    /// Position of the row whose node has `snapshot_object_id`, or -1.
    pub fn node_position(&self, snapshot_object_id: u64) -> i64 {
        self.rows
            .iter()
            .position(|row| self.snapshot.raw.node_ids[row.node() as usize] == snapshot_object_id)
            .map_or(-1, |position| position as i64)
    }

    fn item(&self, row: Row) -> ProviderItem {
        match row {
            Row::Node(node) => ProviderItem::Node(self.snapshot.node_item(node)),
            Row::Edge { edge, node } => ProviderItem::Edge(EdgeItem {
                name: self.snapshot.edge_name(edge),
                edge_type: self.snapshot.edge_type_name(edge).to_string(),
                edge_index: edge,
                node: self.snapshot.node_item(node),
            }),
        }
    }
}

fn edge_name_key(snapshot: &HeapSnapshot, edge: u32) -> SortKey<'_> {
    let name_or_index = snapshot.raw.edge_names[edge as usize];
    match snapshot.edge_type_name(edge) {
        "element" | "hidden" => SortKey::from(name_or_index),
        _ => snapshot
            .raw
            .strings
            .get(name_or_index as usize)
            .map_or(SortKey::Number(0), |name| SortKey::Text(name)),
    }
}

fn sort_key(snapshot: &HeapSnapshot, row: Row, field: SortField) -> SortKey<'_> {
    let node = row.node() as usize;
    match (field, row) {
        (SortField::Name | SortField::EdgeName, Row::Edge { edge, .. }) => edge_name_key(snapshot, edge),
        (SortField::Name | SortField::EdgeName, Row::Node(ordinal)) => {
            SortKey::Text(snapshot.node_name(ordinal))
        }
        (SortField::Id, _) => snapshot.raw.node_ids[node].into(),
        (SortField::Distance, _) => snapshot.distances[node].into(),
        (SortField::ShallowSize, _) => snapshot.raw.node_self_sizes[node].into(),
        (SortField::RetainedSize, _) => snapshot.retained_sizes[node].into(),
        _ => SortKey::Number(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SnapshotBuilder;
    use heapsight_types::ProfileUid;

    fn snapshot_with_sizes(sizes: &[u64]) -> Arc<HeapSnapshot> {
        let mut builder = SnapshotBuilder::new();
        for (i, &size) in sizes.iter().enumerate() {
            let node = builder.object("Item", size);
            builder.property(SnapshotBuilder::ROOT, node, &format!("slot{i}"));
        }
        let uid = ProfileUid::new(1).expect("non-zero uid");
        Arc::new(HeapSnapshot::build(uid, &builder.to_json(), &mut |_| {}).expect("builds"))
    }

    fn sizes(range: &ItemsRange) -> Vec<u64> {
        range.items.iter().map(|item| item.node().shallow_size).collect()
    }

    #[test]
    fn sort_and_rewind_then_range_follows_comparator() {
        let snapshot = snapshot_with_sizes(&[30, 10, 50, 20, 40]);
        let mut provider = Provider::nodes_for_class(snapshot, "Item", &NodeFilter::everything());
        provider.serialize_items_range(0, 2);
        assert_eq!(provider.position(), 2);

        provider.sort_and_rewind(&ComparatorConfig::new(
            SortField::ShallowSize,
            false,
            SortField::Id,
            true,
        ));
        assert_eq!(provider.position(), 0);
        for n in 0..=5 {
            let range = provider.serialize_items_range(0, n);
            assert_eq!(range.items.len(), n as usize);
            assert_eq!(sizes(&range), [50, 40, 30, 20, 10][..n as usize]);
            assert_eq!(range.total_length, 5);
        }
    }

    #[test]
    fn ranges_are_clamped() {
        let snapshot = snapshot_with_sizes(&[1, 2, 3]);
        let mut provider = Provider::nodes_for_class(snapshot, "Item", &NodeFilter::everything());
        let range = provider.serialize_items_range(2, 10);
        assert_eq!((range.start_position, range.end_position), (2, 3));
        assert!(range.is_complete());
        let range = provider.serialize_items_range(7, 9);
        assert!(range.items.is_empty());
        assert_eq!(range.start_position, 3);
    }

    #[test]
    fn edges_sort_by_name_and_report_positions() {
        let snapshot = snapshot_with_sizes(&[5, 6, 7]);
        let mut edges = Provider::edges(snapshot.clone(), SnapshotBuilder::ROOT).expect("root");
        edges.sort_and_rewind(&ComparatorConfig::single(SortField::EdgeName, false));
        let range = edges.serialize_items_range(0, 3);
        let names: Vec<_> = range
            .items
            .iter()
            .map(|item| match item {
                ProviderItem::Edge(edge) => edge.name.clone(),
                ProviderItem::Node(_) => unreachable!("edge provider yields edges"),
            })
            .collect();
        assert_eq!(names, ["slot2", "slot1", "slot0"]);

        let first_id = range.items[0].node().id;
        assert_eq!(edges.node_position(first_id), 0);
        assert_eq!(edges.node_position(123_456), -1);
    }

    #[test]
    fn retainers_point_back_at_the_holder() {
        let snapshot = snapshot_with_sizes(&[5]);
        let item = 1;
        let mut retainers = Provider::retainers(snapshot, item).expect("node exists");
        let range = retainers.serialize_items_range(0, 10);
        assert_eq!(range.total_length, 1);
        assert_eq!(range.items[0].node().node_index, SnapshotBuilder::ROOT);
        assert!(Provider::nodes(snapshot_with_sizes(&[]), vec![4]).is_err());
    }
}
