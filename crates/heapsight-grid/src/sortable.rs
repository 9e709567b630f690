use std::collections::VecDeque;

use heapsight_types::{ComparatorConfig, SortField, SortKey};
use tracing::debug;

use crate::tree::{NodeId, Population, Tree};

/// A row the grid can order and filter.
pub trait GridRow {
    fn sort_key(&self, field: SortField) -> SortKey<'_>;

    /// Whether the row can be expanded.
    fn has_children(&self) -> bool {
        false
    }

    /// Name matched against the grid's name filter. Rows that return `None`
    /// are never filtered out.
    fn filter_name(&self) -> Option<&str> {
        None
    }

    /// Rows whose children come from a remote provider are ordered there:
    /// the grid hands them back instead of sorting them locally.
    fn sorts_remotely(&self) -> bool {
        false
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GridEvent {
    SortingComplete,
}

/// Token carried through one sort pass.
#[derive(Clone, Copy, Debug)]
struct SortPass {
    epoch: u64,
    force: bool,
}

/// Result of starting a sort.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SortOutcome {
    /// Nodes whose children must be re-fetched in the new order. Each one
    /// holds a sorting level open until [`SortableDataGrid::finish_remote_sort`].
    pub remote: Vec<NodeId>,
    /// Whether the outermost sorting level closed during this call.
    pub complete: bool,
}

/// Result of expanding a node.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Expansion {
    /// The node has no children yet; the caller should fetch them.
    pub needs_population: bool,
    pub sort: SortOutcome,
}

pub struct SortableDataGrid<T> {
    tree: Tree<T>,
    row_height: f64,
    comparator: Option<ComparatorConfig>,
    sort_epoch: u64,
    last_sort: Option<(String, bool)>,
    recursive_sorting_depth: u32,
    name_filter: Option<String>,
    selected: Option<NodeId>,
    events: Vec<GridEvent>,
}

impl<T: GridRow> SortableDataGrid<T> {
    pub fn new(root: T, row_height: f64) -> Self {
        Self {
            tree: Tree::new(root),
            row_height,
            comparator: None,
            sort_epoch: 0,
            last_sort: None,
            recursive_sorting_depth: 0,
            name_filter: None,
            selected: None,
            events: Vec::new(),
        }
    }

    pub fn tree(&self) -> &Tree<T> {
        &self.tree
    }

    pub fn root(&self) -> NodeId {
        self.tree.root()
    }

    pub fn data(&self, id: NodeId) -> Option<&T> {
        self.tree.get(id).map(|node| &node.data)
    }

    pub fn data_mut(&mut self, id: NodeId) -> Option<&mut T> {
        self.tree.get_mut(id).map(|node| &mut node.data)
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        self.tree.children(id)
    }

    pub fn top_level_nodes(&self) -> &[NodeId] {
        self.tree.children(self.tree.root())
    }

    pub fn row_height(&self) -> f64 {
        self.row_height
    }

    pub fn comparator(&self) -> Option<ComparatorConfig> {
        self.comparator
    }

    pub fn sort_epoch(&self) -> u64 {
        self.sort_epoch
    }

    pub fn take_events(&mut self) -> Vec<GridEvent> {
        std::mem::take(&mut self.events)
    }

    // ── Sorting ──────────────────────────────────────────────

    /// Installs a comparator. Every previously sorted level becomes stale.
    pub fn set_comparator(&mut self, comparator: ComparatorConfig) {
        self.comparator = Some(comparator);
        self.sort_epoch += 1;
    }

    /// Re-sorts for a column header change. Returns `None` when the column
    /// and direction are the same as last time.
    pub fn sorting_changed(
        &mut self,
        column: &str,
        ascending: bool,
        comparator: ComparatorConfig,
    ) -> Option<SortOutcome> {
        if self
            .last_sort
            .as_ref()
            .is_some_and(|(last, last_ascending)| last == column && *last_ascending == ascending)
        {
            return None;
        }
        self.last_sort = Some((column.to_string(), ascending));
        self.set_comparator(comparator);
        Some(self.sort(false))
    }

    /// Forgets the last column so the next [`sorting_changed`](Self::sorting_changed) sorts.
    pub fn reset_sorting_cache(&mut self) {
        self.last_sort = None;
    }

    /// Sorts the tree level by level from the root.
    ///
    /// Unless `force` is set, collapsed nodes and nodes already sorted in the
    /// current epoch are skipped together with their subtrees. Skipped nodes
    /// are sorted when they are next expanded.
    pub fn sort(&mut self, force: bool) -> SortOutcome {
        let root = self.tree.root();
        self.sort_from(root, force)
    }

    fn sort_from(&mut self, start: NodeId, force: bool) -> SortOutcome {
        let mut outcome = SortOutcome::default();
        let Some(comparator) = self.comparator else {
            return outcome;
        };
        let pass = SortPass {
            epoch: self.sort_epoch,
            force,
        };

        self.recursive_sorting_enter();
        let mut worklist = VecDeque::from([start]);
        while let Some(id) = worklist.pop_front() {
            let node = &self.tree[id];
            let expanded = node.expanded || id == start;
            if !pass.force && (!expanded || node.sorted_epoch == Some(pass.epoch)) {
                continue;
            }
            if node.population != Population::Populated {
                continue;
            }
            if node.data.sorts_remotely() {
                self.recursive_sorting_enter();
                outcome.remote.push(id);
                continue;
            }
            self.sort_children(id, &comparator, pass.epoch);
            worklist.extend(self.tree[id].children.iter().copied());
        }
        debug!(
            epoch = pass.epoch,
            force = pass.force,
            remote = outcome.remote.len(),
            "sort pass finished"
        );
        outcome.complete = self.recursive_sorting_leave();
        outcome
    }

    fn sort_children(&mut self, id: NodeId, comparator: &ComparatorConfig, epoch: u64) {
        let mut children = self.tree.take_children(id);
        let tree = &self.tree;
        children.sort_by(|&a, &b| {
            comparator.compare(&tree[a].data, &tree[b].data, |row, field| row.sort_key(field))
        });
        self.tree.put_children(id, children);
        self.tree[id].sorted_epoch = Some(epoch);
    }

    /// Marks a node handed back by [`sort`](Self::sort) as ordered and closes
    /// its sorting level. Returns whether the outermost level closed.
    pub fn finish_remote_sort(&mut self, id: NodeId) -> bool {
        if let Some(node) = self.tree.get_mut(id) {
            node.sorted_epoch = Some(self.sort_epoch);
        }
        self.recursive_sorting_leave()
    }

    pub fn recursive_sorting_enter(&mut self) {
        self.recursive_sorting_depth += 1;
    }

    /// Returns true when this call closed the outermost level, in which case
    /// [`GridEvent::SortingComplete`] has been queued.
    pub fn recursive_sorting_leave(&mut self) -> bool {
        if self.recursive_sorting_depth == 0 {
            return false;
        }
        self.recursive_sorting_depth -= 1;
        if self.recursive_sorting_depth > 0 {
            return false;
        }
        self.events.push(GridEvent::SortingComplete);
        true
    }

    pub fn is_sorting(&self) -> bool {
        self.recursive_sorting_depth > 0
    }

    // ── Population ───────────────────────────────────────────

    /// Claims an unpopulated node for filling. Returns false if it is already
    /// populated or another fetch is under way.
    pub fn begin_populate(&mut self, id: NodeId) -> bool {
        let node = &mut self.tree[id];
        if node.population != Population::Unpopulated {
            return false;
        }
        node.population = Population::Populating;
        true
    }

    /// Installs the children of a node claimed with [`begin_populate`](Self::begin_populate)
    /// and orders them by the current comparator. Rows that sort remotely
    /// are expected to arrive already in order.
    pub fn finish_populate(&mut self, id: NodeId, rows: impl IntoIterator<Item = T>) {
        if self.tree[id].population == Population::Populated {
            return;
        }
        self.append_children(id, rows);
        self.tree[id].population = Population::Populated;
        if let Some(comparator) = self.comparator {
            let epoch = self.sort_epoch;
            if self.tree[id].data.sorts_remotely() {
                self.tree[id].sorted_epoch = Some(epoch);
            } else {
                self.sort_children(id, &comparator, epoch);
            }
        }
    }

    /// Gives up a claim taken with [`begin_populate`](Self::begin_populate),
    /// so that the next expansion asks for children again.
    pub fn cancel_populate(&mut self, id: NodeId) {
        if let Some(node) = self.tree.get_mut(id)
            && node.population == Population::Populating
        {
            node.population = Population::Unpopulated;
        }
    }

    /// Fills a node once. Later calls are no-ops and return false.
    pub fn populate(&mut self, id: NodeId, rows: impl IntoIterator<Item = T>) -> bool {
        if !self.begin_populate(id) {
            return false;
        }
        self.finish_populate(id, rows);
        true
    }

    /// Appends rows after the existing children without reordering.
    pub fn append_children(&mut self, parent: NodeId, rows: impl IntoIterator<Item = T>) -> Vec<NodeId> {
        let height = self.row_height;
        let added: Vec<NodeId> = rows
            .into_iter()
            .map(|row| self.tree.push_child(parent, row, height))
            .collect();
        if parent == self.tree.root() {
            self.tree[parent].population = Population::Populated;
        }
        added
    }

    /// Inserts a row after every sibling that does not sort after it.
    pub fn insert_child_ordered(&mut self, parent: NodeId, row: T) -> NodeId {
        let id = self.tree.push_child(parent, row, self.row_height);
        let Some(comparator) = self.comparator else {
            return id;
        };
        let mut children = self.tree.take_children(parent);
        children.pop();
        let tree = &self.tree;
        let position = children.partition_point(|&sibling| {
            comparator.compare(&tree[sibling].data, &tree[id].data, |row, field| {
                row.sort_key(field)
            }) != std::cmp::Ordering::Greater
        });
        children.insert(position, id);
        self.tree.put_children(parent, children);
        id
    }

    pub fn remove_children(&mut self, parent: NodeId) {
        let removed = self.tree.remove_children(parent);
        if self.selected.is_some_and(|selected| removed.contains(&selected)) {
            self.selected = None;
        }
    }

    // ── Expansion ────────────────────────────────────────────

    /// Expands a node, ordering its children first if a sort skipped them.
    pub fn expand(&mut self, id: NodeId) -> Expansion {
        let mut expansion = Expansion::default();
        let Some(node) = self.tree.get(id) else {
            debug!(?id, "expand of a removed row ignored");
            return expansion;
        };
        if id != self.tree.root() && !node.data.has_children() {
            return expansion;
        }
        let population = node.population;
        let stale = node.sorted_epoch != Some(self.sort_epoch);
        self.tree.set_expanded(id, true);
        match population {
            Population::Unpopulated => expansion.needs_population = true,
            Population::Populating => {}
            Population::Populated => {
                if stale && self.comparator.is_some() {
                    expansion.sort = self.sort_from(id, false);
                }
            }
        }
        expansion
    }

    pub fn collapse(&mut self, id: NodeId) {
        if !self.tree.contains(id) {
            debug!(?id, "collapse of a removed row ignored");
            return;
        }
        self.tree.set_expanded(id, false);
    }

    // ── Selection and name filter ────────────────────────────

    pub fn selected(&self) -> Option<NodeId> {
        self.selected
    }

    pub fn select(&mut self, id: Option<NodeId>) {
        self.selected = id.filter(|&id| self.tree.contains(id));
    }

    /// Hides top-level rows whose name does not contain `filter`, ignoring
    /// case. An empty filter shows everything.
    pub fn set_name_filter(&mut self, filter: &str) {
        self.name_filter = (!filter.is_empty()).then(|| filter.to_lowercase());
        self.deselect_filtered_nodes();
    }

    pub fn name_filter(&self) -> Option<&str> {
        self.name_filter.as_deref()
    }

    pub fn is_filtered_out(&self, id: NodeId) -> bool {
        let Some(filter) = &self.name_filter else {
            return false;
        };
        let node = &self.tree[id];
        if node.parent != Some(self.tree.root()) {
            return false;
        }
        node.data
            .filter_name()
            .is_some_and(|name| !name.to_lowercase().contains(filter.as_str()))
    }

    fn deselect_filtered_nodes(&mut self) {
        let Some(selected) = self.selected else {
            return;
        };
        if self.tree.path_to(selected).iter().any(|&id| self.is_filtered_out(id)) {
            self.selected = None;
        }
    }

    pub(crate) fn tree_mut(&mut self) -> &mut Tree<T> {
        &mut self.tree
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    pub(crate) struct Row {
        pub name: String,
        pub size: u64,
        pub expandable: bool,
        pub remote: bool,
    }

    impl Row {
        pub fn leaf(name: &str, size: u64) -> Self {
            Self {
                name: name.to_string(),
                size,
                expandable: false,
                remote: false,
            }
        }

        pub fn branch(name: &str, size: u64) -> Self {
            Self {
                expandable: true,
                ..Self::leaf(name, size)
            }
        }
    }

    impl GridRow for Row {
        fn sort_key(&self, field: SortField) -> SortKey<'_> {
            match field {
                SortField::Name => self.name.as_str().into(),
                _ => self.size.into(),
            }
        }

        fn has_children(&self) -> bool {
            self.expandable
        }

        fn filter_name(&self) -> Option<&str> {
            Some(&self.name)
        }

        fn sorts_remotely(&self) -> bool {
            self.remote
        }
    }

    fn names(grid: &SortableDataGrid<Row>, parent: NodeId) -> Vec<String> {
        grid.children(parent)
            .iter()
            .map(|&id| grid.data(id).map(|row| row.name.clone()).unwrap_or_default())
            .collect()
    }

    fn by_size_desc() -> ComparatorConfig {
        ComparatorConfig::new(SortField::RetainedSize, false, SortField::Name, true)
    }

    fn by_name() -> ComparatorConfig {
        ComparatorConfig::single(SortField::Name, true)
    }

    #[test]
    fn populate_is_idempotent_and_applies_comparator() {
        let mut grid = SortableDataGrid::new(Row::branch("root", 0), 20.0);
        grid.set_comparator(by_size_desc());
        let root = grid.root();
        let a = grid.append_children(root, [Row::branch("a", 1)])[0];

        assert!(grid.populate(a, [Row::leaf("x", 1), Row::leaf("y", 3), Row::leaf("z", 2)]));
        assert_eq!(names(&grid, a), ["y", "z", "x"]);
        assert!(!grid.populate(a, [Row::leaf("w", 9)]));
        assert_eq!(grid.children(a).len(), 3);
        assert_eq!(grid.tree()[a].population(), Population::Populated);
    }

    #[test]
    fn begin_populate_claims_once() {
        let mut grid = SortableDataGrid::new(Row::branch("root", 0), 20.0);
        let root = grid.root();
        let a = grid.append_children(root, [Row::branch("a", 1)])[0];
        assert!(grid.begin_populate(a));
        assert!(!grid.begin_populate(a));
        grid.finish_populate(a, [Row::leaf("x", 1)]);
        assert!(!grid.begin_populate(a));
    }

    #[test]
    fn cancelled_population_can_be_retried() {
        let mut grid = SortableDataGrid::new(Row::branch("root", 0), 20.0);
        let root = grid.root();
        let a = grid.append_children(root, [Row::branch("a", 1)])[0];
        assert!(grid.begin_populate(a));
        grid.cancel_populate(a);
        assert_eq!(grid.tree()[a].population(), Population::Unpopulated);
        assert!(grid.expand(a).needs_population);

        grid.populate(a, [Row::leaf("x", 1)]);
        grid.cancel_populate(a);
        assert_eq!(grid.tree()[a].population(), Population::Populated);
    }

    #[test]
    fn collapsed_nodes_sort_lazily_on_expand() {
        let mut grid = SortableDataGrid::new(Row::branch("root", 0), 20.0);
        let root = grid.root();
        let ids = grid.append_children(root, [Row::branch("b", 2), Row::branch("a", 1)]);
        let (b, a) = (ids[0], ids[1]);
        grid.populate(b, [Row::leaf("b2", 5), Row::leaf("b1", 7)]);
        grid.populate(a, [Row::leaf("a2", 5), Row::leaf("a1", 7)]);
        grid.expand(b);

        grid.set_comparator(by_name());
        let outcome = grid.sort(false);
        assert!(outcome.complete);
        assert_eq!(names(&grid, root), ["a", "b"]);
        assert_eq!(names(&grid, b), ["b1", "b2"]);
        assert_eq!(names(&grid, a), ["a2", "a1"], "collapsed node keeps its order");

        grid.expand(a);
        assert_eq!(names(&grid, a), ["a1", "a2"]);
        assert_eq!(grid.take_events(), [GridEvent::SortingComplete, GridEvent::SortingComplete]);
    }

    #[test]
    fn removed_rows_ignore_expand_and_collapse() {
        let mut grid = SortableDataGrid::new(Row::branch("root", 0), 20.0);
        let root = grid.root();
        let old = grid.append_children(root, [Row::branch("Foo", 1)])[0];
        grid.remove_children(root);
        let fresh = grid.append_children(root, [Row::branch("Bar", 1)])[0];

        assert_eq!(grid.expand(old), Expansion::default());
        grid.collapse(old);
        assert!(!grid.tree()[fresh].is_expanded());

        assert!(grid.expand(fresh).needs_population);
        assert!(grid.tree()[fresh].is_expanded());
    }

    #[test]
    fn unchanged_comparator_skips_unless_forced() {
        let mut grid = SortableDataGrid::new(Row::branch("root", 0), 20.0);
        grid.set_comparator(by_name());
        let root = grid.root();
        grid.append_children(root, [Row::leaf("b", 1), Row::leaf("a", 2)]);
        grid.sort(false);
        assert_eq!(names(&grid, root), ["a", "b"]);

        grid.append_children(root, [Row::leaf("0", 3)]);
        grid.sort(false);
        assert_eq!(names(&grid, root), ["a", "b", "0"]);
        grid.sort(true);
        assert_eq!(names(&grid, root), ["0", "a", "b"]);
    }

    #[test]
    fn sorting_changed_ignores_repeated_header_clicks() {
        let mut grid = SortableDataGrid::new(Row::branch("root", 0), 20.0);
        let root = grid.root();
        grid.append_children(root, [Row::leaf("a", 1), Row::leaf("b", 2)]);
        assert!(grid.sorting_changed("retainedSize", false, by_size_desc()).is_some());
        let epoch = grid.sort_epoch();
        assert!(grid.sorting_changed("retainedSize", false, by_size_desc()).is_none());
        assert_eq!(grid.sort_epoch(), epoch);
        assert_eq!(names(&grid, root), ["b", "a"]);

        grid.reset_sorting_cache();
        assert!(grid.sorting_changed("retainedSize", false, by_size_desc()).is_some());
    }

    #[test]
    fn remote_rows_hold_the_level_open() {
        let mut grid = SortableDataGrid::new(Row::branch("root", 0), 20.0);
        grid.set_comparator(by_name());
        let root = grid.root();
        let remote = grid.append_children(
            root,
            [Row {
                remote: true,
                ..Row::branch("r", 1)
            }],
        )[0];
        grid.populate(remote, [Row::leaf("z", 1), Row::leaf("y", 1)]);
        grid.expand(remote);
        grid.take_events();

        let outcome = grid.sort(true);
        assert_eq!(outcome.remote, [remote]);
        assert!(!outcome.complete);
        assert!(grid.is_sorting());
        assert_eq!(names(&grid, remote), ["z", "y"]);
        assert!(grid.take_events().is_empty());

        assert!(grid.finish_remote_sort(remote));
        assert_eq!(grid.take_events(), [GridEvent::SortingComplete]);
    }

    #[test]
    fn nested_sorting_levels_complete_once() {
        let mut grid = SortableDataGrid::new(Row::branch("root", 0), 20.0);
        grid.recursive_sorting_enter();
        grid.recursive_sorting_enter();
        assert!(!grid.recursive_sorting_leave());
        assert!(grid.recursive_sorting_leave());
        assert!(!grid.recursive_sorting_leave());
        assert_eq!(grid.take_events(), [GridEvent::SortingComplete]);
    }

    #[test]
    fn insert_child_ordered_uses_upper_bound() {
        let mut grid = SortableDataGrid::new(Row::branch("root", 0), 20.0);
        grid.set_comparator(ComparatorConfig::single(SortField::ShallowSize, true));
        let root = grid.root();
        grid.append_children(root, [Row::leaf("a", 1), Row::leaf("b", 2), Row::leaf("c", 3)]);
        grid.insert_child_ordered(root, Row::leaf("b'", 2));
        assert_eq!(names(&grid, root), ["a", "b", "b'", "c"]);
    }

    #[test]
    fn name_filter_deselects_hidden_rows() {
        let mut grid = SortableDataGrid::new(Row::branch("root", 0), 20.0);
        let root = grid.root();
        let ids = grid.append_children(root, [Row::branch("Foo", 1), Row::branch("Bar", 1)]);
        grid.populate(ids[0], [Row::leaf("bar-inside-foo", 1)]);
        let inner = grid.children(ids[0])[0];
        grid.select(Some(inner));

        grid.set_name_filter("BAR");
        assert!(grid.is_filtered_out(ids[0]));
        assert!(!grid.is_filtered_out(ids[1]));
        assert!(!grid.is_filtered_out(inner), "only top-level rows are filtered");
        assert_eq!(grid.selected(), None);

        grid.set_name_filter("");
        assert!(!grid.is_filtered_out(ids[0]));
    }
}
