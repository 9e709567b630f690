use std::sync::Arc;

use heapsight_grid::{GridEvent, NodeId, SortableDataGrid};
use heapsight_types::ComparatorConfig;
use tracing::debug;

use super::{ChildSource, Column, DiffMark, HeapRow, ProviderChildren, edge_comparator};
use crate::error::{GridError, RpcError};
use crate::proxy::{ProviderProxy, SnapshotProxy};

const COLUMNS: [Column; 4] = [
    Column::Object,
    Column::Distance,
    Column::ShallowSize,
    Column::RetainedSize,
];

/// Which way an object tree follows references.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectTreeKind {
    /// What a node references.
    Containment,
    /// What references a node.
    Retainment,
}

impl ObjectTreeKind {
    fn name(self) -> &'static str {
        match self {
            Self::Containment => "containment",
            Self::Retainment => "retainment",
        }
    }

    fn default_sort(self) -> (Column, bool) {
        match self {
            Self::Containment => (Column::RetainedSize, false),
            Self::Retainment => (Column::Distance, true),
        }
    }
}

struct Edges {
    kind: ObjectTreeKind,
    snapshot: Arc<SnapshotProxy>,
    column: Column,
    ascending: bool,
}

impl ChildSource for Edges {
    fn providers(&self, row: &HeapRow) -> Result<Vec<(ProviderProxy, Option<DiffMark>)>, RpcError> {
        let node_index = match row {
            HeapRow::Root {
                node_index: Some(node_index),
                ..
            } => *node_index,
            HeapRow::Object(object) => object.node.node_index,
            _ => return Ok(Vec::new()),
        };
        let provider = match self.kind {
            ObjectTreeKind::Containment => self.snapshot.create_edges_provider(node_index)?,
            ObjectTreeKind::Retainment => self.snapshot.create_retaining_edges_provider(node_index)?,
        };
        Ok(vec![(provider, None)])
    }

    fn comparator(&self, _row: &HeapRow) -> ComparatorConfig {
        edge_comparator(self.column, self.ascending)
    }
}

/// Edges out of (containment) or into (retainment) one heap node, unfolded
/// on demand.
pub struct ObjectTreeGrid {
    kind: ObjectTreeKind,
    grid: SortableDataGrid<HeapRow>,
    snapshot: Option<Arc<SnapshotProxy>>,
    children: ProviderChildren,
    column: Column,
    ascending: bool,
    row_height: f64,
}

impl ObjectTreeGrid {
    pub fn new(kind: ObjectTreeKind, row_height: f64) -> Self {
        let (column, ascending) = kind.default_sort();
        let mut tree = Self {
            kind,
            grid: SortableDataGrid::new(Self::root_row(None), row_height),
            snapshot: None,
            children: ProviderChildren::new(100),
            column,
            ascending,
            row_height,
        };
        tree.install_comparator();
        tree
    }

    fn root_row(node_index: Option<u32>) -> HeapRow {
        HeapRow::Root {
            node_index,
            remote: true,
        }
    }

    fn install_comparator(&mut self) {
        self.grid.sorting_changed(
            self.column.id(),
            self.ascending,
            edge_comparator(self.column, self.ascending),
        );
    }

    pub fn kind(&self) -> ObjectTreeKind {
        self.kind
    }

    pub fn grid(&self) -> &SortableDataGrid<HeapRow> {
        &self.grid
    }

    pub fn take_events(&mut self) -> Vec<GridEvent> {
        self.grid.take_events()
    }

    fn source(&self) -> Result<Edges, GridError> {
        let snapshot = self.snapshot.clone().ok_or(GridError::NoDataSource)?;
        Ok(Edges {
            kind: self.kind,
            snapshot,
            column: self.column,
            ascending: self.ascending,
        })
    }

    /// Roots the tree at `node_index` of `snapshot` and lists its first
    /// edges.
    pub async fn set_data_source(
        &mut self,
        snapshot: Arc<SnapshotProxy>,
        node_index: u32,
    ) -> Result<(), GridError> {
        self.reset();
        self.snapshot = Some(snapshot);
        self.grid = SortableDataGrid::new(Self::root_row(Some(node_index)), self.row_height);
        self.install_comparator();
        self.grid.take_events();
        debug!(kind = self.kind.name(), node_index, "object tree rooted");
        let root = self.grid.root();
        self.expand(root).await
    }

    pub async fn expand(&mut self, id: NodeId) -> Result<(), GridError> {
        let source = self.source()?;
        super::expand(&mut self.grid, &mut self.children, &source, id).await
    }

    pub fn collapse(&mut self, id: NodeId) {
        self.grid.collapse(id);
    }

    pub async fn populate_more(&mut self, id: NodeId) -> Result<usize, GridError> {
        super::populate_more(&mut self.grid, &mut self.children, id).await
    }

    /// Re-sorts every expanded level in the worker and re-fetches the rows
    /// already shown.
    pub async fn sorting_changed(&mut self, column: &str, ascending: bool) -> Result<(), GridError> {
        let column = Column::parse(self.kind.name(), &COLUMNS, column)?;
        self.column = column;
        self.ascending = ascending;
        let Some(outcome) =
            self.grid
                .sorting_changed(column.id(), ascending, edge_comparator(column, ascending))
        else {
            return Ok(());
        };
        if outcome.remote.is_empty() {
            return Ok(());
        }
        let source = self.source()?;
        super::resort_all(&mut self.grid, &mut self.children, &source, &outcome.remote).await
    }

    /// Drops every row under the root.
    pub fn reset(&mut self) {
        self.children.dispose_all();
        let root = self.grid.root();
        self.grid.remove_children(root);
        self.grid.reset_sorting_cache();
    }

    pub fn dispose(&mut self) {
        self.reset();
        self.snapshot = None;
    }
}
