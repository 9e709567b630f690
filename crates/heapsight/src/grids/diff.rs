use std::sync::Arc;

use heapsight_grid::{GridEvent, NodeId, ViewportConfig, ViewportDataGrid};
use heapsight_types::{ComparatorConfig, SortField};
use tracing::debug;

use super::{
    ChildSource, Column, DiffMark, DiffRow, HeapRow, ProviderChildren, edge_comparator,
    instance_comparator,
};
use crate::error::{GridError, RpcError};
use crate::proxy::{ProviderProxy, SnapshotProxy};

const COLUMNS: [Column; 7] = [
    Column::Object,
    Column::AddedCount,
    Column::RemovedCount,
    Column::CountDelta,
    Column::AddedSize,
    Column::RemovedSize,
    Column::SizeDelta,
];

fn sort_fields(column: Column, ascending: bool) -> ComparatorConfig {
    match column {
        Column::Object => ComparatorConfig::new(SortField::Name, ascending, SortField::Count, false),
        other => ComparatorConfig::new(other.field(), ascending, SortField::Name, true),
    }
}

struct Changes {
    snapshot: Arc<SnapshotProxy>,
    base: Arc<SnapshotProxy>,
    column: Column,
    ascending: bool,
}

impl ChildSource for Changes {
    fn providers(&self, row: &HeapRow) -> Result<Vec<(ProviderProxy, Option<DiffMark>)>, RpcError> {
        match row {
            HeapRow::Diff(DiffRow { diff }) => {
                let mut providers = Vec::with_capacity(2);
                if diff.added_count > 0 {
                    let added = self
                        .snapshot
                        .create_added_nodes_provider(self.base.uid(), &diff.name)?;
                    providers.push((added, Some(DiffMark::Added)));
                }
                if diff.removed_count > 0 {
                    let deleted = self
                        .base
                        .create_deleted_nodes_provider(diff.deleted_indexes.clone())?;
                    providers.push((deleted, Some(DiffMark::Deleted)));
                }
                Ok(providers)
            }
            HeapRow::Object(object) => {
                let owner = match object.mark {
                    Some(DiffMark::Deleted) => &self.base,
                    _ => &self.snapshot,
                };
                let edges = owner.create_edges_provider(object.node.node_index)?;
                Ok(vec![(edges, object.mark)])
            }
            _ => Ok(Vec::new()),
        }
    }

    fn comparator(&self, row: &HeapRow) -> ComparatorConfig {
        match row {
            HeapRow::Diff(_) => instance_comparator(self.column, self.ascending),
            _ => edge_comparator(self.column, self.ascending),
        }
    }
}

/// Per-class changes between a base snapshot and the current one.
pub struct DiffGrid {
    view: ViewportDataGrid<HeapRow>,
    snapshot: Option<Arc<SnapshotProxy>>,
    base: Option<Arc<SnapshotProxy>>,
    children: ProviderChildren,
    column: Column,
    ascending: bool,
}

impl DiffGrid {
    pub fn new(config: ViewportConfig) -> Self {
        let mut view = ViewportDataGrid::new(
            HeapRow::Root {
                node_index: None,
                remote: false,
            },
            config,
        );
        let (column, ascending) = (Column::AddedSize, false);
        view.sorting_changed(column.id(), ascending, sort_fields(column, ascending));
        Self {
            view,
            snapshot: None,
            base: None,
            children: ProviderChildren::new(50),
            column,
            ascending,
        }
    }

    pub fn view(&self) -> &ViewportDataGrid<HeapRow> {
        &self.view
    }

    pub fn view_mut(&mut self) -> &mut ViewportDataGrid<HeapRow> {
        &mut self.view
    }

    pub fn take_events(&mut self) -> Vec<GridEvent> {
        self.view.grid_mut().take_events()
    }

    pub fn class_node(&self, name: &str) -> Option<NodeId> {
        let grid = self.view.grid();
        grid.top_level_nodes()
            .iter()
            .copied()
            .find(|&id| grid.data(id).is_some_and(|row| row.name() == name))
    }

    fn source(&self) -> Result<Changes, GridError> {
        match (&self.snapshot, &self.base) {
            (Some(snapshot), Some(base)) => Ok(Changes {
                snapshot: snapshot.clone(),
                base: base.clone(),
                column: self.column,
                ascending: self.ascending,
            }),
            _ => Err(GridError::NoDataSource),
        }
    }

    /// Sets the snapshot being compared. Takes effect with the next
    /// [`set_base_data_source`](Self::set_base_data_source).
    pub fn set_data_source(&mut self, snapshot: Arc<SnapshotProxy>) {
        self.snapshot = Some(snapshot);
    }

    /// Compares the current snapshot against `base`. Comparing a snapshot
    /// with itself leaves the grid empty and only reports the sort as done.
    pub async fn set_base_data_source(&mut self, base: Arc<SnapshotProxy>) -> Result<(), GridError> {
        let snapshot = self.snapshot.clone().ok_or(GridError::NoDataSource)?;
        self.children.dispose_all();
        self.view.remove_top_level_nodes();
        self.view.grid_mut().reset_sorting_cache();
        let same = base.same_object(&snapshot);
        self.base = Some(base.clone());
        if same {
            self.view.recursive_sorting_enter();
            self.view.recursive_sorting_leave();
            return Ok(());
        }

        let digest = base.aggregates_for_diff().await?;
        let diffs = snapshot.calculate_snapshot_diff(base.uid(), digest).await?;
        debug!(classes = diffs.len(), base = %base.uid(), "snapshot diff computed");
        let root = self.view.grid().root();
        self.view
            .grid_mut()
            .append_children(root, diffs.into_iter().map(|diff| HeapRow::Diff(DiffRow { diff })));
        let (column, ascending) = (self.column, self.ascending);
        self.sorting_changed(column.id(), ascending).await
    }

    pub async fn expand(&mut self, id: NodeId) -> Result<(), GridError> {
        let source = self.source()?;
        super::expand(&mut self.view, &mut self.children, &source, id).await
    }

    pub async fn populate_more(&mut self, id: NodeId) -> Result<usize, GridError> {
        super::populate_more(&mut self.view, &mut self.children, id).await
    }

    pub async fn sorting_changed(&mut self, column: &str, ascending: bool) -> Result<(), GridError> {
        let column = Column::parse("diff", &COLUMNS, column)?;
        self.column = column;
        self.ascending = ascending;
        let Some(outcome) = self
            .view
            .sorting_changed(column.id(), ascending, sort_fields(column, ascending))
        else {
            return Ok(());
        };
        if outcome.remote.is_empty() {
            return Ok(());
        }
        let source = self.source()?;
        super::resort_all(&mut self.view, &mut self.children, &source, &outcome.remote).await
    }

    pub fn dispose(&mut self) {
        self.children.dispose_all();
        self.view.remove_top_level_nodes();
        self.snapshot = None;
        self.base = None;
    }
}
