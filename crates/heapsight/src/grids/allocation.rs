use heapsight_grid::{GridEvent, NodeId, ViewportConfig, ViewportDataGrid};
use heapsight_types::ComparatorConfig;
use tracing::debug;

use super::{Column, HeapRow};
use crate::error::GridError;
use crate::proxy::SnapshotProxy;

const COLUMNS: [Column; 5] = [
    Column::LiveCount,
    Column::Count,
    Column::LiveSize,
    Column::Size,
    Column::Name,
];

/// Allocating functions with their totals. Rows are sorted on a single key.
pub struct AllocationGrid {
    view: ViewportDataGrid<HeapRow>,
}

impl AllocationGrid {
    pub fn new(config: ViewportConfig) -> Self {
        let mut view = ViewportDataGrid::new(
            HeapRow::Root {
                node_index: None,
                remote: false,
            },
            config,
        );
        view.sorting_changed(
            Column::Size.id(),
            false,
            ComparatorConfig::single(Column::Size.field(), false),
        );
        Self { view }
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

    pub async fn set_data_source(&mut self, snapshot: &SnapshotProxy) -> Result<(), GridError> {
        let tops = snapshot.allocation_traces_tops().await?;
        debug!(functions = tops.len(), "allocation tops loaded");
        self.view.remove_top_level_nodes();
        let root = self.view.grid().root();
        self.view
            .grid_mut()
            .append_children(root, tops.into_iter().map(HeapRow::Allocation));
        self.view.sort(true);
        Ok(())
    }

    pub fn sorting_changed(&mut self, column: &str, ascending: bool) -> Result<(), GridError> {
        let column = Column::parse("allocation", &COLUMNS, column)?;
        self.view.sorting_changed(
            column.id(),
            ascending,
            ComparatorConfig::single(column.field(), ascending),
        );
        Ok(())
    }

    /// Id to pass to the constructors view to list what a row allocated.
    pub fn allocation_node_id(&self, id: NodeId) -> Option<u64> {
        match self.view.grid().data(id) {
            Some(HeapRow::Allocation(node)) => Some(node.id),
            _ => None,
        }
    }

    pub fn dispose(&mut self) {
        self.view.remove_top_level_nodes();
    }
}
