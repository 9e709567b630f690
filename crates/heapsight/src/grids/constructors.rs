use std::sync::Arc;

use heapsight_grid::{GridEvent, NodeId, Reveal, ViewportConfig, ViewportDataGrid};
use heapsight_types::{Aggregates, ComparatorConfig, NodeFilter, SortField};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{
    ChildSource, ClassRow, Column, DiffMark, HeapRow, ProviderChildren, edge_comparator,
    instance_comparator,
};
use crate::coalesce::{Completion, FilterCoalescer};
use crate::error::{GridError, RpcError};
use crate::proxy::{ProviderProxy, SnapshotProxy};

const COLUMNS: [Column; 4] = [
    Column::Object,
    Column::Distance,
    Column::ShallowSize,
    Column::RetainedSize,
];

type AggregatesTask = JoinHandle<Result<Aggregates, RpcError>>;

fn sort_fields(column: Column, ascending: bool) -> ComparatorConfig {
    match column {
        Column::Object => ComparatorConfig::new(SortField::Name, ascending, SortField::RetainedSize, false),
        Column::Distance => {
            ComparatorConfig::new(SortField::Distance, ascending, SortField::RetainedSize, false)
        }
        other => ComparatorConfig::new(other.field(), ascending, SortField::Name, true),
    }
}

struct Instances {
    snapshot: Arc<SnapshotProxy>,
    column: Column,
    ascending: bool,
}

impl ChildSource for Instances {
    fn providers(&self, row: &HeapRow) -> Result<Vec<(ProviderProxy, Option<DiffMark>)>, RpcError> {
        let provider = match row {
            HeapRow::Class(class) => self
                .snapshot
                .create_nodes_provider_for_class(&class.name, class.filter.clone())?,
            HeapRow::Object(object) => self.snapshot.create_edges_provider(object.node.node_index)?,
            _ => return Ok(Vec::new()),
        };
        Ok(vec![(provider, None)])
    }

    fn comparator(&self, row: &HeapRow) -> ComparatorConfig {
        match row {
            HeapRow::Class(_) => instance_comparator(self.column, self.ascending),
            _ => edge_comparator(self.column, self.ascending),
        }
    }
}

/// Objects grouped by class, for the whole heap or a range of object ids.
pub struct ConstructorsGrid {
    view: ViewportDataGrid<HeapRow>,
    snapshot: Option<Arc<SnapshotProxy>>,
    children: ProviderChildren,
    coalescer: FilterCoalescer,
    in_flight: Option<(NodeFilter, AggregatesTask)>,
    filter: NodeFilter,
    column: Column,
    ascending: bool,
    object_to_select: Option<u64>,
}

impl ConstructorsGrid {
    pub fn new(config: ViewportConfig) -> Self {
        let mut view = ViewportDataGrid::new(
            HeapRow::Root {
                node_index: None,
                remote: false,
            },
            config,
        );
        let (column, ascending) = (Column::RetainedSize, false);
        view.sorting_changed(column.id(), ascending, sort_fields(column, ascending));
        Self {
            view,
            snapshot: None,
            children: ProviderChildren::new(100),
            coalescer: FilterCoalescer::new(),
            in_flight: None,
            filter: NodeFilter::everything(),
            column,
            ascending,
            object_to_select: None,
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

    /// Filter the displayed classes were computed with.
    pub fn filter(&self) -> &NodeFilter {
        &self.filter
    }

    pub fn class_node(&self, name: &str) -> Option<NodeId> {
        let grid = self.view.grid();
        grid.top_level_nodes()
            .iter()
            .copied()
            .find(|&id| matches!(grid.data(id), Some(HeapRow::Class(class)) if class.name == name))
    }

    fn source(&self) -> Result<Instances, GridError> {
        let snapshot = self.snapshot.clone().ok_or(GridError::NoDataSource)?;
        Ok(Instances {
            snapshot,
            column: self.column,
            ascending: self.ascending,
        })
    }

    // ── Data source and filters ──────────────────────────────

    /// Shows `snapshot` unfiltered. The classes arrive with
    /// [`next_aggregates`](Self::next_aggregates).
    pub fn set_data_source(&mut self, snapshot: Arc<SnapshotProxy>) -> Result<(), GridError> {
        self.clear();
        self.snapshot = Some(snapshot);
        self.request_aggregates(NodeFilter::everything())
    }

    /// Limits the view to objects with ids in `(min_node_id, max_node_id]`.
    pub fn set_selection_range(&mut self, min_node_id: u64, max_node_id: u64) -> Result<(), GridError> {
        self.request_aggregates(NodeFilter::id_range(min_node_id, max_node_id))
    }

    pub fn set_allocation_node_id(&mut self, allocation_node_id: u64) -> Result<(), GridError> {
        self.request_aggregates(NodeFilter::allocation_node(allocation_node_id))
    }

    /// Limits the view to the objects allocated between the snapshot before
    /// `index` and the one at `index`, given each snapshot's last object id.
    /// `None` shows everything.
    pub fn filter_select_index_changed(
        &mut self,
        max_object_ids: &[u64],
        index: Option<usize>,
    ) -> Result<(), GridError> {
        let filter = match index {
            Some(index) if index < max_object_ids.len() => {
                let min = if index > 0 { max_object_ids[index - 1] } else { 0 };
                NodeFilter::id_range(min, max_object_ids[index])
            }
            Some(index) => {
                warn!(index, profiles = max_object_ids.len(), "filter index out of range");
                NodeFilter::everything()
            }
            None => NodeFilter::everything(),
        };
        self.request_aggregates(filter)
    }

    fn request_aggregates(&mut self, filter: NodeFilter) -> Result<(), GridError> {
        if self.snapshot.is_none() {
            return Err(GridError::NoDataSource);
        }
        if let Some(filter) = self.coalescer.request(filter) {
            self.spawn_request(filter)?;
        }
        Ok(())
    }

    fn spawn_request(&mut self, filter: NodeFilter) -> Result<(), GridError> {
        let snapshot = self.snapshot.clone().ok_or(GridError::NoDataSource)?;
        debug!(?filter, "requesting aggregates");
        let request = filter.clone();
        let task = tokio::spawn(async move { snapshot.aggregates_with_filter(request).await });
        self.in_flight = Some((filter, task));
        Ok(())
    }

    /// Waits for the outstanding aggregates request and shows its classes.
    /// Superseded responses are dropped and the latest filter is requested
    /// instead. Returns false when nothing was outstanding.
    pub async fn next_aggregates(&mut self) -> Result<bool, GridError> {
        loop {
            let Some((filter, task)) = self.in_flight.take() else {
                return Ok(false);
            };
            let result = task
                .await
                .map_err(|e| RpcError::Transport(format!("aggregates task failed: {e}")))
                .and_then(|result| result);
            match self.coalescer.complete(&filter) {
                Completion::Apply => {
                    let aggregates = match result {
                        Ok(aggregates) => aggregates,
                        Err(e) => {
                            self.coalescer.clear();
                            return Err(e.into());
                        }
                    };
                    self.apply_aggregates(filter, aggregates);
                    if let Some(id) = self.object_to_select.take() {
                        self.reveal_object_by_heap_snapshot_id(id).await?;
                    }
                    return Ok(true);
                }
                Completion::Reissue(next) => {
                    debug!(?filter, ?next, "dropping superseded aggregates");
                    self.spawn_request(next)?;
                }
                Completion::Stale => {}
            }
        }
    }

    fn apply_aggregates(&mut self, filter: NodeFilter, aggregates: Aggregates) {
        self.children.dispose_all();
        self.view.remove_top_level_nodes();
        let rows = aggregates.into_values().map(|aggregate| {
            HeapRow::Class(ClassRow {
                name: aggregate.name,
                count: aggregate.count,
                distance: aggregate.distance,
                shallow_size: aggregate.shallow_size,
                retained_size: aggregate.retained_size,
                filter: filter.clone(),
            })
        });
        let root = self.view.grid().root();
        let added = self.view.grid_mut().append_children(root, rows).len();
        self.filter = filter;
        self.view.sort(true);
        debug!(classes = added, "constructors updated");
    }

    // ── Tree operations ──────────────────────────────────────

    pub async fn expand(&mut self, id: NodeId) -> Result<(), GridError> {
        let source = self.source()?;
        super::expand(&mut self.view, &mut self.children, &source, id).await
    }

    /// Expands the class named `name`, listing its first instances.
    pub async fn expand_class(&mut self, name: &str) -> Result<Option<NodeId>, GridError> {
        let Some(id) = self.class_node(name) else {
            return Ok(None);
        };
        self.expand(id).await?;
        Ok(Some(id))
    }

    pub async fn populate_more(&mut self, id: NodeId) -> Result<usize, GridError> {
        super::populate_more(&mut self.view, &mut self.children, id).await
    }

    /// Scrolls to the instance with `snapshot_object_id`, expanding its
    /// class and fetching instances as far as needed. Before a data source
    /// is set, the request is kept and served once classes arrive.
    pub async fn reveal_object_by_heap_snapshot_id(
        &mut self,
        snapshot_object_id: u64,
    ) -> Result<Option<Reveal>, GridError> {
        let Some(snapshot) = self.snapshot.clone() else {
            self.object_to_select = Some(snapshot_object_id);
            return Ok(None);
        };
        if self.view.grid().top_level_nodes().is_empty() && self.in_flight.is_some() {
            self.object_to_select = Some(snapshot_object_id);
            return Ok(None);
        }
        let Some(class_name) = snapshot.node_class_name(snapshot_object_id).await? else {
            return Ok(None);
        };
        let Some(parent) = self.class_node(&class_name) else {
            return Ok(None);
        };
        let source = self.source()?;
        let path = super::populate_node_by_object_id(
            &mut self.view,
            &mut self.children,
            &source,
            parent,
            snapshot_object_id,
        )
        .await?;
        Ok(path.and_then(|path| self.view.reveal_tree_node(&path)))
    }

    pub async fn sorting_changed(&mut self, column: &str, ascending: bool) -> Result<(), GridError> {
        let column = Column::parse("constructors", &COLUMNS, column)?;
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

    // ── Teardown ─────────────────────────────────────────────

    /// Drops every row and forgets pending and applied filters.
    pub fn clear(&mut self) {
        if let Some((_, task)) = self.in_flight.take() {
            task.abort();
        }
        self.coalescer.clear();
        self.children.dispose_all();
        self.view.remove_top_level_nodes();
        self.filter = NodeFilter::everything();
    }

    /// Releases every provider. The snapshot itself belongs to the caller.
    pub fn dispose(&mut self) {
        self.clear();
        self.snapshot = None;
        self.object_to_select = None;
    }
}
