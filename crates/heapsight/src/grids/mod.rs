//! The heap views: constructors, comparison, allocation and object trees.
//!
//! Top-level rows of the summary views are computed client side and sorted
//! locally. Everything below them comes from worker providers, which do the
//! sorting; a sort pass hands those rows back and they are re-fetched in the
//! new order.

use std::collections::HashMap;

use heapsight_grid::{GridRow, NodeId, SortableDataGrid, Tree, ViewportDataGrid};
use heapsight_types::{
    ComparatorConfig, DiffForClass, NodeFilter, NodeItem, ProviderItem, SerializedAllocationNode,
    SortField, SortKey,
};
use tracing::debug;

use crate::error::{GridError, RpcError};
use crate::proxy::ProviderProxy;

mod allocation;
mod constructors;
mod diff;
mod object_tree;

pub use allocation::AllocationGrid;
pub use constructors::ConstructorsGrid;
pub use diff::DiffGrid;
pub use object_tree::{ObjectTreeGrid, ObjectTreeKind};

// ── Columns ──────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Column {
    Object,
    Distance,
    ShallowSize,
    RetainedSize,
    Count,
    AddedCount,
    RemovedCount,
    CountDelta,
    AddedSize,
    RemovedSize,
    SizeDelta,
    LiveCount,
    LiveSize,
    Size,
    Name,
}

impl Column {
    pub fn id(self) -> &'static str {
        match self {
            Self::Object => "object",
            Self::Distance => "distance",
            Self::ShallowSize => "shallowSize",
            Self::RetainedSize => "retainedSize",
            Self::Count => "count",
            Self::AddedCount => "addedCount",
            Self::RemovedCount => "removedCount",
            Self::CountDelta => "countDelta",
            Self::AddedSize => "addedSize",
            Self::RemovedSize => "removedSize",
            Self::SizeDelta => "sizeDelta",
            Self::LiveCount => "liveCount",
            Self::LiveSize => "liveSize",
            Self::Size => "size",
            Self::Name => "name",
        }
    }

    /// Looks `id` up among the columns a grid shows.
    pub(crate) fn parse(grid: &'static str, columns: &[Column], id: &str) -> Result<Column, GridError> {
        columns
            .iter()
            .copied()
            .find(|column| column.id() == id)
            .ok_or_else(|| GridError::UnknownColumn {
                grid,
                column: id.to_string(),
            })
    }

    pub fn field(self) -> SortField {
        match self {
            Self::Object | Self::Name => SortField::Name,
            Self::Distance => SortField::Distance,
            Self::ShallowSize => SortField::ShallowSize,
            Self::RetainedSize => SortField::RetainedSize,
            Self::Count => SortField::Count,
            Self::AddedCount => SortField::AddedCount,
            Self::RemovedCount => SortField::RemovedCount,
            Self::CountDelta => SortField::CountDelta,
            Self::AddedSize => SortField::AddedSize,
            Self::RemovedSize => SortField::RemovedSize,
            Self::SizeDelta => SortField::SizeDelta,
            Self::LiveCount => SortField::LiveCount,
            Self::LiveSize => SortField::LiveSize,
            Self::Size => SortField::Size,
        }
    }
}

/// Order of instances listed under a class or diff row.
pub(crate) fn instance_comparator(column: Column, ascending: bool) -> ComparatorConfig {
    match column {
        Column::Object => ComparatorConfig::new(SortField::Id, ascending, SortField::RetainedSize, false),
        Column::Distance => {
            ComparatorConfig::new(SortField::Distance, ascending, SortField::RetainedSize, false)
        }
        Column::RetainedSize => {
            ComparatorConfig::new(SortField::RetainedSize, ascending, SortField::Id, true)
        }
        _ => ComparatorConfig::new(SortField::ShallowSize, ascending, SortField::Id, true),
    }
}

/// Order of the edges listed under an object.
pub(crate) fn edge_comparator(column: Column, ascending: bool) -> ComparatorConfig {
    match column {
        Column::Object | Column::Name => {
            ComparatorConfig::new(SortField::EdgeName, ascending, SortField::RetainedSize, false)
        }
        Column::Distance | Column::RetainedSize => {
            ComparatorConfig::new(column.field(), ascending, SortField::EdgeName, true)
        }
        _ => ComparatorConfig::new(SortField::ShallowSize, ascending, SortField::EdgeName, true),
    }
}

// ── Rows ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassRow {
    pub name: String,
    pub count: u32,
    pub distance: u32,
    pub shallow_size: u64,
    pub retained_size: u64,
    /// Filter the aggregate was computed with; instances are listed with it.
    pub filter: NodeFilter,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRow {
    pub diff: DiffForClass,
}

/// Which side of a comparison an instance comes from. Rows below a
/// deleted instance keep its mark: they live in the base snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffMark {
    Added,
    Deleted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeLabel {
    pub name: String,
    pub edge_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRow {
    /// The edge that led here. Instances listed under a class have none.
    pub edge: Option<EdgeLabel>,
    pub node: NodeItem,
    pub mark: Option<DiffMark>,
}

impl ObjectRow {
    fn from_item(item: ProviderItem, mark: Option<DiffMark>) -> Self {
        match item {
            ProviderItem::Node(node) => Self {
                edge: None,
                node,
                mark,
            },
            ProviderItem::Edge(edge) => Self {
                edge: Some(EdgeLabel {
                    name: edge.name,
                    edge_type: edge.edge_type,
                }),
                node: edge.node,
                mark,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeapRow {
    /// The invisible root. `node_index` is set for object trees, whose
    /// root stands for a heap node and sorts remotely.
    Root { node_index: Option<u32>, remote: bool },
    Class(ClassRow),
    Diff(DiffRow),
    Allocation(SerializedAllocationNode),
    Object(ObjectRow),
}

impl HeapRow {
    pub fn name(&self) -> &str {
        match self {
            Self::Root { .. } => "",
            Self::Class(class) => &class.name,
            Self::Diff(row) => &row.diff.name,
            Self::Allocation(node) => &node.name,
            Self::Object(object) => &object.node.name,
        }
    }
}

impl GridRow for HeapRow {
    fn sort_key(&self, field: SortField) -> SortKey<'_> {
        match self {
            Self::Root { .. } => SortKey::Number(0),
            Self::Class(class) => match field {
                SortField::Name => class.name.as_str().into(),
                SortField::Count => class.count.into(),
                SortField::Distance => class.distance.into(),
                SortField::ShallowSize => class.shallow_size.into(),
                SortField::RetainedSize => class.retained_size.into(),
                _ => SortKey::Number(0),
            },
            Self::Diff(row) => {
                let diff = &row.diff;
                match field {
                    SortField::Name => diff.name.as_str().into(),
                    SortField::Count => (diff.added_count + diff.removed_count).into(),
                    SortField::AddedCount => diff.added_count.into(),
                    SortField::RemovedCount => diff.removed_count.into(),
                    SortField::CountDelta => diff.count_delta.into(),
                    SortField::AddedSize => diff.added_size.into(),
                    SortField::RemovedSize => diff.removed_size.into(),
                    SortField::SizeDelta => diff.size_delta.into(),
                    _ => SortKey::Number(0),
                }
            }
            Self::Allocation(node) => match field {
                SortField::Name => node.name.as_str().into(),
                SortField::Count => node.count.into(),
                SortField::Size => node.size.into(),
                SortField::LiveCount => node.live_count.into(),
                SortField::LiveSize => node.live_size.into(),
                _ => SortKey::Number(0),
            },
            Self::Object(object) => match field {
                SortField::Name => object.node.name.as_str().into(),
                SortField::EdgeName => object
                    .edge
                    .as_ref()
                    .map_or(object.node.name.as_str(), |edge| edge.name.as_str())
                    .into(),
                SortField::Id => object.node.id.into(),
                SortField::Distance => object.node.distance.into(),
                SortField::ShallowSize => object.node.shallow_size.into(),
                SortField::RetainedSize => object.node.retained_size.into(),
                _ => SortKey::Number(0),
            },
        }
    }

    fn has_children(&self) -> bool {
        match self {
            Self::Root { .. } => true,
            Self::Class(class) => class.count > 0,
            Self::Diff(row) => row.diff.has_changes(),
            // Callers of an allocation site are not served by the worker.
            Self::Allocation(_) => false,
            Self::Object(object) => object.node.has_children,
        }
    }

    fn filter_name(&self) -> Option<&str> {
        match self {
            Self::Class(_) | Self::Diff(_) | Self::Allocation(_) => Some(self.name()),
            Self::Root { .. } | Self::Object(_) => None,
        }
    }

    fn sorts_remotely(&self) -> bool {
        match self {
            Self::Root { remote, .. } => *remote,
            Self::Class(_) | Self::Diff(_) | Self::Object(_) => true,
            Self::Allocation(_) => false,
        }
    }
}

// ── Surfaces ─────────────────────────────────────────────────────────────────

/// A grid the provider helpers can fill: plain or virtualized.
pub(crate) trait GridSurface {
    fn rows(&self) -> &SortableDataGrid<HeapRow>;
    fn rows_mut(&mut self) -> &mut SortableDataGrid<HeapRow>;
    /// Brings what is on screen up to date after a structural change.
    fn refresh(&mut self);
}

impl GridSurface for ViewportDataGrid<HeapRow> {
    fn rows(&self) -> &SortableDataGrid<HeapRow> {
        self.grid()
    }

    fn rows_mut(&mut self) -> &mut SortableDataGrid<HeapRow> {
        self.grid_mut()
    }

    fn refresh(&mut self) {
        self.update_visible_nodes(true);
    }
}

impl GridSurface for SortableDataGrid<HeapRow> {
    fn rows(&self) -> &SortableDataGrid<HeapRow> {
        self
    }

    fn rows_mut(&mut self) -> &mut SortableDataGrid<HeapRow> {
        self
    }

    fn refresh(&mut self) {}
}

// ── Provider-backed children ─────────────────────────────────────────────────

/// How a grid finds and orders the remote children of its rows.
pub(crate) trait ChildSource: Send + Sync {
    fn providers(&self, row: &HeapRow) -> Result<Vec<(ProviderProxy, Option<DiffMark>)>, RpcError>;
    fn comparator(&self, row: &HeapRow) -> ComparatorConfig;
}

struct ProviderSource {
    provider: ProviderProxy,
    mark: Option<DiffMark>,
    fetched: u32,
    total: Option<u32>,
}

impl ProviderSource {
    fn is_exhausted(&self) -> bool {
        self.total.is_some_and(|total| self.fetched >= total)
    }
}

/// Providers of every populated node, read one after the other.
pub(crate) struct ProviderChildren {
    sources: HashMap<NodeId, Vec<ProviderSource>>,
    populate_count: u32,
}

impl ProviderChildren {
    pub(crate) fn new(populate_count: u32) -> Self {
        Self {
            sources: HashMap::new(),
            populate_count,
        }
    }

    pub(crate) fn populate_count(&self) -> u32 {
        self.populate_count
    }

    fn has(&self, id: NodeId) -> bool {
        self.sources.contains_key(&id)
    }

    fn attach(&mut self, id: NodeId, providers: Vec<(ProviderProxy, Option<DiffMark>)>) {
        let sources = providers
            .into_iter()
            .map(|(provider, mark)| ProviderSource {
                provider,
                mark,
                fetched: 0,
                total: None,
            })
            .collect();
        if let Some(previous) = self.sources.insert(id, sources) {
            dispose_sources(previous);
        }
    }

    /// Items fetched so far under `id`.
    pub(crate) fn fetched(&self, id: NodeId) -> u32 {
        self.sources
            .get(&id)
            .map_or(0, |sources| sources.iter().map(|source| source.fetched).sum())
    }

    /// Whether some provider under `id` still has unfetched items.
    pub(crate) fn has_more(&self, id: NodeId) -> bool {
        self.sources
            .get(&id)
            .is_some_and(|sources| sources.iter().any(|source| !source.is_exhausted()))
    }

    async fn rewind(&mut self, id: NodeId, comparator: ComparatorConfig) -> Result<(), RpcError> {
        let Some(sources) = self.sources.get_mut(&id) else {
            return Ok(());
        };
        for source in sources {
            source.provider.sort_and_rewind(comparator).await?;
            source.fetched = 0;
            source.total = None;
        }
        Ok(())
    }

    async fn fetch(&mut self, id: NodeId, count: u32) -> Result<Vec<HeapRow>, RpcError> {
        let mut rows = Vec::new();
        let Some(sources) = self.sources.get_mut(&id) else {
            return Ok(rows);
        };
        let mut wanted = count;
        for source in sources {
            if wanted == 0 {
                break;
            }
            if source.is_exhausted() {
                continue;
            }
            let start = source.fetched;
            let range = source
                .provider
                .serialize_items_range(start, start.saturating_add(wanted))
                .await?;
            source.fetched = range.end_position;
            source.total = Some(range.total_length);
            wanted = wanted.saturating_sub(range.end_position - range.start_position);
            rows.extend(
                range
                    .items
                    .into_iter()
                    .map(|item| HeapRow::Object(ObjectRow::from_item(item, source.mark))),
            );
        }
        Ok(rows)
    }

    /// Position of `snapshot_object_id` among the children of `id`, counting
    /// earlier providers in full.
    async fn node_position(&mut self, id: NodeId, snapshot_object_id: u64) -> Result<Option<u32>, RpcError> {
        let Some(sources) = self.sources.get_mut(&id) else {
            return Ok(None);
        };
        let mut offset = 0;
        for source in sources {
            if let Some(position) = source.provider.node_position(snapshot_object_id).await? {
                return Ok(Some(offset + position));
            }
            let total = match source.total {
                Some(total) => total,
                None => source.provider.serialize_items_range(0, 0).await?.total_length,
            };
            offset += total;
        }
        Ok(None)
    }

    fn forget(&mut self, id: NodeId) {
        if let Some(sources) = self.sources.remove(&id) {
            dispose_sources(sources);
        }
    }

    /// Disposes the providers of nodes that left the tree.
    fn retain_live(&mut self, tree: &Tree<HeapRow>) {
        let stale: Vec<NodeId> = self
            .sources
            .keys()
            .copied()
            .filter(|&id| !tree.contains(id))
            .collect();
        for id in stale {
            self.forget(id);
        }
    }

    pub(crate) fn dispose_all(&mut self) {
        for (_, sources) in self.sources.drain() {
            dispose_sources(sources);
        }
    }
}

fn dispose_sources(sources: Vec<ProviderSource>) {
    for source in sources {
        source.provider.dispose();
    }
}

// ── Shared grid operations ───────────────────────────────────────────────────

/// Expands `id`, fetching its first page of children when needed, and
/// re-fetches any rows the expansion had to re-sort.
pub(crate) async fn expand<S: GridSurface>(
    surface: &mut S,
    children: &mut ProviderChildren,
    source: &dyn ChildSource,
    id: NodeId,
) -> Result<(), GridError> {
    let expansion = surface.rows_mut().expand(id);
    surface.refresh();
    if expansion.needs_population {
        populate(surface, children, source, id).await?;
    }
    resort_all(surface, children, source, &expansion.sort.remote).await?;
    if expansion.sort.complete {
        surface.refresh();
    }
    Ok(())
}

async fn populate<S: GridSurface>(
    surface: &mut S,
    children: &mut ProviderChildren,
    source: &dyn ChildSource,
    id: NodeId,
) -> Result<(), GridError> {
    if !surface.rows_mut().begin_populate(id) {
        return Ok(());
    }
    match first_page(surface.rows(), children, source, id).await {
        Ok(rows) => {
            surface.rows_mut().finish_populate(id, rows);
            surface.refresh();
            Ok(())
        }
        Err(e) => {
            surface.rows_mut().cancel_populate(id);
            children.forget(id);
            Err(e)
        }
    }
}

async fn first_page(
    rows: &SortableDataGrid<HeapRow>,
    children: &mut ProviderChildren,
    source: &dyn ChildSource,
    id: NodeId,
) -> Result<Vec<HeapRow>, GridError> {
    let row = rows.data(id).ok_or(GridError::NoDataSource)?;
    let comparator = source.comparator(row);
    if !children.has(id) {
        let providers = source.providers(row)?;
        children.attach(id, providers);
    }
    children.rewind(id, comparator).await?;
    let count = children.populate_count();
    Ok(children.fetch(id, count).await?)
}

/// Re-fetches the children of each row handed back by a sort pass. Every
/// row's sorting level is closed, whatever the outcome.
pub(crate) async fn resort_all<S: GridSurface>(
    surface: &mut S,
    children: &mut ProviderChildren,
    source: &dyn ChildSource,
    remote: &[NodeId],
) -> Result<(), GridError> {
    let mut first_error = None;
    for &id in remote {
        let result = refetch(surface, children, source, id).await;
        if surface.rows_mut().finish_remote_sort(id) {
            surface.refresh();
        }
        if let Err(e) = result
            && first_error.is_none()
        {
            first_error = Some(e);
        }
    }
    first_error.map_or(Ok(()), Err)
}

async fn refetch<S: GridSurface>(
    surface: &mut S,
    children: &mut ProviderChildren,
    source: &dyn ChildSource,
    id: NodeId,
) -> Result<(), GridError> {
    if !surface.rows().tree().contains(id) {
        return Ok(());
    }
    let count = children.fetched(id).max(children.populate_count());
    surface.rows_mut().remove_children(id);
    children.retain_live(surface.rows().tree());
    let Some(row) = surface.rows().data(id) else {
        return Ok(());
    };
    let comparator = source.comparator(row);
    if !children.has(id) {
        let providers = source.providers(row)?;
        children.attach(id, providers);
    }
    children.rewind(id, comparator).await?;
    let rows = children.fetch(id, count).await?;
    debug!(rows = rows.len(), "re-fetched children in new order");
    let grid = surface.rows_mut();
    grid.begin_populate(id);
    grid.finish_populate(id, rows);
    Ok(())
}

/// Appends the next page of children under `id`. Returns how many rows
/// were added.
pub(crate) async fn populate_more<S: GridSurface>(
    surface: &mut S,
    children: &mut ProviderChildren,
    id: NodeId,
) -> Result<usize, GridError> {
    let count = children.populate_count();
    fetch_into(surface, children, id, count).await
}

async fn fetch_into<S: GridSurface>(
    surface: &mut S,
    children: &mut ProviderChildren,
    id: NodeId,
    count: u32,
) -> Result<usize, GridError> {
    if count == 0 || !children.has_more(id) {
        return Ok(0);
    }
    let rows = children.fetch(id, count).await?;
    let added = surface.rows_mut().append_children(id, rows).len();
    surface.refresh();
    Ok(added)
}

/// Expands `parent` and fetches children until the instance with
/// `snapshot_object_id` is present. Returns the path to it.
pub(crate) async fn populate_node_by_object_id<S: GridSurface>(
    surface: &mut S,
    children: &mut ProviderChildren,
    source: &dyn ChildSource,
    parent: NodeId,
    snapshot_object_id: u64,
) -> Result<Option<Vec<NodeId>>, GridError> {
    expand(surface, children, source, parent).await?;
    let Some(position) = children.node_position(parent, snapshot_object_id).await? else {
        return Ok(None);
    };
    let fetched = children.fetched(parent);
    if position >= fetched {
        fetch_into(surface, children, parent, position + 1 - fetched).await?;
    }
    let rows = surface.rows();
    let child = rows.children(parent).iter().copied().find(|&child| {
        matches!(rows.data(child), Some(HeapRow::Object(object)) if object.node.id == snapshot_object_id)
    });
    Ok(child.map(|child| {
        let mut path = rows.tree().path_to(parent);
        path.push(child);
        path
    }))
}
