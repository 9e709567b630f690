//! Virtualized rendering over a [`SortableDataGrid`].
//!
//! Only rows that intersect the scroll window (widened by a guard zone and a
//! hysteresis margin) are attached. Everything above and below is folded
//! into two padding heights, so the logical scroll height always matches
//! the full expanded tree.

use heapsight_types::ComparatorConfig;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::sortable::{Expansion, GridRow, SortOutcome, SortableDataGrid};
use crate::tree::NodeId;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ViewportConfig {
    /// Rows always kept attached beyond each edge of the viewport.
    pub guard_zone: f64,
    /// Extra margin materialized on each side once a refresh is needed.
    pub hysteresis: f64,
    /// Space left above a revealed row.
    pub reveal_scroll_gap: f64,
    pub row_height: f64,
}

impl Default for ViewportConfig {
    fn default() -> Self {
        Self {
            guard_zone: 40.0,
            hysteresis: 500.0,
            reveal_scroll_gap: 40.0,
            row_height: 20.0,
        }
    }
}

/// Outcome of [`ViewportDataGrid::reveal_tree_node`].
#[derive(Debug)]
pub enum Reveal {
    Visible(NodeId),
    /// The grid scrolled; resolves after the next scroll or animation frame.
    Pending(oneshot::Receiver<NodeId>),
}

pub struct ViewportDataGrid<T> {
    grid: SortableDataGrid<T>,
    config: ViewportConfig,
    scroll_top: f64,
    client_height: f64,
    scroll_height: f64,
    top_padding: f64,
    bottom_padding: f64,
    visible: Vec<NodeId>,
    pending_reveal: Option<(NodeId, oneshot::Sender<NodeId>)>,
}

impl<T: GridRow> ViewportDataGrid<T> {
    pub fn new(root: T, config: ViewportConfig) -> Self {
        Self {
            grid: SortableDataGrid::new(root, config.row_height),
            config,
            scroll_top: 0.0,
            client_height: 0.0,
            scroll_height: 0.0,
            top_padding: 0.0,
            bottom_padding: 0.0,
            visible: Vec::new(),
            pending_reveal: None,
        }
    }

    pub fn config(&self) -> &ViewportConfig {
        &self.config
    }

    pub fn grid(&self) -> &SortableDataGrid<T> {
        &self.grid
    }

    /// Direct access to the underlying grid. Structural changes made through
    /// it take effect on screen after `update_visible_nodes(true)`.
    pub fn grid_mut(&mut self) -> &mut SortableDataGrid<T> {
        &mut self.grid
    }

    /// Attached rows in display order.
    pub fn visible_rows(&self) -> &[NodeId] {
        &self.visible
    }

    pub fn scroll_top(&self) -> f64 {
        self.scroll_top
    }

    pub fn client_height(&self) -> f64 {
        self.client_height
    }

    pub fn scroll_height(&self) -> f64 {
        self.scroll_height
    }

    pub fn padding(&self) -> (f64, f64) {
        (self.top_padding, self.bottom_padding)
    }

    // ── Scroll geometry ──────────────────────────────────────

    /// Moves the scroll position, clamped to the scrollable range. Call
    /// [`on_scroll`](Self::on_scroll) afterwards, as a scroll event would.
    pub fn set_scroll_top(&mut self, scroll_top: f64) {
        let max = (self.scroll_height - self.client_height).max(0.0);
        self.scroll_top = scroll_top.clamp(0.0, max);
    }

    pub fn scroll_to(&mut self, scroll_top: f64) {
        self.set_scroll_top(scroll_top);
        self.on_scroll();
    }

    pub fn on_scroll(&mut self) {
        self.update_visible_nodes(false);
        self.resolve_pending_reveal();
    }

    pub fn on_resize(&mut self, client_height: f64) {
        self.client_height = client_height.max(0.0);
        self.update_visible_nodes(false);
    }

    /// Resolves a reveal whose scroll never produced a scroll event, for
    /// example because the position did not change.
    pub fn on_animation_frame(&mut self) {
        self.resolve_pending_reveal();
    }

    fn resolve_pending_reveal(&mut self) {
        if let Some((node, resolve)) = self.pending_reveal.take() {
            let _ = resolve.send(node);
        }
    }

    // ── Visible rows ─────────────────────────────────────────

    /// Re-materializes the rows around the viewport. Without `force`, does
    /// nothing while the attached rows still cover the guarded viewport.
    /// Returns whether the attached set was rebuilt.
    pub fn update_visible_nodes(&mut self, force: bool) -> bool {
        if force {
            self.scroll_height = self.content_height();
            self.set_scroll_top(self.scroll_top);
        }

        let guard = self.config.guard_zone;
        let mut scroll_top = self.scroll_top;
        let mut scroll_bottom = self.scroll_height - scroll_top - self.client_height;
        scroll_top = (scroll_top - guard).max(0.0);
        scroll_bottom = (scroll_bottom - guard).max(0.0);
        let mut viewport_height = self.scroll_height - scroll_top - scroll_bottom;

        if !force && scroll_top >= self.top_padding && scroll_bottom >= self.bottom_padding {
            return false;
        }

        let hysteresis = self.config.hysteresis;
        scroll_top -= hysteresis;
        viewport_height += 2.0 * hysteresis;

        for id in std::mem::take(&mut self.visible) {
            if let Some(node) = self.grid.tree_mut().get_mut(id) {
                node.attached = false;
            }
        }
        self.top_padding = 0.0;
        self.bottom_padding = 0.0;

        let root = self.grid.root();
        let total = self.add_visible_nodes(root, scroll_top, scroll_top + viewport_height);
        self.scroll_height = total;

        if let Some(selected) = self.grid.selected()
            && !self.grid.tree().contains(selected)
        {
            self.grid.select(None);
        }
        debug!(
            attached = self.visible.len(),
            top_padding = self.top_padding,
            bottom_padding = self.bottom_padding,
            "visible rows updated"
        );
        true
    }

    /// Walks the expanded children of `parent` with bounds relative to the
    /// top of its first child. Returns the height of all of them.
    fn add_visible_nodes(&mut self, parent: NodeId, top_bound: f64, bottom_bound: f64) -> f64 {
        if !self.grid.tree()[parent].is_expanded() {
            return 0.0;
        }
        let count = self.grid.children(parent).len();

        let mut top_padding = 0.0;
        let mut i = 0;
        while i < count {
            let child = self.grid.children(parent)[i];
            if !self.grid.is_filtered_out(child) {
                let new_top = top_padding + self.grid.tree().height(child);
                if new_top > top_bound {
                    break;
                }
                top_padding = new_top;
            }
            i += 1;
        }

        let mut position = top_padding;
        while i < count && position < bottom_bound {
            let child = self.grid.children(parent)[i];
            i += 1;
            if self.grid.is_filtered_out(child) {
                continue;
            }
            let node = &mut self.grid.tree_mut()[child];
            node.attached = true;
            position += node.self_height;
            self.visible.push(child);
            position += self.add_visible_nodes(child, top_bound - position, bottom_bound - position);
        }

        let mut bottom_padding = 0.0;
        for &child in &self.grid.children(parent)[i..] {
            if !self.grid.is_filtered_out(child) {
                bottom_padding += self.grid.tree().height(child);
            }
        }

        self.top_padding += top_padding;
        self.bottom_padding += bottom_padding;
        position + bottom_padding
    }

    /// Height of every unfiltered top-level row and its expanded subtree.
    fn content_height(&self) -> f64 {
        self.grid
            .top_level_nodes()
            .iter()
            .filter(|&&id| !self.grid.is_filtered_out(id))
            .map(|&id| self.grid.tree().height(id))
            .sum()
    }

    // ── Grid operations that change what is on screen ────────

    pub fn sort(&mut self, force: bool) -> SortOutcome {
        let outcome = self.grid.sort(force);
        if outcome.complete {
            self.update_visible_nodes(true);
        }
        outcome
    }

    pub fn sorting_changed(
        &mut self,
        column: &str,
        ascending: bool,
        comparator: ComparatorConfig,
    ) -> Option<SortOutcome> {
        let outcome = self.grid.sorting_changed(column, ascending, comparator)?;
        if outcome.complete {
            self.update_visible_nodes(true);
        }
        Some(outcome)
    }

    pub fn finish_remote_sort(&mut self, id: NodeId) -> bool {
        let complete = self.grid.finish_remote_sort(id);
        if complete {
            self.update_visible_nodes(true);
        }
        complete
    }

    pub fn recursive_sorting_enter(&mut self) {
        self.grid.recursive_sorting_enter();
    }

    pub fn recursive_sorting_leave(&mut self) -> bool {
        let complete = self.grid.recursive_sorting_leave();
        if complete {
            self.update_visible_nodes(true);
        }
        complete
    }

    pub fn populate(&mut self, id: NodeId, rows: impl IntoIterator<Item = T>) -> bool {
        let populated = self.grid.populate(id, rows);
        if populated {
            self.update_visible_nodes(true);
        }
        populated
    }

    pub fn expand(&mut self, id: NodeId) -> Expansion {
        let expansion = self.grid.expand(id);
        self.update_visible_nodes(true);
        expansion
    }

    pub fn collapse(&mut self, id: NodeId) {
        self.grid.collapse(id);
        self.update_visible_nodes(true);
    }

    pub fn set_name_filter(&mut self, filter: &str) {
        self.grid.set_name_filter(filter);
        self.update_visible_nodes(true);
    }

    /// Drops every top-level row and everything beneath them.
    pub fn remove_top_level_nodes(&mut self) {
        let root = self.grid.root();
        self.grid.remove_children(root);
        self.update_visible_nodes(true);
    }

    // ── Reveal ───────────────────────────────────────────────

    /// Scrolls so the last node of `path` (top-level first) is on screen.
    /// Collapsed ancestors on the path are expanded without re-sorting.
    /// Returns `None` for an empty path or a removed node.
    pub fn reveal_tree_node(&mut self, path: &[NodeId]) -> Option<Reveal> {
        let (&target, ancestors) = path.split_last()?;
        if path.iter().any(|&id| !self.grid.tree().contains(id)) {
            return None;
        }
        for &ancestor in ancestors {
            self.grid.tree_mut().set_expanded(ancestor, true);
        }
        self.update_visible_nodes(true);

        let offset = self.calculate_offset(path);
        let scroll_bottom = self.scroll_top + self.client_height;
        if offset >= self.scroll_top && offset < scroll_bottom {
            return Some(Reveal::Visible(target));
        }

        self.set_scroll_top((offset - self.config.reveal_scroll_gap).max(0.0));
        let (resolve, revealed) = oneshot::channel();
        if let Some((previous, resolve_previous)) = self.pending_reveal.replace((target, resolve)) {
            warn!(?previous, "reveal superseded before the grid scrolled");
            let _ = resolve_previous.send(previous);
        }
        Some(Reveal::Pending(revealed))
    }

    /// Distance from the top of the content to the top of the last node of
    /// `path`, counting only expanded and unfiltered rows.
    pub fn calculate_offset(&self, path: &[NodeId]) -> f64 {
        let Some(&target) = path.last() else {
            return 0.0;
        };
        let tree = self.grid.tree();
        let mut parent = self.grid.root();
        let mut height = 0.0;
        for &node in path {
            for &child in tree.children(parent) {
                if child == node {
                    height += tree[node].self_height;
                    break;
                }
                if !self.grid.is_filtered_out(child) {
                    height += tree.height(child);
                }
            }
            parent = node;
        }
        height - tree[target].self_height
    }

    /// Whether the whole row of an attached node lies inside the viewport.
    pub fn is_scrolled_into_view(&self, id: NodeId) -> bool {
        let Some(node) = self.grid.tree().get(id) else {
            return false;
        };
        if !node.is_attached() {
            return false;
        }
        let top = self.calculate_offset(&self.grid.tree().path_to(id));
        let bottom = top + node.self_height;
        top >= self.scroll_top && bottom <= self.scroll_top + self.client_height
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapsight_types::{SortField, SortKey};

    struct Row {
        index: u64,
        name: String,
        expandable: bool,
    }

    impl Row {
        fn new(index: u64) -> Self {
            Self {
                index,
                name: format!("row{index}"),
                expandable: true,
            }
        }
    }

    impl GridRow for Row {
        fn sort_key(&self, field: SortField) -> SortKey<'_> {
            match field {
                SortField::Name => self.name.as_str().into(),
                _ => self.index.into(),
            }
        }

        fn has_children(&self) -> bool {
            self.expandable
        }

        fn filter_name(&self) -> Option<&str> {
            Some(&self.name)
        }
    }

    const CLIENT_HEIGHT: f64 = 400.0;

    fn flat_grid(rows: u64) -> (ViewportDataGrid<Row>, Vec<NodeId>) {
        let mut grid = ViewportDataGrid::new(Row::new(u64::MAX), ViewportConfig::default());
        let root = grid.grid().root();
        let ids = grid.grid_mut().append_children(root, (0..rows).map(Row::new));
        grid.on_resize(CLIENT_HEIGHT);
        grid.update_visible_nodes(true);
        (grid, ids)
    }

    fn max_attached(config: &ViewportConfig) -> usize {
        ((CLIENT_HEIGHT + 2.0 * config.hysteresis + 2.0 * config.guard_zone) / config.row_height)
            as usize
            + 2
    }

    fn assert_covers_viewport(grid: &ViewportDataGrid<Row>) {
        let (top_padding, _) = grid.padding();
        let attached = grid.visible_rows().len() as f64 * grid.config().row_height;
        assert!(top_padding <= grid.scroll_top());
        assert!(top_padding + attached >= grid.scroll_top() + CLIENT_HEIGHT);
    }

    #[test]
    fn scrolling_a_thousand_rows_keeps_the_window_small() {
        let (mut grid, ids) = flat_grid(1000);
        let bound = max_attached(grid.config());
        assert_eq!(grid.scroll_height(), 20_000.0);

        let mut top = 0.0;
        while top <= grid.scroll_height() - CLIENT_HEIGHT {
            grid.scroll_to(top);
            assert!(
                grid.visible_rows().len() <= bound,
                "{} rows attached at scroll top {top}",
                grid.visible_rows().len()
            );
            assert_covers_viewport(&grid);
            let (top_padding, bottom_padding) = grid.padding();
            let attached = grid.visible_rows().len() as f64 * grid.config().row_height;
            assert_eq!(top_padding + attached + bottom_padding, grid.scroll_height());
            top += 50.0;
        }

        let last = ids[999];
        assert!(grid.grid().tree()[last].is_attached());
        assert_eq!(grid.visible_rows().last(), Some(&last));
    }

    #[test]
    fn small_scrolls_inside_the_margin_do_nothing() {
        let (mut grid, _) = flat_grid(1000);
        grid.scroll_to(5000.0);
        let before = grid.visible_rows().to_vec();
        grid.set_scroll_top(5050.0);
        assert!(!grid.update_visible_nodes(false));
        assert_eq!(grid.visible_rows(), before);
    }

    #[test]
    fn expanded_children_follow_their_parent() {
        let (mut grid, ids) = flat_grid(10);
        let parent = ids[2];
        assert!(grid.grid_mut().populate(parent, (100..103).map(Row::new)));
        let expansion = grid.expand(parent);
        assert!(!expansion.needs_population);

        let names: Vec<_> = grid
            .visible_rows()
            .iter()
            .filter_map(|&id| grid.grid().data(id).map(|row| row.index))
            .collect();
        assert_eq!(names, [0, 1, 2, 100, 101, 102, 3, 4, 5, 6, 7, 8, 9]);
        assert_eq!(grid.scroll_height(), 13.0 * 20.0);

        grid.collapse(parent);
        assert_eq!(grid.visible_rows().len(), 10);
        assert_eq!(grid.scroll_height(), 200.0);
    }

    #[test]
    fn unpopulated_rows_ask_for_children() {
        let (mut grid, ids) = flat_grid(3);
        let expansion = grid.expand(ids[0]);
        assert!(expansion.needs_population);
    }

    #[test]
    fn filtered_rows_take_no_space() {
        let (mut grid, ids) = flat_grid(30);
        grid.grid_mut().select(Some(ids[5]));
        grid.set_name_filter("ROW1");
        let shown: Vec<_> = grid
            .visible_rows()
            .iter()
            .filter_map(|&id| grid.grid().data(id).map(|row| row.index))
            .collect();
        assert_eq!(shown, [1, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19]);
        assert_eq!(grid.scroll_height(), 11.0 * 20.0);
        assert_eq!(grid.grid().selected(), None);
    }

    #[test]
    fn selection_survives_leaving_the_window() {
        let (mut grid, ids) = flat_grid(1000);
        grid.grid_mut().select(Some(ids[3]));
        grid.scroll_to(15_000.0);
        assert!(!grid.grid().tree()[ids[3]].is_attached());
        assert_eq!(grid.grid().selected(), Some(ids[3]));
    }

    #[test]
    fn large_tree_attaches_a_bounded_window() {
        let (mut grid, ids) = flat_grid(200_000);
        let bound = max_attached(grid.config());
        let middle = ids[100_000];
        grid.grid_mut().populate(middle, (0..5_000).map(Row::new));
        grid.expand(middle);
        assert_eq!(grid.scroll_height(), 205_000.0 * 20.0);

        for top in [0.0, 1_999_990.0, 2_000_000.0, 2_050_000.0, 4_099_600.0] {
            grid.scroll_to(top);
            assert!(grid.visible_rows().len() <= bound);
            assert_covers_viewport(&grid);
        }
    }

    #[test]
    #[ignore = "allocates ten million rows"]
    fn ten_million_rows() {
        let (mut grid, _) = flat_grid(10_000_000);
        let bound = max_attached(grid.config());
        for top in [0.0, 100_000_000.0, 199_999_600.0] {
            grid.scroll_to(top);
            assert!(grid.visible_rows().len() <= bound);
        }
    }

    #[test]
    fn offsets_count_expanded_siblings() {
        let (mut grid, ids) = flat_grid(5);
        grid.grid_mut().populate(ids[1], (10..14).map(Row::new));
        grid.expand(ids[1]);
        let grandchild = grid.grid().children(ids[1])[2];
        assert_eq!(grid.calculate_offset(&[ids[1], grandchild]), 4.0 * 20.0);
        assert_eq!(grid.calculate_offset(&[ids[3]]), 7.0 * 20.0);
        assert_eq!(grid.calculate_offset(&[]), 0.0);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reveal_resolves_after_the_scroll() {
        let (mut grid, ids) = flat_grid(1000);
        let Some(Reveal::Visible(node)) = grid.reveal_tree_node(&[ids[3]]) else {
            panic!("row 3 is already on screen");
        };
        assert_eq!(node, ids[3]);

        let Some(Reveal::Pending(revealed)) = grid.reveal_tree_node(&[ids[500]]) else {
            panic!("row 500 is off screen");
        };
        assert_eq!(grid.scroll_top(), 500.0 * 20.0 - 40.0);
        grid.on_scroll();
        assert_eq!(revealed.await.ok(), Some(ids[500]));
        assert!(grid.is_scrolled_into_view(ids[500]));
        assert!(!grid.is_scrolled_into_view(ids[0]));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn reveal_without_scroll_resolves_on_animation_frame() {
        let (mut grid, ids) = flat_grid(1000);
        let Some(Reveal::Pending(revealed)) = grid.reveal_tree_node(&[ids[900]]) else {
            panic!("row 900 is off screen");
        };
        grid.on_animation_frame();
        assert_eq!(revealed.await.ok(), Some(ids[900]));
        assert!(grid.reveal_tree_node(&[]).is_none());
    }
}
