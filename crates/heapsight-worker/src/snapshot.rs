use std::collections::{HashMap, VecDeque};

use heapsight_types::aggregate::UNREACHABLE_DISTANCE;
use heapsight_types::{Location, NodeItem, ProfileUid, StaticData, Statistics};
use tracing::debug;

use crate::WorkerError;
use crate::format::{FunctionInfo, ParsedSnapshot, RawLocation, TraceNode, parse_snapshot};

const ROOT: u32 = 0;
const NO_DOMINATOR: u32 = u32::MAX;

/// A parsed and fully indexed heap graph. Immutable once built.
pub struct HeapSnapshot {
    pub(crate) profile_uid: ProfileUid,
    pub(crate) raw: ParsedSnapshot,

    /// `first_edge[n]..first_edge[n + 1]` are the outgoing edges of node `n`.
    pub(crate) first_edge: Vec<u32>,
    pub(crate) edge_sources: Vec<u32>,
    /// `first_retainer[n]..first_retainer[n + 1]` index into `retaining_edges`.
    pub(crate) first_retainer: Vec<u32>,
    pub(crate) retaining_edges: Vec<u32>,

    pub(crate) distances: Vec<u32>,
    pub(crate) dominators: Vec<u32>,
    pub(crate) retained_sizes: Vec<u64>,
    /// Children of each node in the dominator tree, laid out like `first_edge`.
    pub(crate) first_dominated: Vec<u32>,
    pub(crate) dominated: Vec<u32>,

    pub(crate) class_names: Vec<String>,
    pub(crate) node_classes: Vec<u32>,
    pub(crate) ordinal_by_id: HashMap<u64, u32>,
    pub(crate) location_by_node: HashMap<u32, Location>,

    weak_edge_type: Option<u8>,
    static_data: StaticData,
}

impl HeapSnapshot {
    /// Parses and indexes `text`, reporting each phase through `progress`.
    pub fn build(
        profile_uid: ProfileUid,
        text: &str,
        progress: &mut dyn FnMut(&str),
    ) -> Result<Self, WorkerError> {
        progress("Parsing strings…");
        let raw = parse_snapshot(text)?;
        let node_count = raw.node_types.len();
        let weak_edge_type = raw
            .edge_type_names
            .iter()
            .position(|name| name == "weak")
            .map(|index| index as u8);

        let mut snapshot = Self {
            profile_uid,
            raw,
            first_edge: Vec::new(),
            edge_sources: Vec::new(),
            first_retainer: Vec::new(),
            retaining_edges: Vec::new(),
            distances: vec![UNREACHABLE_DISTANCE; node_count],
            dominators: vec![NO_DOMINATOR; node_count],
            retained_sizes: Vec::new(),
            first_dominated: Vec::new(),
            dominated: Vec::new(),
            class_names: Vec::new(),
            node_classes: Vec::new(),
            ordinal_by_id: HashMap::with_capacity(node_count),
            location_by_node: HashMap::new(),
            weak_edge_type,
            static_data: StaticData::default(),
        };

        progress("Building edge indexes…");
        snapshot.build_edge_indexes();
        progress("Building retainers…");
        snapshot.build_retainers();
        progress("Calculating node classes…");
        snapshot.build_classes();
        progress("Calculating distances…");
        snapshot.calculate_distances();
        progress("Building dominator tree…");
        let post_order = snapshot.post_order();
        snapshot.build_dominator_tree(&post_order);
        progress("Calculating retained sizes…");
        snapshot.calculate_retained_sizes(&post_order);
        snapshot.build_dominated_nodes();
        snapshot.build_locations();
        snapshot.static_data = StaticData {
            node_count: node_count as u32,
            root_node_index: ROOT,
            total_size: snapshot.retained_sizes[ROOT as usize],
            max_js_object_id: snapshot.max_js_object_id(),
        };
        progress("Finished processing.");
        debug!(
            node_count,
            edge_count = snapshot.raw.edge_targets.len(),
            total_size = snapshot.static_data.total_size,
            "snapshot indexed"
        );
        Ok(snapshot)
    }

    pub fn profile_uid(&self) -> ProfileUid {
        self.profile_uid
    }

    pub fn static_data(&self) -> StaticData {
        self.static_data
    }

    pub fn node_count(&self) -> usize {
        self.raw.node_types.len()
    }

    // ── Indexing ────────────────────────────────────────────────────────────

    fn build_edge_indexes(&mut self) {
        let node_count = self.node_count();
        self.first_edge = Vec::with_capacity(node_count + 1);
        self.edge_sources = Vec::with_capacity(self.raw.edge_targets.len());
        let mut next = 0u32;
        for (node, &count) in self.raw.node_edge_counts.iter().enumerate() {
            self.first_edge.push(next);
            next += count;
            self.edge_sources
                .extend(std::iter::repeat_n(node as u32, count as usize));
        }
        self.first_edge.push(next);
    }

    fn build_retainers(&mut self) {
        let node_count = self.node_count();
        let mut counts = vec![0u32; node_count + 1];
        for &target in &self.raw.edge_targets {
            counts[target as usize] += 1;
        }
        self.first_retainer = Vec::with_capacity(node_count + 1);
        let mut next = 0u32;
        for count in &counts[..node_count] {
            self.first_retainer.push(next);
            next += count;
        }
        self.first_retainer.push(next);

        let mut fill = self.first_retainer.clone();
        self.retaining_edges = vec![0; self.raw.edge_targets.len()];
        for (edge, &target) in self.raw.edge_targets.iter().enumerate() {
            let slot = &mut fill[target as usize];
            self.retaining_edges[*slot as usize] = edge as u32;
            *slot += 1;
        }
    }

    fn build_classes(&mut self) {
        let mut class_by_name: HashMap<String, u32> = HashMap::new();
        self.node_classes = Vec::with_capacity(self.node_count());
        for ordinal in 0..self.node_count() {
            let name = self.class_name_of(ordinal as u32);
            let next = class_by_name.len() as u32;
            let class = *class_by_name.entry(name.clone()).or_insert_with(|| {
                self.class_names.push(name);
                next
            });
            self.node_classes.push(class);
            self.ordinal_by_id
                .insert(self.raw.node_ids[ordinal], ordinal as u32);
        }
    }

    fn class_name_of(&self, ordinal: u32) -> String {
        let node_type = self.node_type_name(ordinal);
        match node_type {
            "object" | "native" => self.node_name(ordinal).to_string(),
            "hidden" => "(system)".to_string(),
            "code" => "(compiled code)".to_string(),
            other => format!("({other})"),
        }
    }

    fn is_weak(&self, edge: u32) -> bool {
        self.weak_edge_type == Some(self.raw.edge_types[edge as usize])
    }

    fn calculate_distances(&mut self) {
        let mut queue = VecDeque::new();
        self.distances[ROOT as usize] = 0;
        queue.push_back(ROOT);
        while let Some(node) = queue.pop_front() {
            let next_distance = self.distances[node as usize] + 1;
            for edge in self.edges_of(node) {
                if self.is_weak(edge) {
                    continue;
                }
                let target = self.raw.edge_targets[edge as usize] as usize;
                if self.distances[target] == UNREACHABLE_DISTANCE {
                    self.distances[target] = next_distance;
                    queue.push_back(target as u32);
                }
            }
        }
    }

    /// Depth-first post-order over strong edges, reachable nodes only.
    fn post_order(&self) -> Vec<u32> {
        let node_count = self.node_count();
        let mut visited = vec![false; node_count];
        let mut order = Vec::with_capacity(node_count);
        let mut stack: Vec<(u32, u32)> = vec![(ROOT, self.first_edge[ROOT as usize])];
        visited[ROOT as usize] = true;
        while let Some(top) = stack.last_mut() {
            let (node, cursor) = *top;
            if cursor == self.first_edge[node as usize + 1] {
                order.push(node);
                stack.pop();
                continue;
            }
            top.1 += 1;
            if self.is_weak(cursor) {
                continue;
            }
            let target = self.raw.edge_targets[cursor as usize];
            if !visited[target as usize] {
                visited[target as usize] = true;
                stack.push((target, self.first_edge[target as usize]));
            }
        }
        order
    }

    /// Iterative dominator computation over post-order indexes.
    fn build_dominator_tree(&mut self, post_order: &[u32]) {
        let node_count = self.node_count();
        let reachable = post_order.len();
        let root_position = reachable - 1;
        let mut position_of = vec![u32::MAX; node_count];
        for (position, &node) in post_order.iter().enumerate() {
            position_of[node as usize] = position as u32;
        }

        let mut doms = vec![NO_DOMINATOR; reachable];
        doms[root_position] = root_position as u32;
        let mut changed = true;
        while changed {
            changed = false;
            for position in (0..root_position).rev() {
                let node = post_order[position];
                let mut new_idom = NO_DOMINATOR;
                for retainer_slot in self.retainers_of(node) {
                    let edge = self.retaining_edges[retainer_slot as usize];
                    if self.is_weak(edge) {
                        continue;
                    }
                    let retainer_position = position_of[self.edge_sources[edge as usize] as usize];
                    if retainer_position == u32::MAX || doms[retainer_position as usize] == NO_DOMINATOR
                    {
                        continue;
                    }
                    new_idom = if new_idom == NO_DOMINATOR {
                        retainer_position
                    } else {
                        intersect(&doms, retainer_position, new_idom)
                    };
                }
                if new_idom != NO_DOMINATOR && doms[position] != new_idom {
                    doms[position] = new_idom;
                    changed = true;
                }
            }
        }

        for (position, &node) in post_order.iter().enumerate() {
            self.dominators[node as usize] = post_order[doms[position] as usize];
        }
        // Unreachable nodes hang off the root.
        for dominator in &mut self.dominators {
            if *dominator == NO_DOMINATOR {
                *dominator = ROOT;
            }
        }
    }

    fn calculate_retained_sizes(&mut self, post_order: &[u32]) {
        self.retained_sizes = self.raw.node_self_sizes.clone();
        let mut reachable = vec![false; self.node_count()];
        for &node in post_order {
            reachable[node as usize] = true;
        }
        for (node, &is_reachable) in reachable.iter().enumerate() {
            if !is_reachable {
                self.retained_sizes[ROOT as usize] += self.retained_sizes[node];
            }
        }
        // Dominators finish after the nodes they dominate.
        for &node in post_order {
            if node == ROOT {
                continue;
            }
            let dominator = self.dominators[node as usize] as usize;
            self.retained_sizes[dominator] += self.retained_sizes[node as usize];
        }
    }

    fn build_dominated_nodes(&mut self) {
        let node_count = self.node_count();
        let mut counts = vec![0u32; node_count];
        for node in 1..node_count {
            counts[self.dominators[node] as usize] += 1;
        }
        self.first_dominated = Vec::with_capacity(node_count + 1);
        let mut next = 0u32;
        for count in &counts {
            self.first_dominated.push(next);
            next += count;
        }
        self.first_dominated.push(next);
        let mut fill = self.first_dominated.clone();
        self.dominated = vec![0; next as usize];
        for node in 1..node_count {
            let slot = &mut fill[self.dominators[node] as usize];
            self.dominated[*slot as usize] = node as u32;
            *slot += 1;
        }
    }

    fn build_locations(&mut self) {
        for &RawLocation {
            node_ordinal,
            script_id,
            line,
            column,
        } in &self.raw.locations
        {
            self.location_by_node.insert(
                node_ordinal,
                Location {
                    script_id,
                    line_number: line,
                    column_number: column,
                },
            );
        }
    }

    fn max_js_object_id(&self) -> u64 {
        // Odd ids belong to JS heap objects; even ids to embedder objects.
        self.raw
            .node_ids
            .iter()
            .copied()
            .filter(|id| id % 2 == 1)
            .max()
            .unwrap_or(0)
    }

    // ── Accessors ───────────────────────────────────────────────────────────

    pub(crate) fn edges_of(&self, node: u32) -> std::ops::Range<u32> {
        self.first_edge[node as usize]..self.first_edge[node as usize + 1]
    }

    pub(crate) fn retainers_of(&self, node: u32) -> std::ops::Range<u32> {
        self.first_retainer[node as usize]..self.first_retainer[node as usize + 1]
    }

    pub(crate) fn dominated_by(&self, node: u32) -> &[u32] {
        let start = self.first_dominated[node as usize] as usize;
        let end = self.first_dominated[node as usize + 1] as usize;
        &self.dominated[start..end]
    }

    pub(crate) fn node_type_name(&self, ordinal: u32) -> &str {
        &self.raw.node_type_names[self.raw.node_types[ordinal as usize] as usize]
    }

    pub(crate) fn node_name(&self, ordinal: u32) -> &str {
        &self.raw.strings[self.raw.node_names[ordinal as usize] as usize]
    }

    pub(crate) fn class_name(&self, ordinal: u32) -> &str {
        &self.class_names[self.node_classes[ordinal as usize] as usize]
    }

    pub(crate) fn edge_type_name(&self, edge: u32) -> &str {
        &self.raw.edge_type_names[self.raw.edge_types[edge as usize] as usize]
    }

    /// Element and hidden edges are indexed; every other type is named.
    pub(crate) fn edge_name(&self, edge: u32) -> String {
        let name_or_index = self.raw.edge_names[edge as usize];
        match self.edge_type_name(edge) {
            "element" | "hidden" => name_or_index.to_string(),
            _ => self
                .raw
                .strings
                .get(name_or_index as usize)
                .cloned()
                .unwrap_or_default(),
        }
    }

    pub(crate) fn check_node(&self, ordinal: u32) -> Result<(), WorkerError> {
        if (ordinal as usize) < self.node_count() {
            Ok(())
        } else {
            Err(WorkerError::NodeIndexOutOfRange(ordinal))
        }
    }

    pub(crate) fn node_item(&self, ordinal: u32) -> NodeItem {
        let index = ordinal as usize;
        NodeItem {
            id: self.raw.node_ids[index],
            name: self.node_name(ordinal).to_string(),
            node_type: self.node_type_name(ordinal).to_string(),
            node_index: ordinal,
            distance: self.distances[index],
            shallow_size: self.raw.node_self_sizes[index],
            retained_size: self.retained_sizes[index],
            has_children: !self.edges_of(ordinal).is_empty(),
        }
    }

    pub(crate) fn functions(&self) -> &[FunctionInfo] {
        &self.raw.functions
    }

    pub(crate) fn trace_nodes(&self) -> &[TraceNode] {
        &self.raw.trace_nodes
    }

    // ── Single-shot queries ─────────────────────────────────────────────────

    pub fn node_class_name(&self, snapshot_object_id: u64) -> Option<String> {
        self.ordinal_by_id
            .get(&snapshot_object_id)
            .map(|&ordinal| self.class_name(ordinal).to_string())
    }

    pub fn location(&self, ordinal: u32) -> Result<Option<Location>, WorkerError> {
        self.check_node(ordinal)?;
        Ok(self.location_by_node.get(&ordinal).copied())
    }

    pub fn statistics(&self) -> Statistics {
        let mut stats = Statistics::default();
        for ordinal in 0..self.node_count() as u32 {
            let size = self.raw.node_self_sizes[ordinal as usize];
            stats.total += size;
            match self.node_type_name(ordinal) {
                "native" => stats.native += size,
                "code" => stats.code += size,
                "string" | "concatenated string" | "sliced string" => stats.strings += size,
                "hidden" | "synthetic" => stats.system += size,
                "object" if self.node_name(ordinal) == "Array" => {
                    stats.js_arrays += size;
                    stats.js_arrays += self.array_backing_size(ordinal);
                }
                _ => {}
            }
        }
        stats.v8_heap = stats.total - stats.native;
        stats
    }

    /// Size of the hidden `elements` store an array owns.
    fn array_backing_size(&self, ordinal: u32) -> u64 {
        self.edges_of(ordinal)
            .filter(|&edge| {
                self.edge_type_name(edge) == "internal" && self.edge_name(edge) == "elements"
            })
            .map(|edge| self.raw.node_self_sizes[self.raw.edge_targets[edge as usize] as usize])
            .sum()
    }
}

fn intersect(doms: &[u32], mut a: u32, mut b: u32) -> u32 {
    while a != b {
        while a < b {
            a = doms[a as usize];
        }
        while b < a {
            b = doms[b as usize];
        }
    }
    a
}
