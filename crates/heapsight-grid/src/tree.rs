//! Arena of grid nodes.
//!
//! Every node caches the height of its visible subtree (its own row plus,
//! when expanded, the cached heights of its children). Changes propagate up
//! through expanded ancestors only, so asking for a subtree height is O(1)
//! no matter how large the tree grows.

use std::ops::{Index, IndexMut};

/// Stable handle to a node. Handles to removed nodes never alias new ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Where a node's children come from and whether they are there yet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Population {
    Unpopulated,
    Populating,
    Populated,
}

#[derive(Debug)]
pub struct GridNode<T> {
    pub(crate) parent: Option<NodeId>,
    pub(crate) children: Vec<NodeId>,
    pub(crate) expanded: bool,
    pub(crate) attached: bool,
    pub(crate) self_height: f64,
    pub(crate) height: f64,
    pub(crate) population: Population,
    /// Sort epoch the children were last ordered with.
    pub(crate) sorted_epoch: Option<u64>,
    pub data: T,
}

impl<T> GridNode<T> {
    fn new(parent: Option<NodeId>, data: T, self_height: f64) -> Self {
        Self {
            parent,
            children: Vec::new(),
            expanded: false,
            attached: false,
            self_height,
            height: self_height,
            population: Population::Unpopulated,
            sorted_epoch: None,
            data,
        }
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    pub fn is_expanded(&self) -> bool {
        self.expanded
    }

    /// Whether the row is currently materialized by the viewport.
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    pub fn population(&self) -> Population {
        self.population
    }

    pub fn self_height(&self) -> f64 {
        self.self_height
    }
}

struct Slot<T> {
    generation: u32,
    node: Option<GridNode<T>>,
}

pub struct Tree<T> {
    slots: Vec<Slot<T>>,
    free: Vec<u32>,
    root: NodeId,
    len: usize,
}

impl<T> Tree<T> {
    /// Creates a tree whose root is always expanded and has no row of its own.
    pub fn new(root: T) -> Self {
        let mut node = GridNode::new(None, root, 0.0);
        node.expanded = true;
        Self {
            slots: vec![Slot {
                generation: 0,
                node: Some(node),
            }],
            free: Vec::new(),
            root: NodeId {
                index: 0,
                generation: 0,
            },
            len: 1,
        }
    }

    pub fn root(&self) -> NodeId {
        self.root
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, id: NodeId) -> Option<&GridNode<T>> {
        let slot = self.slots.get(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_ref()
    }

    pub fn get_mut(&mut self, id: NodeId) -> Option<&mut GridNode<T>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        slot.node.as_mut()
    }

    pub fn contains(&self, id: NodeId) -> bool {
        self.get(id).is_some()
    }

    pub fn children(&self, id: NodeId) -> &[NodeId] {
        &self[id].children
    }

    /// Height of the node's row plus everything visible beneath it.
    pub fn height(&self, id: NodeId) -> f64 {
        self[id].height
    }

    /// Nodes from the top-level ancestor down to `id`, excluding the root.
    pub fn path_to(&self, id: NodeId) -> Vec<NodeId> {
        let mut path = Vec::new();
        let mut current = Some(id);
        while let Some(node) = current {
            if node == self.root {
                break;
            }
            path.push(node);
            current = self[node].parent;
        }
        path.reverse();
        path
    }

    pub fn push_child(&mut self, parent: NodeId, data: T, self_height: f64) -> NodeId {
        let index = self[parent].children.len();
        self.insert_child(parent, index, data, self_height)
    }

    pub fn insert_child(&mut self, parent: NodeId, index: usize, data: T, self_height: f64) -> NodeId {
        let id = self.allocate(GridNode::new(Some(parent), data, self_height));
        self[parent].children.insert(index, id);
        self.propagate(parent, self_height);
        id
    }

    /// Removes every descendant of `id`, leaving it unpopulated.
    pub fn remove_children(&mut self, id: NodeId) -> Vec<NodeId> {
        let node = &mut self[id];
        let children = std::mem::take(&mut node.children);
        node.population = Population::Unpopulated;
        node.sorted_epoch = None;
        let removed_height = node.height - node.self_height;
        node.height = node.self_height;
        if let Some(parent) = node.parent {
            self.propagate(parent, -removed_height);
        }

        let mut removed = Vec::new();
        let mut stack = children;
        while let Some(child) = stack.pop() {
            if let Some(node) = self.release(child) {
                stack.extend(node.children);
                removed.push(child);
            }
        }
        removed
    }

    pub fn set_expanded(&mut self, id: NodeId, expanded: bool) {
        if id == self.root || self.get(id).is_none_or(|node| node.expanded == expanded) {
            return;
        }
        let children_height: f64 = self[id].children.iter().map(|&c| self[c].height).sum();
        let delta = if expanded { children_height } else { -children_height };
        let node = &mut self[id];
        node.expanded = expanded;
        node.height += delta;
        if let Some(parent) = node.parent {
            self.propagate(parent, delta);
        }
    }

    pub(crate) fn take_children(&mut self, id: NodeId) -> Vec<NodeId> {
        std::mem::take(&mut self[id].children)
    }

    /// Puts back a reordering of the list [`take_children`](Self::take_children) returned.
    pub(crate) fn put_children(&mut self, id: NodeId, children: Vec<NodeId>) {
        self[id].children = children;
    }

    /// Adds `delta` to `id` and its ancestors, stopping below a collapsed one.
    fn propagate(&mut self, id: NodeId, delta: f64) {
        if delta == 0.0 {
            return;
        }
        let mut current = id;
        loop {
            let node = &mut self[current];
            if !node.expanded {
                return;
            }
            node.height += delta;
            match node.parent {
                Some(parent) => current = parent,
                None => return,
            }
        }
    }

    fn allocate(&mut self, node: GridNode<T>) -> NodeId {
        self.len += 1;
        match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.node = Some(node);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: Some(node),
                });
                NodeId {
                    index,
                    generation: 0,
                }
            }
        }
    }

    fn release(&mut self, id: NodeId) -> Option<GridNode<T>> {
        let slot = self.slots.get_mut(id.index as usize)?;
        if slot.generation != id.generation {
            return None;
        }
        let node = slot.node.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(node)
    }
}

impl<T> Index<NodeId> for Tree<T> {
    type Output = GridNode<T>;

    /// Panics if `id` was removed.
    fn index(&self, id: NodeId) -> &GridNode<T> {
        match self.get(id) {
            Some(node) => node,
            None => panic!("stale grid node handle {id:?}"),
        }
    }
}

impl<T> IndexMut<NodeId> for Tree<T> {
    fn index_mut(&mut self, id: NodeId) -> &mut GridNode<T> {
        match self.get_mut(id) {
            Some(node) => node,
            None => panic!("stale grid node handle {id:?}"),
        }
    }
}
