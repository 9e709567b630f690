use facet::Facet;

use crate::InvariantError;

/// One heap object as shown in a grid row.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct NodeItem {
    pub id: u64,
    pub name: String,
    pub node_type: String,
    pub node_index: u32,
    pub distance: u32,
    pub shallow_size: u64,
    pub retained_size: u64,
    pub has_children: bool,
}

/// A reference from (or, for retainer providers, to) a node.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct EdgeItem {
    pub name: String,
    pub edge_type: String,
    pub edge_index: u32,
    pub node: NodeItem,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum ProviderItem {
    Node(NodeItem),
    Edge(EdgeItem),
}

impl ProviderItem {
    pub fn node(&self) -> &NodeItem {
        match self {
            Self::Node(node) => node,
            Self::Edge(edge) => &edge.node,
        }
    }
}

/// A window of a provider's ordered items.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct ItemsRange {
    pub start_position: u32,
    pub end_position: u32,
    pub total_length: u32,
    pub items: Vec<ProviderItem>,
}

impl ItemsRange {
    pub fn new(
        start_position: u32,
        end_position: u32,
        total_length: u32,
        items: Vec<ProviderItem>,
    ) -> Result<Self, InvariantError> {
        if start_position > end_position {
            return Err(InvariantError::InvertedRange {
                start: start_position,
                end: end_position,
            });
        }
        Ok(Self {
            start_position,
            end_position,
            total_length,
            items,
        })
    }

    pub fn is_complete(&self) -> bool {
        self.end_position >= self.total_length
    }
}

#[derive(Facet, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub script_id: u32,
    pub line_number: u32,
    pub column_number: u32,
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct SearchConfig {
    pub query: String,
    pub case_sensitive: bool,
    pub is_regex: bool,
}

impl SearchConfig {
    pub fn substring(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            case_sensitive: false,
            is_regex: false,
        }
    }
}

#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct AllocationStackFrame {
    pub function_name: String,
    pub script_name: String,
    pub script_id: u32,
    pub line: u32,
    pub column: u32,
}

/// A function in the allocation trace tree, with totals over all of its
/// call sites.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct SerializedAllocationNode {
    pub id: u64,
    pub name: String,
    pub script_name: String,
    pub script_id: u32,
    pub line: u32,
    pub column: u32,
    pub count: u64,
    pub size: u64,
    pub live_count: u64,
    pub live_size: u64,
    pub has_children: bool,
}
