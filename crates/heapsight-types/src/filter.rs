use facet::Facet;

/// Selects a subset of a snapshot's nodes.
///
/// Two filters are equal exactly when all three fields are equal. The
/// constructors view relies on that to drop a request that matches the one
/// already in flight.
#[derive(Facet, Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct NodeFilter {
    /// Exclusive lower bound on the snapshot object id.
    pub min_node_id: Option<u64>,
    /// Inclusive upper bound on the snapshot object id.
    pub max_node_id: Option<u64>,
    /// Keep only nodes allocated under this allocation trace node.
    pub allocation_node_id: Option<u64>,
}

impl NodeFilter {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn id_range(min_node_id: u64, max_node_id: u64) -> Self {
        Self {
            min_node_id: Some(min_node_id),
            max_node_id: Some(max_node_id),
            allocation_node_id: None,
        }
    }

    pub fn allocation_node(allocation_node_id: u64) -> Self {
        Self {
            min_node_id: None,
            max_node_id: None,
            allocation_node_id: Some(allocation_node_id),
        }
    }

    pub fn is_unfiltered(&self) -> bool {
        self.min_node_id.is_none() && self.max_node_id.is_none() && self.allocation_node_id.is_none()
    }

    pub fn accepts_id(&self, id: u64) -> bool {
        self.min_node_id.is_none_or(|min| id > min) && self.max_node_id.is_none_or(|max| id <= max)
    }
}
