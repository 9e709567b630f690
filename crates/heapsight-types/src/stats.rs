use facet::Facet;

/// Snapshot-wide values fetched once after loading.
#[derive(Facet, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StaticData {
    pub node_count: u32,
    pub root_node_index: u32,
    pub total_size: u64,
    pub max_js_object_id: u64,
}

/// Size breakdown by category, in bytes.
#[derive(Facet, Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    pub total: u64,
    pub v8_heap: u64,
    pub native: u64,
    pub code: u64,
    pub strings: u64,
    pub js_arrays: u64,
    pub system: u64,
}

/// Allocation samples recorded while the snapshot was being taken.
/// `sizes[i]` is the live size of objects allocated in interval `i`.
#[derive(Facet, Debug, Clone, Default, PartialEq, Eq)]
pub struct Samples {
    pub timestamps: Vec<u64>,
    pub last_assigned_ids: Vec<u64>,
    pub sizes: Vec<u64>,
}
