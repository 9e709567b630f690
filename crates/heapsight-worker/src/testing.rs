//! Builds small heap snapshots in the JSON layout the worker reads.

use std::collections::HashMap;

use serde_json::{Value, json};

const NODE_TYPES: [&str; 14] = [
    "hidden",
    "array",
    "string",
    "object",
    "code",
    "closure",
    "regexp",
    "number",
    "native",
    "synthetic",
    "concatenated string",
    "sliced string",
    "symbol",
    "bigint",
];

const EDGE_TYPES: [&str; 7] = [
    "context", "element", "property", "internal", "hidden", "shortcut", "weak",
];

struct Node {
    node_type: usize,
    name: usize,
    id: u64,
    self_size: u64,
    trace_node_id: u64,
    edges: Vec<(usize, u64, u32)>,
}

struct Trace {
    id: u64,
    parent: Option<u64>,
    function: usize,
    count: u64,
    size: u64,
}

pub struct SnapshotBuilder {
    strings: Vec<String>,
    string_index: HashMap<String, usize>,
    nodes: Vec<Node>,
    next_id: u64,
    functions: Vec<[u64; 6]>,
    traces: Vec<Trace>,
    samples: Vec<(u64, u64)>,
    locations: Vec<[u64; 4]>,
}

impl Default for SnapshotBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotBuilder {
    pub const ROOT: u32 = 0;
    const NODE_FIELDS: u64 = 7;

    /// Starts with a synthetic root node with id 1.
    pub fn new() -> Self {
        let mut builder = Self {
            strings: Vec::new(),
            string_index: HashMap::new(),
            nodes: Vec::new(),
            next_id: 1,
            functions: Vec::new(),
            traces: Vec::new(),
            samples: Vec::new(),
            locations: Vec::new(),
        };
        builder.intern("");
        builder.node("synthetic", "", 0);
        builder
    }

    fn intern(&mut self, value: &str) -> usize {
        if let Some(&index) = self.string_index.get(value) {
            return index;
        }
        self.strings.push(value.to_string());
        self.string_index
            .insert(value.to_string(), self.strings.len() - 1);
        self.strings.len() - 1
    }

    /// Adds a node with the next odd id and returns its ordinal.
    pub fn node(&mut self, node_type: &str, name: &str, self_size: u64) -> u32 {
        let id = self.next_id;
        self.node_with_id(node_type, name, self_size, id)
    }

    pub fn object(&mut self, name: &str, self_size: u64) -> u32 {
        self.node("object", name, self_size)
    }

    pub fn object_with_id(&mut self, name: &str, self_size: u64, id: u64) -> u32 {
        self.node_with_id("object", name, self_size, id)
    }

    pub fn node_with_id(&mut self, node_type: &str, name: &str, self_size: u64, id: u64) -> u32 {
        let node_type = NODE_TYPES
            .iter()
            .position(|candidate| *candidate == node_type)
            .unwrap_or_else(|| panic!("unknown node type {node_type}"));
        let name = self.intern(name);
        self.next_id = self.next_id.max(id + 2);
        self.nodes.push(Node {
            node_type,
            name,
            id,
            self_size,
            trace_node_id: 0,
            edges: Vec::new(),
        });
        (self.nodes.len() - 1) as u32
    }

    fn edge(&mut self, edge_type: &str, from: u32, to: u32, name_or_index: u64) {
        let edge_type = EDGE_TYPES
            .iter()
            .position(|candidate| *candidate == edge_type)
            .unwrap_or_else(|| panic!("unknown edge type {edge_type}"));
        self.nodes[from as usize]
            .edges
            .push((edge_type, name_or_index, to));
    }

    pub fn property(&mut self, from: u32, to: u32, name: &str) {
        let name = self.intern(name) as u64;
        self.edge("property", from, to, name);
    }

    pub fn internal(&mut self, from: u32, to: u32, name: &str) {
        let name = self.intern(name) as u64;
        self.edge("internal", from, to, name);
    }

    pub fn element(&mut self, from: u32, to: u32, index: u64) {
        self.edge("element", from, to, index);
    }

    pub fn weak(&mut self, from: u32, to: u32) {
        let name = self.intern("weak") as u64;
        self.edge("weak", from, to, name);
    }

    pub fn function(&mut self, name: &str, script_name: &str, script_id: u64, line: u64) -> usize {
        let function_id = self.functions.len() as u64 + 1;
        let name = self.intern(name) as u64;
        let script_name = self.intern(script_name) as u64;
        self.functions
            .push([function_id, name, script_name, script_id, line, 1]);
        self.functions.len() - 1
    }

    pub fn trace_node(&mut self, id: u64, parent: Option<u64>, function: usize, count: u64, size: u64) {
        self.traces.push(Trace {
            id,
            parent,
            function,
            count,
            size,
        });
    }

    pub fn allocated_at(&mut self, node: u32, trace_node_id: u64) {
        self.nodes[node as usize].trace_node_id = trace_node_id;
    }

    pub fn sample(&mut self, timestamp_us: u64, last_assigned_id: u64) {
        self.samples.push((timestamp_us, last_assigned_id));
    }

    pub fn location(&mut self, node: u32, script_id: u64, line: u64, column: u64) {
        self.locations
            .push([u64::from(node) * Self::NODE_FIELDS, script_id, line, column]);
    }

    fn trace_level(&self, parent: Option<u64>) -> Vec<Value> {
        let mut level = Vec::new();
        for trace in self.traces.iter().filter(|trace| trace.parent == parent) {
            level.push(json!(trace.id));
            level.push(json!(trace.function));
            level.push(json!(trace.count));
            level.push(json!(trace.size));
            level.push(Value::Array(self.trace_level(Some(trace.id))));
        }
        level
    }

    pub fn to_json(&self) -> String {
        let mut nodes = Vec::new();
        let mut edges = Vec::new();
        for node in &self.nodes {
            nodes.extend([
                node.node_type as u64,
                node.name as u64,
                node.id,
                node.self_size,
                node.edges.len() as u64,
                node.trace_node_id,
                0,
            ]);
            for &(edge_type, name_or_index, to) in &node.edges {
                edges.extend([
                    edge_type as u64,
                    name_or_index,
                    u64::from(to) * Self::NODE_FIELDS,
                ]);
            }
        }
        let document = json!({
            "snapshot": {
                "meta": {
                    "node_fields": ["type", "name", "id", "self_size", "edge_count", "trace_node_id", "detachedness"],
                    "node_types": [NODE_TYPES, "string", "number", "number", "number", "number", "number"],
                    "edge_fields": ["type", "name_or_index", "to_node"],
                    "edge_types": [EDGE_TYPES, "string_or_number", "node"],
                    "trace_function_info_fields": ["function_id", "name", "script_name", "script_id", "line", "column"],
                    "trace_node_fields": ["id", "function_info_index", "count", "size", "children"],
                    "sample_fields": ["timestamp_us", "last_assigned_id"],
                    "location_fields": ["object_index", "script_id", "line", "column"]
                },
                "node_count": self.nodes.len(),
                "edge_count": edges.len() / 3,
                "trace_function_count": self.functions.len()
            },
            "nodes": nodes,
            "edges": edges,
            "trace_function_infos": self.functions.concat(),
            "trace_tree": self.trace_level(None),
            "samples": self.samples.iter().flat_map(|&(t, id)| [t, id]).collect::<Vec<_>>(),
            "locations": self.locations.concat(),
            "strings": self.strings,
        });
        document.to_string()
    }
}
