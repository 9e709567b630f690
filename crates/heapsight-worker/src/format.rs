//! Reader for the JSON heap snapshot layout: a `snapshot.meta` header that
//! names the fields of the flat `nodes`/`edges` arrays, a shared `strings`
//! table, and optional allocation-tracking sections.

use serde::Deserialize;
use serde_json::Value;

use crate::WorkerError;

#[derive(Deserialize)]
struct RawSnapshot {
    snapshot: RawHeader,
    nodes: Vec<u64>,
    edges: Vec<u64>,
    strings: Vec<String>,
    #[serde(default)]
    trace_function_infos: Vec<u64>,
    #[serde(default)]
    trace_tree: Vec<Value>,
    #[serde(default)]
    samples: Vec<u64>,
    #[serde(default)]
    locations: Vec<u64>,
}

#[derive(Deserialize)]
struct RawHeader {
    meta: RawMeta,
    node_count: usize,
    edge_count: usize,
}

#[derive(Deserialize)]
struct RawMeta {
    node_fields: Vec<String>,
    node_types: Vec<Value>,
    edge_fields: Vec<String>,
    edge_types: Vec<Value>,
    #[serde(default)]
    trace_function_info_fields: Vec<String>,
    #[serde(default)]
    trace_node_fields: Vec<String>,
    #[serde(default)]
    sample_fields: Vec<String>,
    #[serde(default)]
    location_fields: Vec<String>,
}

/// Column-oriented copy of the flat node and edge arrays.
pub(crate) struct ParsedSnapshot {
    pub node_type_names: Vec<String>,
    pub edge_type_names: Vec<String>,
    pub strings: Vec<String>,

    pub node_types: Vec<u8>,
    pub node_names: Vec<u32>,
    pub node_ids: Vec<u64>,
    pub node_self_sizes: Vec<u64>,
    pub node_edge_counts: Vec<u32>,
    pub node_trace_ids: Vec<u64>,

    pub edge_types: Vec<u8>,
    /// String index for named edges, element index otherwise.
    pub edge_names: Vec<u32>,
    /// Target node ordinal.
    pub edge_targets: Vec<u32>,

    pub functions: Vec<FunctionInfo>,
    pub trace_nodes: Vec<TraceNode>,
    pub samples: Vec<(u64, u64)>,
    pub locations: Vec<RawLocation>,
}

pub(crate) struct FunctionInfo {
    pub name: u32,
    pub script_name: u32,
    pub script_id: u32,
    pub line: u32,
    pub column: u32,
}

pub(crate) struct TraceNode {
    pub id: u64,
    pub function_info_index: usize,
    pub count: u64,
    pub size: u64,
    pub parent: Option<usize>,
}

pub(crate) struct RawLocation {
    pub node_ordinal: u32,
    pub script_id: u32,
    pub line: u32,
    pub column: u32,
}

fn field_index(fields: &[String], name: &str, table: &str) -> Result<usize, WorkerError> {
    fields
        .iter()
        .position(|field| field == name)
        .ok_or_else(|| WorkerError::Parse(format!("{table} has no '{name}' field")))
}

fn optional_field_index(fields: &[String], name: &str) -> Option<usize> {
    fields.iter().position(|field| field == name)
}

/// The first entry of a `*_types` meta list is the enum of type names.
fn type_names(types: &[Value], table: &str) -> Result<Vec<String>, WorkerError> {
    let Some(Value::Array(names)) = types.first() else {
        return Err(WorkerError::Parse(format!("{table} lacks a type name list")));
    };
    names
        .iter()
        .map(|name| {
            name.as_str()
                .map(str::to_owned)
                .ok_or_else(|| WorkerError::Parse(format!("{table} has a non-string type name")))
        })
        .collect()
}

fn narrow(value: u64, what: &str) -> Result<u32, WorkerError> {
    u32::try_from(value).map_err(|_| WorkerError::Parse(format!("{what} {value} does not fit u32")))
}

pub(crate) fn parse_snapshot(text: &str) -> Result<ParsedSnapshot, WorkerError> {
    let raw: RawSnapshot =
        serde_json::from_str(text).map_err(|e| WorkerError::Parse(format!("snapshot json: {e}")))?;
    let meta = &raw.snapshot.meta;

    let node_field_count = meta.node_fields.len();
    let edge_field_count = meta.edge_fields.len();
    if node_field_count == 0 || edge_field_count == 0 {
        return Err(WorkerError::Parse("empty node or edge field list".to_string()));
    }
    let node_count = raw.snapshot.node_count;
    let edge_count = raw.snapshot.edge_count;
    if node_count.checked_mul(node_field_count) != Some(raw.nodes.len()) {
        return Err(WorkerError::Parse(format!(
            "nodes array has {} values, expected {node_count} x {node_field_count}",
            raw.nodes.len()
        )));
    }
    if edge_count.checked_mul(edge_field_count) != Some(raw.edges.len()) {
        return Err(WorkerError::Parse(format!(
            "edges array has {} values, expected {edge_count} x {edge_field_count}",
            raw.edges.len()
        )));
    }
    if node_count == 0 {
        return Err(WorkerError::Parse("snapshot has no root node".to_string()));
    }

    let type_offset = field_index(&meta.node_fields, "type", "node_fields")?;
    let name_offset = field_index(&meta.node_fields, "name", "node_fields")?;
    let id_offset = field_index(&meta.node_fields, "id", "node_fields")?;
    let size_offset = field_index(&meta.node_fields, "self_size", "node_fields")?;
    let edge_count_offset = field_index(&meta.node_fields, "edge_count", "node_fields")?;
    let trace_offset = optional_field_index(&meta.node_fields, "trace_node_id");

    let node_type_names = type_names(&meta.node_types, "node_types")?;
    let edge_type_names = type_names(&meta.edge_types, "edge_types")?;

    let mut parsed = ParsedSnapshot {
        node_type_names,
        edge_type_names,
        strings: raw.strings,
        node_types: Vec::with_capacity(node_count),
        node_names: Vec::with_capacity(node_count),
        node_ids: Vec::with_capacity(node_count),
        node_self_sizes: Vec::with_capacity(node_count),
        node_edge_counts: Vec::with_capacity(node_count),
        node_trace_ids: Vec::with_capacity(node_count),
        edge_types: Vec::with_capacity(edge_count),
        edge_names: Vec::with_capacity(edge_count),
        edge_targets: Vec::with_capacity(edge_count),
        functions: Vec::new(),
        trace_nodes: Vec::new(),
        samples: Vec::new(),
        locations: Vec::new(),
    };

    let mut declared_edges = 0usize;
    for node in raw.nodes.chunks_exact(node_field_count) {
        let node_type = node[type_offset];
        if node_type as usize >= parsed.node_type_names.len() {
            return Err(WorkerError::Parse(format!("unknown node type {node_type}")));
        }
        parsed.node_types.push(node_type as u8);
        parsed.node_names.push(narrow(node[name_offset], "node name")?);
        parsed.node_ids.push(node[id_offset]);
        parsed.node_self_sizes.push(node[size_offset]);
        let edges = narrow(node[edge_count_offset], "edge count")?;
        declared_edges += edges as usize;
        parsed.node_edge_counts.push(edges);
        parsed
            .node_trace_ids
            .push(trace_offset.map_or(0, |offset| node[offset]));
    }
    if declared_edges != edge_count {
        return Err(WorkerError::Parse(format!(
            "nodes declare {declared_edges} edges but the snapshot has {edge_count}"
        )));
    }

    let edge_type_offset = field_index(&meta.edge_fields, "type", "edge_fields")?;
    let edge_name_offset = field_index(&meta.edge_fields, "name_or_index", "edge_fields")?;
    let edge_to_offset = field_index(&meta.edge_fields, "to_node", "edge_fields")?;
    for edge in raw.edges.chunks_exact(edge_field_count) {
        let edge_type = edge[edge_type_offset];
        if edge_type as usize >= parsed.edge_type_names.len() {
            return Err(WorkerError::Parse(format!("unknown edge type {edge_type}")));
        }
        let to_node = edge[edge_to_offset] as usize;
        if to_node % node_field_count != 0 || to_node / node_field_count >= node_count {
            return Err(WorkerError::Parse(format!("edge points at bad node offset {to_node}")));
        }
        parsed.edge_types.push(edge_type as u8);
        parsed.edge_names.push(narrow(edge[edge_name_offset], "edge name")?);
        parsed.edge_targets.push((to_node / node_field_count) as u32);
    }

    for &name in &parsed.node_names {
        if name as usize >= parsed.strings.len() {
            return Err(WorkerError::Parse(format!("node name {name} is not a string index")));
        }
    }

    parse_functions(meta, &raw.trace_function_infos, &mut parsed)?;
    parse_trace_tree(meta, &raw.trace_tree, &mut parsed)?;
    parse_samples(meta, &raw.samples, &mut parsed);
    parse_locations(meta, &raw.locations, node_field_count, &mut parsed)?;
    Ok(parsed)
}

fn parse_functions(
    meta: &RawMeta,
    values: &[u64],
    parsed: &mut ParsedSnapshot,
) -> Result<(), WorkerError> {
    let fields = &meta.trace_function_info_fields;
    if values.is_empty() || fields.is_empty() {
        return Ok(());
    }
    let name = field_index(fields, "name", "trace_function_info_fields")?;
    let script_name = field_index(fields, "script_name", "trace_function_info_fields")?;
    let script_id = field_index(fields, "script_id", "trace_function_info_fields")?;
    let line = field_index(fields, "line", "trace_function_info_fields")?;
    let column = field_index(fields, "column", "trace_function_info_fields")?;
    for info in values.chunks_exact(fields.len()) {
        parsed.functions.push(FunctionInfo {
            name: narrow(info[name], "function name")?,
            script_name: narrow(info[script_name], "script name")?,
            script_id: narrow(info[script_id], "script id")?,
            line: narrow(info[line], "line")?,
            column: narrow(info[column], "column")?,
        });
    }
    Ok(())
}

/// The trace tree is nested: each node is a run of scalar fields followed by
/// an array holding its children in the same shape.
fn parse_trace_tree(
    meta: &RawMeta,
    tree: &[Value],
    parsed: &mut ParsedSnapshot,
) -> Result<(), WorkerError> {
    let fields = &meta.trace_node_fields;
    if tree.is_empty() || fields.is_empty() {
        return Ok(());
    }
    let id = field_index(fields, "id", "trace_node_fields")?;
    let function = field_index(fields, "function_info_index", "trace_node_fields")?;
    let count = field_index(fields, "count", "trace_node_fields")?;
    let size = field_index(fields, "size", "trace_node_fields")?;
    let children = field_index(fields, "children", "trace_node_fields")?;
    let number = |value: &Value| {
        value
            .as_u64()
            .ok_or_else(|| WorkerError::Parse("trace node field is not a number".to_string()))
    };

    let mut stack: Vec<(&[Value], Option<usize>)> = vec![(tree, None)];
    while let Some((level, parent)) = stack.pop() {
        for node in level.chunks(fields.len()) {
            if node.len() != fields.len() {
                return Err(WorkerError::Parse("truncated trace tree".to_string()));
            }
            let function_info_index = number(&node[function])? as usize;
            if function_info_index >= parsed.functions.len() {
                return Err(WorkerError::Parse(format!(
                    "trace node refers to missing function {function_info_index}"
                )));
            }
            parsed.trace_nodes.push(TraceNode {
                id: number(&node[id])?,
                function_info_index,
                count: number(&node[count])?,
                size: number(&node[size])?,
                parent,
            });
            let index = parsed.trace_nodes.len() - 1;
            match &node[children] {
                Value::Array(kids) if !kids.is_empty() => stack.push((kids.as_slice(), Some(index))),
                Value::Array(_) => {}
                _ => return Err(WorkerError::Parse("trace node children is not an array".into())),
            }
        }
    }
    Ok(())
}

fn parse_samples(meta: &RawMeta, values: &[u64], parsed: &mut ParsedSnapshot) {
    let fields = &meta.sample_fields;
    let (Some(timestamp), Some(last_id)) = (
        optional_field_index(fields, "timestamp_us"),
        optional_field_index(fields, "last_assigned_id"),
    ) else {
        return;
    };
    parsed.samples = values
        .chunks_exact(fields.len())
        .map(|sample| (sample[timestamp], sample[last_id]))
        .collect();
}

fn parse_locations(
    meta: &RawMeta,
    values: &[u64],
    node_field_count: usize,
    parsed: &mut ParsedSnapshot,
) -> Result<(), WorkerError> {
    let fields = &meta.location_fields;
    if values.is_empty() || fields.is_empty() {
        return Ok(());
    }
    let object = field_index(fields, "object_index", "location_fields")?;
    let script = field_index(fields, "script_id", "location_fields")?;
    let line = field_index(fields, "line", "location_fields")?;
    let column = field_index(fields, "column", "location_fields")?;
    for location in values.chunks_exact(fields.len()) {
        parsed.locations.push(RawLocation {
            node_ordinal: narrow(location[object] / node_field_count as u64, "location node")?,
            script_id: narrow(location[script], "script id")?,
            line: narrow(location[line], "line")?,
            column: narrow(location[column], "column")?,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::SnapshotBuilder;

    fn small_snapshot() -> Value {
        let mut builder = SnapshotBuilder::new();
        let a = builder.object("A", 8);
        builder.property(SnapshotBuilder::ROOT, a, "a");
        serde_json::from_str(&builder.to_json()).expect("builder emits json")
    }

    #[test]
    fn header_counts_must_match_the_arrays() {
        let mut document = small_snapshot();
        document["snapshot"]["edge_count"] = Value::from(5);
        let Err(WorkerError::Parse(message)) = parse_snapshot(&document.to_string()) else {
            panic!("a short edges array must be rejected");
        };
        assert!(message.starts_with("edges array has 3 values"), "{message}");
    }

    #[test]
    fn overflowing_header_counts_are_parse_errors() {
        let mut document = small_snapshot();
        document["snapshot"]["node_count"] = Value::from(u64::MAX / 2);
        let Err(WorkerError::Parse(message)) = parse_snapshot(&document.to_string()) else {
            panic!("an overflowing node count must be rejected");
        };
        assert!(message.starts_with("nodes array has 14 values"), "{message}");

        let mut document = small_snapshot();
        document["snapshot"]["edge_count"] = Value::from(u64::MAX);
        assert!(matches!(
            parse_snapshot(&document.to_string()),
            Err(WorkerError::Parse(_))
        ));
    }
}
