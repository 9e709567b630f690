use std::collections::{HashMap, HashSet};

use heapsight_types::{AllocationStackFrame, Samples, SerializedAllocationNode};

use crate::WorkerError;
use crate::snapshot::HeapSnapshot;

/// Allocation-node ids handed to the UI are `function_info_index + 1`, so 0
/// never names a function.
fn function_of_allocation_node(allocation_node_id: u64) -> Option<usize> {
    allocation_node_id.checked_sub(1).map(|index| index as usize)
}

impl HeapSnapshot {
    /// Trace-node ids whose frame is the function behind `allocation_node_id`.
    pub(crate) fn trace_ids_for_allocation_node(&self, allocation_node_id: u64) -> HashSet<u64> {
        let Some(function) = function_of_allocation_node(allocation_node_id) else {
            return HashSet::new();
        };
        self.trace_nodes()
            .iter()
            .filter(|trace| trace.function_info_index == function)
            .map(|trace| trace.id)
            .collect()
    }

    /// One entry per allocating function, summed over every call path.
    pub fn allocation_traces_tops(&self) -> Vec<SerializedAllocationNode> {
        let trace_nodes = self.trace_nodes();
        let function_by_trace: HashMap<u64, usize> = trace_nodes
            .iter()
            .map(|trace| (trace.id, trace.function_info_index))
            .collect();

        let mut totals: Vec<SerializedAllocationNode> = self
            .functions()
            .iter()
            .enumerate()
            .map(|(index, function)| SerializedAllocationNode {
                id: index as u64 + 1,
                name: self.string(function.name).to_string(),
                script_name: self.string(function.script_name).to_string(),
                script_id: function.script_id,
                line: function.line,
                column: function.column,
                count: 0,
                size: 0,
                live_count: 0,
                live_size: 0,
                has_children: false,
            })
            .collect();

        for trace in trace_nodes {
            let Some(total) = totals.get_mut(trace.function_info_index) else {
                continue;
            };
            total.count += trace.count;
            total.size += trace.size;
            total.has_children |= trace.parent.is_some();
        }
        for (index, &trace_id) in self.raw.node_trace_ids.iter().enumerate() {
            if trace_id == 0 {
                continue;
            }
            if let Some(total) = function_by_trace
                .get(&trace_id)
                .and_then(|&function| totals.get_mut(function))
            {
                total.live_count += 1;
                total.live_size += self.raw.node_self_sizes[index];
            }
        }
        totals.retain(|total| total.count > 0);
        totals
    }

    /// Frames of the allocation site of a node, innermost first. `None` when
    /// allocation tracking was off for it.
    pub fn allocation_stack(
        &self,
        ordinal: u32,
    ) -> Result<Option<Vec<AllocationStackFrame>>, WorkerError> {
        self.check_node(ordinal)?;
        let trace_id = self.raw.node_trace_ids[ordinal as usize];
        if trace_id == 0 {
            return Ok(None);
        }
        let trace_nodes = self.trace_nodes();
        let Some(mut cursor) = trace_nodes.iter().position(|trace| trace.id == trace_id) else {
            return Ok(None);
        };
        let mut frames = Vec::new();
        loop {
            let trace = &trace_nodes[cursor];
            if let Some(function) = self.functions().get(trace.function_info_index) {
                frames.push(AllocationStackFrame {
                    function_name: self.string(function.name).to_string(),
                    script_name: self.string(function.script_name).to_string(),
                    script_id: function.script_id,
                    line: function.line,
                    column: function.column,
                });
            }
            match trace.parent {
                Some(parent) => cursor = parent,
                None => break,
            }
        }
        Ok(Some(frames))
    }

    /// `sizes[i]` sums the live objects whose id falls in sample interval `i`.
    pub fn samples(&self) -> Option<Samples> {
        if self.raw.samples.is_empty() {
            return None;
        }
        let timestamps: Vec<u64> = self.raw.samples.iter().map(|&(t, _)| t).collect();
        let last_assigned_ids: Vec<u64> = self.raw.samples.iter().map(|&(_, id)| id).collect();
        let mut sizes = vec![0u64; last_assigned_ids.len()];
        for (index, &id) in self.raw.node_ids.iter().enumerate() {
            let bucket = last_assigned_ids.partition_point(|&last| last < id);
            if let Some(size) = sizes.get_mut(bucket) {
                *size += self.raw.node_self_sizes[index];
            }
        }
        Some(Samples {
            timestamps,
            last_assigned_ids,
            sizes,
        })
    }

    fn string(&self, index: u32) -> &str {
        self.raw
            .strings
            .get(index as usize)
            .map(String::as_str)
            .unwrap_or_default()
    }
}
