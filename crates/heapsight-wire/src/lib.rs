//! Wire protocol between UI-side proxies and a snapshot worker.
//!
//! The UI sends [`Request`]s. The worker answers each call with a
//! [`Reply`] carrying the same [`CallId`], and may emit [`WorkerEvent`]s at
//! any time. Every message is one JSON frame.
//!
//! Operations are closed enums ([`Method`], [`FactoryMethod`]), so the
//! worker dispatches with an exhaustive match.

use std::error::Error;
use std::fmt;

use facet::Facet;
use heapsight_types::{
    Aggregate, AggregateForDiff, AllocationStackFrame, CallId, ComparatorConfig, DiffForClass,
    ItemsRange, Location, NodeFilter, ObjectId, ProfileUid, Samples, SearchConfig,
    SerializedAllocationNode, StaticData, Statistics,
};

// ── Requests ────────────────────────────────────────────────────────────────

#[derive(Facet, Debug, Clone, PartialEq)]
pub struct Request {
    pub call_id: CallId,
    pub disposition: Disposition,
}

#[derive(Facet, Debug, Clone, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Disposition {
    /// Instantiate a root object (only loaders are created this way).
    Create {
        object_id: ObjectId,
        profile_uid: ProfileUid,
    },
    /// Release an object. No reply is sent.
    Dispose { object_id: ObjectId },
    Method { object_id: ObjectId, method: Method },
    /// Run `method` on `object_id` and register its product as `new_object_id`.
    Factory {
        object_id: ObjectId,
        new_object_id: ObjectId,
        method: FactoryMethod,
    },
    EvaluateForTest { probe: TestProbe },
}

#[derive(Facet, Debug, Clone, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum Method {
    // loader
    Write {
        chunk: String,
    },
    Close,

    // snapshot
    UpdateStaticData,
    AggregatesWithFilter {
        filter: NodeFilter,
    },
    AggregatesForDiff,
    CalculateSnapshotDiff {
        base_snapshot_id: ProfileUid,
        base_aggregates: Vec<AggregateForDiff>,
    },
    NodeClassName {
        snapshot_object_id: u64,
    },
    Search {
        config: SearchConfig,
        filter: NodeFilter,
    },
    GetLocation {
        node_index: u32,
    },
    AllocationStack {
        node_index: u32,
    },
    AllocationTracesTops,
    GetSamples,
    GetStatistics,

    // provider
    IsEmpty,
    SortAndRewind {
        comparator: ComparatorConfig,
    },
    SerializeItemsRange {
        start: u32,
        end: u32,
    },
    NodePosition {
        snapshot_object_id: u64,
    },
}

impl Method {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Write { .. } => "write",
            Self::Close => "close",
            Self::UpdateStaticData => "updateStaticData",
            Self::AggregatesWithFilter { .. } => "aggregatesWithFilter",
            Self::AggregatesForDiff => "aggregatesForDiff",
            Self::CalculateSnapshotDiff { .. } => "calculateSnapshotDiff",
            Self::NodeClassName { .. } => "nodeClassName",
            Self::Search { .. } => "search",
            Self::GetLocation { .. } => "getLocation",
            Self::AllocationStack { .. } => "allocationStack",
            Self::AllocationTracesTops => "allocationTracesTops",
            Self::GetSamples => "getSamples",
            Self::GetStatistics => "getStatistics",
            Self::IsEmpty => "isEmpty",
            Self::SortAndRewind { .. } => "sortAndRewind",
            Self::SerializeItemsRange { .. } => "serializeItemsRange",
            Self::NodePosition { .. } => "nodePosition",
        }
    }

    /// Kind of worker object this method is served by.
    pub fn target_kind(&self) -> &'static str {
        match self {
            Self::Write { .. } | Self::Close => "loader",
            Self::UpdateStaticData
            | Self::AggregatesWithFilter { .. }
            | Self::AggregatesForDiff
            | Self::CalculateSnapshotDiff { .. }
            | Self::NodeClassName { .. }
            | Self::Search { .. }
            | Self::GetLocation { .. }
            | Self::AllocationStack { .. }
            | Self::AllocationTracesTops
            | Self::GetSamples
            | Self::GetStatistics => "snapshot",
            Self::IsEmpty
            | Self::SortAndRewind { .. }
            | Self::SerializeItemsRange { .. }
            | Self::NodePosition { .. } => "provider",
        }
    }
}

#[derive(Facet, Debug, Clone, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum FactoryMethod {
    /// Turns a closed loader into a snapshot. Answers `Bool(false)` when the
    /// payload could not be parsed.
    BuildSnapshot,
    CreateEdgesProvider {
        node_index: u32,
    },
    CreateRetainingEdgesProvider {
        node_index: u32,
    },
    CreateAddedNodesProvider {
        base_snapshot_id: ProfileUid,
        class_name: String,
    },
    /// Runs on the base snapshot with indexes taken from a diff.
    CreateDeletedNodesProvider {
        node_indexes: Vec<u32>,
    },
    CreateNodesProviderForClass {
        class_name: String,
        filter: NodeFilter,
    },
}

impl FactoryMethod {
    pub fn name(&self) -> &'static str {
        match self {
            Self::BuildSnapshot => "buildSnapshot",
            Self::CreateEdgesProvider { .. } => "createEdgesProvider",
            Self::CreateRetainingEdgesProvider { .. } => "createRetainingEdgesProvider",
            Self::CreateAddedNodesProvider { .. } => "createAddedNodesProvider",
            Self::CreateDeletedNodesProvider { .. } => "createDeletedNodesProvider",
            Self::CreateNodesProviderForClass { .. } => "createNodesProviderForClass",
        }
    }
}

/// Hooks used by tests to observe worker scheduling.
#[derive(Facet, Debug, Clone, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum TestProbe {
    Echo { value: String },
    /// Blocks the worker thread before replying.
    Sleep { millis: u64 },
    Fail { message: String },
}

// ── Replies and events ──────────────────────────────────────────────────────

#[derive(Facet, Debug, Clone, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum WorkerMessage {
    Reply(Reply),
    Event(WorkerEvent),
}

#[derive(Facet, Debug, Clone, PartialEq)]
pub struct Reply {
    pub call_id: CallId,
    pub outcome: ReplyOutcome,
}

#[derive(Facet, Debug, Clone, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum ReplyOutcome {
    Success(MethodResult),
    Error(RemoteError),
}

/// An exception raised inside the worker while serving a call.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    pub error: String,
    pub error_method_name: Option<String>,
    pub error_call_stack: Option<String>,
}

#[derive(Facet, Debug, Clone, PartialEq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum MethodResult {
    Done,
    Bool(bool),
    StaticData(StaticData),
    Aggregates(Vec<Aggregate>),
    AggregatesForDiff(Vec<AggregateForDiff>),
    Diff(Vec<DiffForClass>),
    ClassName(Option<String>),
    NodeIds(Vec<u64>),
    Location(Option<Location>),
    AllocationStack(Option<Vec<AllocationStackFrame>>),
    AllocationTops(Vec<SerializedAllocationNode>),
    Samples(Option<Samples>),
    Statistics(Statistics),
    ItemsRange(ItemsRange),
    Position(i64),
    Probe(String),
}

impl MethodResult {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::Bool(_) => "bool",
            Self::StaticData(_) => "static_data",
            Self::Aggregates(_) => "aggregates",
            Self::AggregatesForDiff(_) => "aggregates_for_diff",
            Self::Diff(_) => "diff",
            Self::ClassName(_) => "class_name",
            Self::NodeIds(_) => "node_ids",
            Self::Location(_) => "location",
            Self::AllocationStack(_) => "allocation_stack",
            Self::AllocationTops(_) => "allocation_tops",
            Self::Samples(_) => "samples",
            Self::Statistics(_) => "statistics",
            Self::ItemsRange(_) => "items_range",
            Self::Position(_) => "position",
            Self::Probe(_) => "probe",
        }
    }
}

/// Out-of-band notifications. They carry no call id.
#[derive(Facet, Debug, Clone, PartialEq, Eq)]
#[repr(u8)]
#[facet(rename_all = "snake_case")]
pub enum WorkerEvent {
    Progress { message: String },
    /// The snapshot could not be parsed or indexed. The load must be redone.
    BrokenSnapshot { message: String },
}

// ── Codec ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    Encode(String),
    Decode(String),
}

impl fmt::Display for WireError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Encode(message) => write!(f, "encode frame: {message}"),
            Self::Decode(message) => write!(f, "decode frame: {message}"),
        }
    }
}

impl Error for WireError {}

pub fn encode_request(request: &Request) -> Result<String, WireError> {
    facet_json::to_string(request).map_err(|e| WireError::Encode(format!("request: {e}")))
}

pub fn decode_request(frame: &str) -> Result<Request, WireError> {
    facet_json::from_str(frame).map_err(|e| WireError::Decode(format!("request: {e}")))
}

pub fn encode_message(message: &WorkerMessage) -> Result<String, WireError> {
    facet_json::to_string(message).map_err(|e| WireError::Encode(format!("worker message: {e}")))
}

pub fn decode_message(frame: &str) -> Result<WorkerMessage, WireError> {
    facet_json::from_str(frame).map_err(|e| WireError::Decode(format!("worker message: {e}")))
}
