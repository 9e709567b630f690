//! Typed handles to objects living in a worker.
//!
//! Worker objects are never reclaimed implicitly: each proxy must be
//! disposed, which sends exactly one `Dispose` request.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use heapsight_types::{
    AggregateForDiff, Aggregates, AllocationStackFrame, ComparatorConfig, DiffForClass,
    ItemsRange, Location, NodeFilter, ObjectId, ProfileUid, Samples, SearchConfig,
    SerializedAllocationNode, StaticData, Statistics, aggregates_by_name,
};
use heapsight_wire::{FactoryMethod, Method, MethodResult};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::client::WorkerClient;
use crate::error::{LoadError, RpcError};

fn unexpected(method: &'static str, expected: &'static str, found: &MethodResult) -> RpcError {
    RpcError::UnexpectedResult {
        method,
        expected,
        found: found.kind(),
    }
}

/// Unwraps the one `MethodResult` variant a method is expected to answer with.
macro_rules! expect_result {
    ($result:expr, $method:literal, $variant:ident) => {
        match $result {
            MethodResult::$variant => Ok(()),
            other => Err(unexpected($method, stringify!($variant), &other)),
        }
    };
    ($result:expr, $method:literal, $variant:ident($value:ident) => $out:expr) => {
        match $result {
            MethodResult::$variant($value) => Ok($out),
            other => Err(unexpected($method, stringify!($variant), &other)),
        }
    };
}

/// Handle shared by every proxy kind.
pub struct ProxyObject {
    client: WorkerClient,
    object_id: ObjectId,
    disposed: AtomicBool,
}

impl ProxyObject {
    pub(crate) fn new(client: WorkerClient, object_id: ObjectId) -> Self {
        Self {
            client,
            object_id,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    pub fn client(&self) -> &WorkerClient {
        &self.client
    }

    /// Same remote object through the same client.
    pub fn same_object(&self, other: &ProxyObject) -> bool {
        self.object_id == other.object_id && self.client.same_client(&other.client)
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Releases the remote object. Only the first call sends anything.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.client.dispose_object(self.object_id) {
            debug!(object_id = %self.object_id, %e, "dispose not delivered");
        }
    }

    async fn call(&self, method: Method) -> Result<MethodResult, RpcError> {
        self.client.call(self.object_id, method).await
    }

    fn factory(&self, method: FactoryMethod) -> Result<ObjectId, RpcError> {
        self.client.call_factory(self.object_id, method)
    }
}

impl Drop for ProxyObject {
    fn drop(&mut self) {
        if !self.is_disposed() && !self.client.is_disposed() {
            warn!(object_id = %self.object_id, "proxy dropped without dispose; worker object leaked");
        }
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

/// Write side of a snapshot being streamed into the worker.
pub struct LoaderProxy {
    object: ProxyObject,
    profile_uid: ProfileUid,
}

impl LoaderProxy {
    pub fn create(client: &WorkerClient, profile_uid: ProfileUid) -> Result<Self, RpcError> {
        let object_id = client.create_loader(profile_uid)?;
        Ok(Self {
            object: ProxyObject::new(client.clone(), object_id),
            profile_uid,
        })
    }

    pub fn object(&self) -> &ProxyObject {
        &self.object
    }

    pub async fn write(&self, chunk: String) -> Result<(), RpcError> {
        let result = self.object.call(Method::Write { chunk }).await?;
        expect_result!(result, "write", Done)
    }

    /// Finishes the stream and turns it into a snapshot. The loader is
    /// disposed on every path.
    pub async fn close(self) -> Result<SnapshotProxy, LoadError> {
        let built = self.build().await;
        self.object.dispose();
        let snapshot_id = match built? {
            Some(snapshot_id) => snapshot_id,
            None => {
                let message = self
                    .object
                    .client
                    .take_broken_snapshot()
                    .unwrap_or_else(|| format!("profile {} could not be parsed", self.profile_uid));
                return Err(LoadError::BrokenSnapshot(message));
            }
        };

        let snapshot = SnapshotProxy::new(self.object.client.clone(), snapshot_id, self.profile_uid);
        if let Err(e) = snapshot.update_static_data().await {
            snapshot.dispose();
            return Err(e.into());
        }
        info!(
            profile_uid = %self.profile_uid,
            nodes = snapshot.node_count(),
            total_size = snapshot.total_size(),
            "snapshot loaded"
        );
        Ok(snapshot)
    }

    async fn build(&self) -> Result<Option<ObjectId>, RpcError> {
        let result = self.object.call(Method::Close).await?;
        expect_result!(result, "close", Done)?;
        self.object
            .client
            .call_factory_confirmed(self.object.object_id, FactoryMethod::BuildSnapshot)
            .await
    }

    /// Aborts the load.
    pub fn dispose(&self) {
        self.object.dispose();
    }
}

/// Streams `reader` into a new loader in chunks of the client's configured
/// size and builds the snapshot. Read failures dispose the loader and never
/// reach the worker.
pub async fn load_snapshot_from_reader<R>(
    client: &WorkerClient,
    source: &str,
    mut reader: R,
    profile_uid: ProfileUid,
) -> Result<SnapshotProxy, LoadError>
where
    R: AsyncRead + Unpin,
{
    let loader = LoaderProxy::create(client, profile_uid)?;
    let chunk_size = client.config().chunk_size.max(4);
    let mut buffer = vec![0u8; chunk_size];
    let mut carry: Vec<u8> = Vec::new();
    loop {
        let read = match reader.read(&mut buffer).await {
            Ok(read) => read,
            Err(e) => {
                loader.dispose();
                return Err(LoadError::FileRead {
                    path: source.to_string(),
                    message: e.to_string(),
                });
            }
        };
        if read == 0 {
            break;
        }
        carry.extend_from_slice(&buffer[..read]);
        let Some(chunk) = take_text(&mut carry) else {
            continue;
        };
        if let Err(e) = loader.write(chunk).await {
            loader.dispose();
            return Err(e.into());
        }
    }
    if !carry.is_empty() {
        let chunk = String::from_utf8_lossy(&carry).into_owned();
        if let Err(e) = loader.write(chunk).await {
            loader.dispose();
            return Err(e.into());
        }
    }
    loader.close().await
}

/// Takes everything from `carry` that can be sent as text. Invalid bytes
/// become U+FFFD; only a sequence cut short by the end of the buffer stays
/// behind, so at most three bytes are carried over.
fn take_text(carry: &mut Vec<u8>) -> Option<String> {
    let mut start = 0;
    let complete = loop {
        match std::str::from_utf8(&carry[start..]) {
            Ok(_) => break carry.len(),
            Err(e) => match e.error_len() {
                Some(invalid) => start += e.valid_up_to() + invalid,
                None => break start + e.valid_up_to(),
            },
        }
    };
    if complete == 0 {
        return None;
    }
    let rest = carry.split_off(complete);
    let text = String::from_utf8_lossy(carry).into_owned();
    *carry = rest;
    Some(text)
}

pub async fn load_snapshot_from_file(
    client: &WorkerClient,
    path: &Path,
    profile_uid: ProfileUid,
) -> Result<SnapshotProxy, LoadError> {
    let source = path.display().to_string();
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| LoadError::FileRead {
            path: source.clone(),
            message: e.to_string(),
        })?;
    load_snapshot_from_reader(client, &source, file, profile_uid).await
}

// ── Snapshot ─────────────────────────────────────────────────────────────────

pub struct SnapshotProxy {
    object: ProxyObject,
    profile_uid: Mutex<ProfileUid>,
    static_data: Mutex<Option<StaticData>>,
}

impl SnapshotProxy {
    pub(crate) fn new(client: WorkerClient, object_id: ObjectId, profile_uid: ProfileUid) -> Self {
        Self {
            object: ProxyObject::new(client, object_id),
            profile_uid: Mutex::new(profile_uid),
            static_data: Mutex::new(None),
        }
    }

    pub fn object(&self) -> &ProxyObject {
        &self.object
    }

    /// Profile uid other snapshots diff against.
    pub fn uid(&self) -> ProfileUid {
        *self.profile_uid.lock()
    }

    pub fn set_profile_uid(&self, profile_uid: ProfileUid) {
        *self.profile_uid.lock() = profile_uid;
    }

    pub fn same_object(&self, other: &SnapshotProxy) -> bool {
        self.object.same_object(&other.object)
    }

    pub fn dispose(&self) {
        self.object.dispose();
    }

    pub async fn update_static_data(&self) -> Result<StaticData, RpcError> {
        let result = self.object.call(Method::UpdateStaticData).await?;
        let data = expect_result!(result, "updateStaticData", StaticData(data) => data)?;
        *self.static_data.lock() = Some(data);
        Ok(data)
    }

    pub fn static_data(&self) -> Option<StaticData> {
        *self.static_data.lock()
    }

    pub fn node_count(&self) -> u32 {
        self.static_data().map_or(0, |data| data.node_count)
    }

    pub fn root_node_index(&self) -> u32 {
        self.static_data().map_or(0, |data| data.root_node_index)
    }

    pub fn total_size(&self) -> u64 {
        self.static_data().map_or(0, |data| data.total_size)
    }

    pub fn max_js_object_id(&self) -> u64 {
        self.static_data().map_or(0, |data| data.max_js_object_id)
    }

    /// Per-class rollups of the nodes `filter` keeps, keyed by class name.
    pub async fn aggregates_with_filter(&self, filter: NodeFilter) -> Result<Aggregates, RpcError> {
        let result = self.object.call(Method::AggregatesWithFilter { filter }).await?;
        expect_result!(result, "aggregatesWithFilter", Aggregates(list) => aggregates_by_name(list))
    }

    pub async fn aggregates_for_diff(&self) -> Result<Vec<AggregateForDiff>, RpcError> {
        let result = self.object.call(Method::AggregatesForDiff).await?;
        expect_result!(result, "aggregatesForDiff", AggregatesForDiff(list) => list)
    }

    /// Diffs this snapshot against the digest of the snapshot `base_snapshot_id`.
    pub async fn calculate_snapshot_diff(
        &self,
        base_snapshot_id: ProfileUid,
        base_aggregates: Vec<AggregateForDiff>,
    ) -> Result<Vec<DiffForClass>, RpcError> {
        let result = self
            .object
            .call(Method::CalculateSnapshotDiff {
                base_snapshot_id,
                base_aggregates,
            })
            .await?;
        expect_result!(result, "calculateSnapshotDiff", Diff(list) => list)
    }

    pub async fn node_class_name(&self, snapshot_object_id: u64) -> Result<Option<String>, RpcError> {
        let result = self
            .object
            .call(Method::NodeClassName { snapshot_object_id })
            .await?;
        expect_result!(result, "nodeClassName", ClassName(name) => name)
    }

    pub async fn search(&self, config: SearchConfig, filter: NodeFilter) -> Result<Vec<u64>, RpcError> {
        let result = self.object.call(Method::Search { config, filter }).await?;
        expect_result!(result, "search", NodeIds(ids) => ids)
    }

    pub async fn get_location(&self, node_index: u32) -> Result<Option<Location>, RpcError> {
        let result = self.object.call(Method::GetLocation { node_index }).await?;
        expect_result!(result, "getLocation", Location(location) => location)
    }

    pub async fn allocation_stack(
        &self,
        node_index: u32,
    ) -> Result<Option<Vec<AllocationStackFrame>>, RpcError> {
        let result = self.object.call(Method::AllocationStack { node_index }).await?;
        expect_result!(result, "allocationStack", AllocationStack(frames) => frames)
    }

    pub async fn allocation_traces_tops(&self) -> Result<Vec<SerializedAllocationNode>, RpcError> {
        let result = self.object.call(Method::AllocationTracesTops).await?;
        expect_result!(result, "allocationTracesTops", AllocationTops(tops) => tops)
    }

    pub async fn get_samples(&self) -> Result<Option<Samples>, RpcError> {
        let result = self.object.call(Method::GetSamples).await?;
        expect_result!(result, "getSamples", Samples(samples) => samples)
    }

    pub async fn get_statistics(&self) -> Result<Statistics, RpcError> {
        let result = self.object.call(Method::GetStatistics).await?;
        expect_result!(result, "getStatistics", Statistics(stats) => stats)
    }

    pub fn create_edges_provider(&self, node_index: u32) -> Result<ProviderProxy, RpcError> {
        self.provider(FactoryMethod::CreateEdgesProvider { node_index })
    }

    pub fn create_retaining_edges_provider(&self, node_index: u32) -> Result<ProviderProxy, RpcError> {
        self.provider(FactoryMethod::CreateRetainingEdgesProvider { node_index })
    }

    /// Nodes of `class_name` that are new relative to `base_snapshot_id`.
    /// Needs a prior `calculate_snapshot_diff` against that base.
    pub fn create_added_nodes_provider(
        &self,
        base_snapshot_id: ProfileUid,
        class_name: &str,
    ) -> Result<ProviderProxy, RpcError> {
        self.provider(FactoryMethod::CreateAddedNodesProvider {
            base_snapshot_id,
            class_name: class_name.to_string(),
        })
    }

    pub fn create_deleted_nodes_provider(&self, node_indexes: Vec<u32>) -> Result<ProviderProxy, RpcError> {
        self.provider(FactoryMethod::CreateDeletedNodesProvider { node_indexes })
    }

    pub fn create_nodes_provider_for_class(
        &self,
        class_name: &str,
        filter: NodeFilter,
    ) -> Result<ProviderProxy, RpcError> {
        self.provider(FactoryMethod::CreateNodesProviderForClass {
            class_name: class_name.to_string(),
            filter,
        })
    }

    fn provider(&self, method: FactoryMethod) -> Result<ProviderProxy, RpcError> {
        let object_id = self.object.factory(method)?;
        Ok(ProviderProxy {
            object: ProxyObject::new(self.object.client.clone(), object_id),
        })
    }
}

// ── Provider ─────────────────────────────────────────────────────────────────

pub struct ProviderProxy {
    object: ProxyObject,
}

impl ProviderProxy {
    pub fn object(&self) -> &ProxyObject {
        &self.object
    }

    pub async fn is_empty(&self) -> Result<bool, RpcError> {
        let result = self.object.call(Method::IsEmpty).await?;
        expect_result!(result, "isEmpty", Bool(empty) => empty)
    }

    pub async fn sort_and_rewind(&self, comparator: ComparatorConfig) -> Result<(), RpcError> {
        let result = self.object.call(Method::SortAndRewind { comparator }).await?;
        expect_result!(result, "sortAndRewind", Done)
    }

    pub async fn serialize_items_range(&self, start: u32, end: u32) -> Result<ItemsRange, RpcError> {
        let result = self
            .object
            .call(Method::SerializeItemsRange { start, end })
            .await?;
        expect_result!(result, "serializeItemsRange", ItemsRange(range) => range)
    }

    /// Position of the node with `snapshot_object_id` in the current order.
    pub async fn node_position(&self, snapshot_object_id: u64) -> Result<Option<u32>, RpcError> {
        let result = self
            .object
            .call(Method::NodePosition { snapshot_object_id })
            .await?;
        let position = expect_result!(result, "nodePosition", Position(position) => position)?;
        Ok(u32::try_from(position).ok())
    }

    pub fn dispose(&self) {
        self.object.dispose();
    }
}

#[cfg(test)]
mod tests;
