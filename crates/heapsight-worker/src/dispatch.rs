//! Routes decoded requests to the objects living in this worker.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use heapsight_types::{DiffForClass, ObjectId, ProfileUid};
use heapsight_wire::{
    Disposition, FactoryMethod, Method, MethodResult, RemoteError, Reply, ReplyOutcome, Request,
    TestProbe, WorkerEvent,
};
use tracing::{debug, warn};

use crate::WorkerError;
use crate::loader::SnapshotLoader;
use crate::provider::Provider;
use crate::snapshot::HeapSnapshot;

struct SnapshotObject {
    snapshot: Arc<HeapSnapshot>,
    /// Results of `calculateSnapshotDiff`, keyed by base profile.
    diffs: HashMap<ProfileUid, Vec<DiffForClass>>,
}

enum WorkerObject {
    Loader(SnapshotLoader),
    Snapshot(SnapshotObject),
    Provider(Provider),
}

impl WorkerObject {
    fn kind(&self) -> &'static str {
        match self {
            Self::Loader(_) => "loader",
            Self::Snapshot(_) => "snapshot",
            Self::Provider(_) => "provider",
        }
    }
}

#[derive(Default)]
pub struct Dispatcher {
    objects: HashMap<ObjectId, WorkerObject>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_objects(&self) -> usize {
        self.objects.len()
    }

    /// Serves one request. Returns `None` for dispositions that expect no
    /// reply.
    pub fn handle(&mut self, request: Request, events: &mut dyn FnMut(WorkerEvent)) -> Option<Reply> {
        let call_id = request.call_id;
        let (method_name, outcome) = match request.disposition {
            Disposition::Create {
                object_id,
                profile_uid,
            } => {
                self.objects
                    .insert(object_id, WorkerObject::Loader(SnapshotLoader::new(profile_uid)));
                debug!(%object_id, %profile_uid, "created loader");
                ("create", Ok(MethodResult::Done))
            }
            Disposition::Dispose { object_id } => {
                if self.objects.remove(&object_id).is_none() {
                    debug!(%object_id, "dispose of unknown object");
                }
                return None;
            }
            Disposition::Method { object_id, method } => {
                let name = method.name();
                (name, self.call(object_id, method))
            }
            Disposition::Factory {
                object_id,
                new_object_id,
                method,
            } => {
                let name = method.name();
                (name, self.factory(object_id, new_object_id, method, events))
            }
            Disposition::EvaluateForTest { probe } => ("evaluateForTest", evaluate(probe)),
        };

        let outcome = match outcome {
            Ok(result) => ReplyOutcome::Success(result),
            Err(error) => {
                warn!(%call_id, method = method_name, %error, "call failed in worker");
                ReplyOutcome::Error(RemoteError {
                    error: error.to_string(),
                    error_method_name: Some(method_name.to_string()),
                    error_call_stack: Some(format!("{method_name}: {error:?}")),
                })
            }
        };
        Some(Reply { call_id, outcome })
    }

    fn object_mut(&mut self, object_id: ObjectId) -> Result<&mut WorkerObject, WorkerError> {
        self.objects
            .get_mut(&object_id)
            .ok_or(WorkerError::UnknownObject(object_id))
    }

    fn snapshot_object(
        &self,
        object_id: ObjectId,
        method: &'static str,
    ) -> Result<&SnapshotObject, WorkerError> {
        match self.objects.get(&object_id) {
            Some(WorkerObject::Snapshot(object)) => Ok(object),
            Some(other) => Err(WorkerError::WrongObjectKind {
                object_id,
                expected: "snapshot",
                found: other.kind(),
                method,
            }),
            None => Err(WorkerError::UnknownObject(object_id)),
        }
    }

    fn snapshot(&self, object_id: ObjectId, method: &'static str) -> Result<Arc<HeapSnapshot>, WorkerError> {
        self.snapshot_object(object_id, method)
            .map(|object| object.snapshot.clone())
    }

    fn call(&mut self, object_id: ObjectId, method: Method) -> Result<MethodResult, WorkerError> {
        let (name, expected) = (method.name(), method.target_kind());
        let object = self.object_mut(object_id)?;
        let result = match (object, method) {
            (WorkerObject::Loader(loader), Method::Write { chunk }) => {
                loader.write(&chunk)?;
                MethodResult::Done
            }
            (WorkerObject::Loader(loader), Method::Close) => {
                loader.close();
                MethodResult::Done
            }

            (WorkerObject::Snapshot(object), Method::UpdateStaticData) => {
                MethodResult::StaticData(object.snapshot.static_data())
            }
            (WorkerObject::Snapshot(object), Method::AggregatesWithFilter { filter }) => {
                MethodResult::Aggregates(object.snapshot.aggregates_with_filter(&filter))
            }
            (WorkerObject::Snapshot(object), Method::AggregatesForDiff) => {
                MethodResult::AggregatesForDiff(object.snapshot.aggregates_for_diff())
            }
            (
                WorkerObject::Snapshot(object),
                Method::CalculateSnapshotDiff {
                    base_snapshot_id,
                    base_aggregates,
                },
            ) => {
                let diffs = object
                    .diffs
                    .entry(base_snapshot_id)
                    .or_insert_with(|| object.snapshot.calculate_snapshot_diff(&base_aggregates));
                MethodResult::Diff(diffs.clone())
            }
            (WorkerObject::Snapshot(object), Method::NodeClassName { snapshot_object_id }) => {
                MethodResult::ClassName(object.snapshot.node_class_name(snapshot_object_id))
            }
            (WorkerObject::Snapshot(object), Method::Search { config, filter }) => {
                MethodResult::NodeIds(object.snapshot.search(&config, &filter)?)
            }
            (WorkerObject::Snapshot(object), Method::GetLocation { node_index }) => {
                MethodResult::Location(object.snapshot.location(node_index)?)
            }
            (WorkerObject::Snapshot(object), Method::AllocationStack { node_index }) => {
                MethodResult::AllocationStack(object.snapshot.allocation_stack(node_index)?)
            }
            (WorkerObject::Snapshot(object), Method::AllocationTracesTops) => {
                MethodResult::AllocationTops(object.snapshot.allocation_traces_tops())
            }
            (WorkerObject::Snapshot(object), Method::GetSamples) => {
                MethodResult::Samples(object.snapshot.samples())
            }
            (WorkerObject::Snapshot(object), Method::GetStatistics) => {
                MethodResult::Statistics(object.snapshot.statistics())
            }

            (WorkerObject::Provider(provider), Method::IsEmpty) => {
                MethodResult::Bool(provider.is_empty())
            }
            (WorkerObject::Provider(provider), Method::SortAndRewind { comparator }) => {
                provider.sort_and_rewind(&comparator);
                MethodResult::Done
            }
            (WorkerObject::Provider(provider), Method::SerializeItemsRange { start, end }) => {
                MethodResult::ItemsRange(provider.serialize_items_range(start, end))
            }
            (WorkerObject::Provider(provider), Method::NodePosition { snapshot_object_id }) => {
                MethodResult::Position(provider.node_position(snapshot_object_id))
            }

            (object, _) => {
                return Err(WorkerError::WrongObjectKind {
                    object_id,
                    expected,
                    found: object.kind(),
                    method: name,
                });
            }
        };
        Ok(result)
    }

    fn factory(
        &mut self,
        object_id: ObjectId,
        new_object_id: ObjectId,
        method: FactoryMethod,
        events: &mut dyn FnMut(WorkerEvent),
    ) -> Result<MethodResult, WorkerError> {
        let name = method.name();
        let product = match method {
            FactoryMethod::BuildSnapshot => {
                let loader = match self.object_mut(object_id)? {
                    WorkerObject::Loader(loader) => loader,
                    other => {
                        return Err(WorkerError::WrongObjectKind {
                            object_id,
                            expected: "loader",
                            found: other.kind(),
                            method: name,
                        });
                    }
                };
                let mut progress = |message: &str| {
                    events(WorkerEvent::Progress {
                        message: message.to_string(),
                    })
                };
                match loader.build_snapshot(&mut progress) {
                    Ok(snapshot) => WorkerObject::Snapshot(SnapshotObject {
                        snapshot: Arc::new(snapshot),
                        diffs: HashMap::new(),
                    }),
                    Err(WorkerError::Parse(message)) => {
                        warn!(%object_id, %message, "broken snapshot");
                        events(WorkerEvent::BrokenSnapshot { message });
                        return Ok(MethodResult::Bool(false));
                    }
                    Err(other) => return Err(other),
                }
            }
            FactoryMethod::CreateEdgesProvider { node_index } => {
                let snapshot = self.snapshot(object_id, name)?;
                WorkerObject::Provider(Provider::edges(snapshot, node_index)?)
            }
            FactoryMethod::CreateRetainingEdgesProvider { node_index } => {
                let snapshot = self.snapshot(object_id, name)?;
                WorkerObject::Provider(Provider::retainers(snapshot, node_index)?)
            }
            FactoryMethod::CreateAddedNodesProvider {
                base_snapshot_id,
                class_name,
            } => {
                let object = self.snapshot_object(object_id, name)?;
                let diffs = object
                    .diffs
                    .get(&base_snapshot_id)
                    .ok_or(WorkerError::UnknownBaseSnapshot(base_snapshot_id))?;
                let added = diffs
                    .iter()
                    .find(|diff| diff.name == class_name)
                    .map(|diff| diff.added_indexes.clone())
                    .unwrap_or_default();
                WorkerObject::Provider(Provider::nodes(object.snapshot.clone(), added)?)
            }
            FactoryMethod::CreateDeletedNodesProvider { node_indexes } => {
                let snapshot = self.snapshot(object_id, name)?;
                WorkerObject::Provider(Provider::nodes(snapshot, node_indexes)?)
            }
            FactoryMethod::CreateNodesProviderForClass { class_name, filter } => {
                let snapshot = self.snapshot(object_id, name)?;
                WorkerObject::Provider(Provider::nodes_for_class(snapshot, &class_name, &filter))
            }
        };
        debug!(%object_id, %new_object_id, kind = product.kind(), "factory produced object");
        self.objects.insert(new_object_id, product);
        Ok(MethodResult::Bool(true))
    }
}

fn evaluate(probe: TestProbe) -> Result<MethodResult, WorkerError> {
    match probe {
        TestProbe::Echo { value } => Ok(MethodResult::Probe(value)),
        TestProbe::Sleep { millis } => {
            std::thread::sleep(Duration::from_millis(millis));
            Ok(MethodResult::Probe(format!("slept {millis}ms")))
        }
        TestProbe::Fail { message } => Err(WorkerError::ProbeFailed(message)),
    }
}
