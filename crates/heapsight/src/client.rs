//! Request/response client for one snapshot worker.
//!
//! Every call gets a fresh [`CallId`]; the reply is routed back to the
//! caller's future by that id. Objects created in the worker get their
//! [`ObjectId`] from the client, eagerly, so that calls against a new object
//! can be queued before the worker has even created it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use heapsight_types::{CallId, ObjectId, ProfileUid};
use heapsight_wire::{
    Disposition, FactoryMethod, Method, MethodResult, ReplyOutcome, Request, TestProbe,
    WorkerEvent, WorkerMessage, decode_message, encode_request,
};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::RpcError;
use crate::transport::{ThreadWorker, WorkerTransport};

type Resolver = oneshot::Sender<Result<MethodResult, RpcError>>;
type EventHandler = Box<dyn Fn(WorkerEvent) + Send + Sync>;

struct PendingCall {
    method: &'static str,
    resolve: Resolver,
}

struct Inner {
    config: ClientConfig,
    transport: Box<dyn WorkerTransport>,
    next_call_id: AtomicU64,
    next_object_id: AtomicU64,
    pending: Mutex<HashMap<CallId, PendingCall>>,
    /// Calls that were already pending at the previous check.
    previous_calls: Mutex<HashSet<CallId>>,
    busy: watch::Sender<bool>,
    checker: Mutex<Option<JoinHandle<()>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    on_event: EventHandler,
    broken_snapshot: Mutex<Option<String>>,
    disposed: AtomicBool,
}

/// Cheap to clone; clones talk to the same worker.
#[derive(Clone)]
pub struct WorkerClient {
    inner: Arc<Inner>,
}

impl WorkerClient {
    /// Wraps a transport. Must be called inside a tokio runtime: a task is
    /// spawned to read `frames`.
    pub fn new(
        transport: impl WorkerTransport + 'static,
        frames: mpsc::UnboundedReceiver<String>,
        config: ClientConfig,
        on_event: impl Fn(WorkerEvent) + Send + Sync + 'static,
    ) -> Self {
        let (busy, _) = watch::channel(false);
        let inner = Arc::new(Inner {
            config,
            transport: Box::new(transport),
            next_call_id: AtomicU64::new(0),
            next_object_id: AtomicU64::new(0),
            pending: Mutex::new(HashMap::new()),
            previous_calls: Mutex::new(HashSet::new()),
            busy,
            checker: Mutex::new(None),
            reader: Mutex::new(None),
            on_event: Box::new(on_event),
            broken_snapshot: Mutex::new(None),
            disposed: AtomicBool::new(false),
        });
        let reader = tokio::spawn(read_frames(Arc::downgrade(&inner), frames));
        *inner.reader.lock() = Some(reader);
        Self { inner }
    }

    /// Starts a worker thread and connects to it.
    pub fn spawn_thread(
        name: &str,
        config: ClientConfig,
        on_event: impl Fn(WorkerEvent) + Send + Sync + 'static,
    ) -> Result<Self, RpcError> {
        let (transport, frames) = ThreadWorker::spawn(name)?;
        Ok(Self::new(transport, frames, config, on_event))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Whether both handles talk to the same worker.
    pub fn same_client(&self, other: &WorkerClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending.lock().len()
    }

    // ── Calls ────────────────────────────────────────────────

    pub async fn call(&self, object_id: ObjectId, method: Method) -> Result<MethodResult, RpcError> {
        let name = method.name();
        let reply = self.send(Disposition::Method { object_id, method }, name)?;
        reply.await.map_err(|_| RpcError::WorkerTerminated)?
    }

    /// Asks `object_id` to produce a new object and returns its id at once.
    /// Failures are only logged.
    pub fn call_factory(&self, object_id: ObjectId, method: FactoryMethod) -> Result<ObjectId, RpcError> {
        let (new_object_id, _reply) = self.send_factory(object_id, method)?;
        Ok(new_object_id)
    }

    /// Like [`call_factory`](Self::call_factory), but waits for the worker and
    /// yields the id only if the object was actually built.
    pub async fn call_factory_confirmed(
        &self,
        object_id: ObjectId,
        method: FactoryMethod,
    ) -> Result<Option<ObjectId>, RpcError> {
        let name = method.name();
        let (new_object_id, reply) = self.send_factory(object_id, method)?;
        match reply.await.map_err(|_| RpcError::WorkerTerminated)?? {
            MethodResult::Bool(true) => Ok(Some(new_object_id)),
            MethodResult::Bool(false) => Ok(None),
            other => Err(RpcError::UnexpectedResult {
                method: name,
                expected: "bool",
                found: other.kind(),
            }),
        }
    }

    fn send_factory(
        &self,
        object_id: ObjectId,
        method: FactoryMethod,
    ) -> Result<(ObjectId, oneshot::Receiver<Result<MethodResult, RpcError>>), RpcError> {
        let new_object_id = ObjectId::next_from(&self.inner.next_object_id);
        let name = method.name();
        let reply = self.send(
            Disposition::Factory {
                object_id,
                new_object_id,
                method,
            },
            name,
        )?;
        Ok((new_object_id, reply))
    }

    /// Creates a loader in the worker for a snapshot of `profile_uid`.
    pub fn create_loader(&self, profile_uid: ProfileUid) -> Result<ObjectId, RpcError> {
        let object_id = ObjectId::next_from(&self.inner.next_object_id);
        self.send(
            Disposition::Create {
                object_id,
                profile_uid,
            },
            "create",
        )?;
        Ok(object_id)
    }

    /// Releases a worker object. The worker does not answer.
    pub fn dispose_object(&self, object_id: ObjectId) -> Result<(), RpcError> {
        if self.is_disposed() {
            return Err(RpcError::WorkerTerminated);
        }
        let call_id = CallId::next_from(&self.inner.next_call_id);
        let frame = encode_request(&Request {
            call_id,
            disposition: Disposition::Dispose { object_id },
        })?;
        self.inner.transport.post_message(frame)
    }

    pub async fn evaluate_for_test(&self, probe: TestProbe) -> Result<MethodResult, RpcError> {
        let reply = self.send(Disposition::EvaluateForTest { probe }, "evaluateForTest")?;
        reply.await.map_err(|_| RpcError::WorkerTerminated)?
    }

    fn send(
        &self,
        disposition: Disposition,
        method: &'static str,
    ) -> Result<oneshot::Receiver<Result<MethodResult, RpcError>>, RpcError> {
        if self.is_disposed() {
            return Err(RpcError::WorkerTerminated);
        }
        let call_id = CallId::next_from(&self.inner.next_call_id);
        let frame = encode_request(&Request {
            call_id,
            disposition,
        })?;
        let (resolve, reply) = oneshot::channel();
        self.inner
            .pending
            .lock()
            .insert(call_id, PendingCall { method, resolve });
        if let Err(e) = self.inner.transport.post_message(frame) {
            self.inner.pending.lock().remove(&call_id);
            return Err(e);
        }
        Ok(reply)
    }

    /// Takes the message of the last `BrokenSnapshot` event, if any.
    pub(crate) fn take_broken_snapshot(&self) -> Option<String> {
        self.inner.broken_snapshot.lock().take()
    }

    // ── Long-running calls ───────────────────────────────────

    /// Starts the periodic check that drives [`subscribe_busy`](Self::subscribe_busy).
    /// Calling it again does nothing.
    pub fn start_checking_for_long_running_calls(&self) {
        let mut checker = self.inner.checker.lock();
        if checker.is_some() || self.is_disposed() {
            return;
        }
        let inner = Arc::downgrade(&self.inner);
        let period = self.inner.config.long_running_poll;
        *checker = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            loop {
                ticker.tick().await;
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                inner.check_long_running_calls();
            }
        }));
    }

    /// True while some call has been pending for more than one poll interval.
    pub fn subscribe_busy(&self) -> watch::Receiver<bool> {
        self.inner.busy.subscribe()
    }

    pub fn is_busy(&self) -> bool {
        *self.inner.busy.borrow()
    }

    // ── Teardown ─────────────────────────────────────────────

    /// Terminates the worker. Every outstanding call fails with
    /// [`RpcError::WorkerTerminated`] and every proxy becomes unusable.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.transport.terminate();
        if let Some(checker) = self.inner.checker.lock().take() {
            checker.abort();
        }
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        let pending: Vec<PendingCall> = self.inner.pending.lock().drain().map(|(_, call)| call).collect();
        let failed = pending.len();
        for call in pending {
            let _ = call.resolve.send(Err(RpcError::WorkerTerminated));
        }
        self.inner.previous_calls.lock().clear();
        self.inner.busy.send_if_modified(|busy| std::mem::replace(busy, false));
        info!(failed, "worker client disposed");
    }
}

impl Inner {
    fn dispatch_frame(&self, frame: &str) {
        let message = match decode_message(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(%e, "dropping undecodable worker frame");
                return;
            }
        };
        let reply = match message {
            WorkerMessage::Event(event) => {
                if let WorkerEvent::BrokenSnapshot { message } = &event {
                    warn!(%message, "worker reported a broken snapshot");
                    *self.broken_snapshot.lock() = Some(message.clone());
                }
                (self.on_event)(event);
                return;
            }
            WorkerMessage::Reply(reply) => reply,
        };

        let Some(call) = self.pending.lock().remove(&reply.call_id) else {
            debug!(call_id = %reply.call_id, "dropping reply for unknown call");
            return;
        };
        let result = match reply.outcome {
            ReplyOutcome::Success(result) => Ok(result),
            ReplyOutcome::Error(remote) => {
                error!(
                    call_id = %reply.call_id,
                    method = remote.error_method_name.as_deref().unwrap_or(call.method),
                    call_stack = remote.error_call_stack.as_deref().unwrap_or("<none>"),
                    error = %remote.error,
                    "worker call failed"
                );
                if self.config.reject_remote_errors {
                    Err(RpcError::Remote {
                        message: remote.error,
                        method: remote.error_method_name,
                        call_stack: remote.error_call_stack,
                    })
                } else {
                    Err(RpcError::CallAbandoned {
                        method: call.method.to_string(),
                    })
                }
            }
        };
        let _ = call.resolve.send(result);
    }

    fn check_long_running_calls(&self) {
        let pending = self.pending.lock();
        let mut previous = self.previous_calls.lock();
        previous.retain(|call_id| pending.contains_key(call_id));
        let busy = !previous.is_empty();
        previous.extend(pending.keys().copied());
        drop(previous);
        drop(pending);

        self.busy.send_if_modified(|current| {
            if *current == busy {
                return false;
            }
            *current = busy;
            debug!(busy, "long-running call state changed");
            true
        });
    }
}

async fn read_frames(inner: Weak<Inner>, mut frames: mpsc::UnboundedReceiver<String>) {
    while let Some(frame) = frames.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.dispatch_frame(&frame);
    }
    debug!("worker frame stream ended");
}

#[cfg(test)]
mod tests;
