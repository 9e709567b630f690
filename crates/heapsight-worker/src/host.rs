//! Runs a [`Dispatcher`] on its own OS thread. The thread is reachable only
//! through string frames, so nothing is shared with the caller.

use std::sync::mpsc;
use std::thread::{self, JoinHandle};

use heapsight_wire::{WorkerEvent, WorkerMessage, decode_request, encode_message};
use tracing::{debug, info, warn};

use crate::WorkerError;
use crate::dispatch::Dispatcher;

/// Serves frames from `requests` until the sending side is dropped.
pub fn serve(requests: mpsc::Receiver<String>, mut post: impl FnMut(String)) {
    let mut dispatcher = Dispatcher::new();
    for frame in requests {
        let request = match decode_request(&frame) {
            Ok(request) => request,
            Err(e) => {
                warn!(%e, "dropping undecodable request frame");
                continue;
            }
        };
        let reply = {
            let mut emit = |event: WorkerEvent| post_message(&mut post, WorkerMessage::Event(event));
            dispatcher.handle(request, &mut emit)
        };
        if let Some(reply) = reply {
            post_message(&mut post, WorkerMessage::Reply(reply));
        }
    }
    debug!(live_objects = dispatcher.live_objects(), "worker request channel closed");
}

fn post_message(post: &mut impl FnMut(String), message: WorkerMessage) {
    match encode_message(&message) {
        Ok(frame) => post(frame),
        Err(e) => warn!(%e, "failed to encode worker message"),
    }
}

/// Handle to a worker thread.
pub struct WorkerThread {
    requests: Option<mpsc::Sender<String>>,
    handle: Option<JoinHandle<()>>,
}

impl WorkerThread {
    pub fn spawn(
        name: &str,
        post: impl FnMut(String) + Send + 'static,
    ) -> Result<Self, WorkerError> {
        let (requests, receiver) = mpsc::channel::<String>();
        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || serve(receiver, post))
            .map_err(|e| WorkerError::Spawn(e.to_string()))?;
        info!(worker = name, "snapshot worker started");
        Ok(Self {
            requests: Some(requests),
            handle: Some(handle),
        })
    }

    pub fn post(&self, frame: String) -> Result<(), WorkerError> {
        let requests = self.requests.as_ref().ok_or(WorkerError::Terminated)?;
        requests.send(frame).map_err(|_| WorkerError::Terminated)
    }

    pub fn is_terminated(&self) -> bool {
        self.requests.is_none()
    }

    /// Stops accepting requests. The thread exits once it finishes the call
    /// it is serving, and is not joined.
    pub fn terminate(&mut self) {
        if self.requests.take().is_some() {
            self.handle.take();
            info!("snapshot worker terminated");
        }
    }
}

impl Drop for WorkerThread {
    fn drop(&mut self) {
        self.terminate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heapsight_types::{CallId, ObjectId, ProfileUid};
    use heapsight_wire::{Disposition, MethodResult, ReplyOutcome, Request, TestProbe, decode_message, encode_request};
    use std::time::Duration;

    fn frame(call: u64, disposition: Disposition) -> String {
        encode_request(&Request {
            call_id: CallId::new(call).expect("non-zero call id"),
            disposition,
        })
        .expect("encode")
    }

    #[test]
    fn replies_and_skips_garbage() {
        let (replies, received) = mpsc::channel();
        let worker = WorkerThread::spawn("test-worker", move |frame| {
            let _ = replies.send(frame);
        })
        .expect("spawn");

        worker.post("not a frame".to_string()).expect("post");
        worker
            .post(frame(
                1,
                Disposition::EvaluateForTest {
                    probe: TestProbe::Echo {
                        value: "pong".to_string(),
                    },
                },
            ))
            .expect("post");

        let reply = received
            .recv_timeout(Duration::from_secs(5))
            .expect("reply frame");
        let WorkerMessage::Reply(reply) = decode_message(&reply).expect("decode") else {
            panic!("expected a reply");
        };
        assert_eq!(reply.call_id.get(), 1);
        assert_eq!(
            reply.outcome,
            ReplyOutcome::Success(MethodResult::Probe("pong".to_string()))
        );
    }

    #[test]
    fn dispose_gets_no_reply_and_terminate_refuses_posts() {
        let (replies, received) = mpsc::channel();
        let mut worker = WorkerThread::spawn("test-worker", move |frame| {
            let _ = replies.send(frame);
        })
        .expect("spawn");
        let object_id = ObjectId::new(1).expect("non-zero id");
        worker
            .post(frame(
                1,
                Disposition::Create {
                    object_id,
                    profile_uid: ProfileUid::new(1).expect("non-zero uid"),
                },
            ))
            .expect("post");
        worker
            .post(frame(2, Disposition::Dispose { object_id }))
            .expect("post");
        worker
            .post(frame(
                3,
                Disposition::EvaluateForTest {
                    probe: TestProbe::Echo {
                        value: "after".to_string(),
                    },
                },
            ))
            .expect("post");

        let mut call_ids = Vec::new();
        for _ in 0..2 {
            let frame = received.recv_timeout(Duration::from_secs(5)).expect("frame");
            if let WorkerMessage::Reply(reply) = decode_message(&frame).expect("decode") {
                call_ids.push(reply.call_id.get());
            }
        }
        assert_eq!(call_ids, [1, 3]);

        worker.terminate();
        assert!(worker.is_terminated());
        assert_eq!(worker.post("x".to_string()), Err(WorkerError::Terminated));
    }
}
