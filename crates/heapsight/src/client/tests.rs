use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use heapsight_wire::{RemoteError, Reply, decode_request, encode_message};

use super::*;

#[derive(Clone, Default)]
struct RecordingTransport {
    posted: Arc<Mutex<Vec<String>>>,
    terminated: Arc<AtomicBool>,
}

impl WorkerTransport for RecordingTransport {
    fn post_message(&self, frame: String) -> Result<(), RpcError> {
        if self.terminated.load(Ordering::Acquire) {
            return Err(RpcError::WorkerTerminated);
        }
        self.posted.lock().push(frame);
        Ok(())
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::Release);
    }
}

impl RecordingTransport {
    fn requests(&self) -> Vec<Request> {
        self.posted
            .lock()
            .iter()
            .map(|frame| decode_request(frame).expect("client frames decode"))
            .collect()
    }
}

fn recording_client(
    config: ClientConfig,
) -> (WorkerClient, RecordingTransport, mpsc::UnboundedSender<String>) {
    let transport = RecordingTransport::default();
    let (frames, received) = mpsc::unbounded_channel();
    let client = WorkerClient::new(transport.clone(), received, config, |_| {});
    (client, transport, frames)
}

fn reply_frame(call_id: CallId, outcome: ReplyOutcome) -> String {
    encode_message(&WorkerMessage::Reply(Reply { call_id, outcome })).expect("encode reply")
}

fn echo(value: &str) -> TestProbe {
    TestProbe::Echo {
        value: value.to_string(),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn replies_are_matched_by_call_id() {
    let (client, transport, frames) = recording_client(ClientConfig::default());
    let first = tokio::spawn({
        let client = client.clone();
        async move { client.evaluate_for_test(echo("a")).await }
    });
    let second = tokio::spawn({
        let client = client.clone();
        async move { client.evaluate_for_test(echo("b")).await }
    });
    while transport.posted.lock().len() < 2 {
        tokio::task::yield_now().await;
    }

    let requests = transport.requests();
    assert_ne!(requests[0].call_id, requests[1].call_id);
    let id_of = |value: &str| {
        requests
            .iter()
            .find(|r| r.disposition == Disposition::EvaluateForTest { probe: echo(value) })
            .map(|r| r.call_id)
            .expect("request was posted")
    };

    let unknown = CallId::new(999).expect("non-zero id");
    frames
        .send(reply_frame(unknown, ReplyOutcome::Success(MethodResult::Done)))
        .expect("reader alive");
    frames
        .send(reply_frame(
            id_of("b"),
            ReplyOutcome::Success(MethodResult::Probe("B".into())),
        ))
        .expect("reader alive");
    frames
        .send(reply_frame(
            id_of("a"),
            ReplyOutcome::Success(MethodResult::Probe("A".into())),
        ))
        .expect("reader alive");

    assert_eq!(first.await.expect("join"), Ok(MethodResult::Probe("A".into())));
    assert_eq!(second.await.expect("join"), Ok(MethodResult::Probe("B".into())));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn factory_ids_are_allocated_eagerly() {
    let (client, transport, _frames) = recording_client(ClientConfig::default());
    let parent = ObjectId::new(1).expect("non-zero id");
    let a = client
        .call_factory(parent, FactoryMethod::CreateEdgesProvider { node_index: 0 })
        .expect("posted");
    let b = client
        .call_factory(parent, FactoryMethod::CreateEdgesProvider { node_index: 1 })
        .expect("posted");
    assert_ne!(a, b);

    let requests = transport.requests();
    let Disposition::Factory { new_object_id, .. } = &requests[1].disposition else {
        panic!("expected a factory request");
    };
    assert_eq!(*new_object_id, b);

    client.dispose_object(a).expect("posted");
    assert_eq!(
        transport.requests()[2].disposition,
        Disposition::Dispose { object_id: a }
    );
}

#[tokio::test(flavor = "current_thread")]
async fn remote_failures_are_abandoned_by_default() {
    let client = WorkerClient::spawn_thread("rpc-test", ClientConfig::default(), |_| {})
        .expect("worker starts");
    let result = client
        .evaluate_for_test(TestProbe::Fail {
            message: "boom".into(),
        })
        .await;
    assert_eq!(
        result,
        Err(RpcError::CallAbandoned {
            method: "evaluateForTest".into()
        })
    );
    assert_eq!(client.pending_calls(), 0);
    client.dispose();
}

#[tokio::test(flavor = "current_thread")]
async fn remote_failures_can_be_forwarded() {
    let config = ClientConfig {
        reject_remote_errors: true,
        ..ClientConfig::default()
    };
    let client = WorkerClient::spawn_thread("rpc-test", config, |_| {}).expect("worker starts");
    let result = client
        .evaluate_for_test(TestProbe::Fail {
            message: "boom".into(),
        })
        .await;
    let Err(RpcError::Remote {
        message,
        method,
        call_stack,
    }) = result
    else {
        panic!("expected a forwarded failure, got {result:?}");
    };
    assert!(message.contains("boom"));
    assert_eq!(method.as_deref(), Some("evaluateForTest"));
    assert!(call_stack.is_some_and(|stack| stack.starts_with("evaluateForTest")));
    client.dispose();
}

#[tokio::test(flavor = "current_thread")]
async fn dispose_fails_outstanding_calls() {
    let (client, transport, _frames) = recording_client(ClientConfig::default());
    let waiting = tokio::spawn({
        let client = client.clone();
        async move { client.evaluate_for_test(echo("never")).await }
    });
    while transport.posted.lock().is_empty() {
        tokio::task::yield_now().await;
    }

    client.dispose();
    client.dispose();
    assert_eq!(waiting.await.expect("join"), Err(RpcError::WorkerTerminated));
    assert!(transport.terminated.load(Ordering::Acquire));
    assert_eq!(
        client.evaluate_for_test(echo("late")).await,
        Err(RpcError::WorkerTerminated)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn slow_calls_raise_the_busy_flag() {
    let client = WorkerClient::spawn_thread("busy-test", ClientConfig::default(), |_| {})
        .expect("worker starts");
    client.start_checking_for_long_running_calls();
    client.start_checking_for_long_running_calls();
    let mut busy = client.subscribe_busy();

    // Issue the call halfway between two checks.
    tokio::time::sleep(Duration::from_millis(150)).await;
    let issued = Instant::now();
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.evaluate_for_test(TestProbe::Sleep { millis: 1000 }).await }
    });

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(!client.is_busy(), "busy too early");

    let deadline = Duration::from_millis(600).saturating_sub(issued.elapsed());
    tokio::time::timeout(deadline, busy.wait_for(|busy| *busy))
        .await
        .expect("busy within 600ms of the call")
        .expect("client alive");
    let raised = issued.elapsed();
    assert!(raised >= Duration::from_millis(300), "raised after {raised:?}");

    call.await.expect("join").expect("sleep probe succeeds");
    tokio::time::timeout(Duration::from_millis(300), busy.wait_for(|busy| !*busy))
        .await
        .expect("busy cleared within 300ms of the reply")
        .expect("client alive");
    client.dispose();
}

#[tokio::test(flavor = "current_thread")]
async fn events_reach_the_handler() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let transport = RecordingTransport::default();
    let (frames, received) = mpsc::unbounded_channel();
    let client = WorkerClient::new(transport, received, ClientConfig::default(), {
        let seen = seen.clone();
        move |event| seen.lock().push(event)
    });

    let broken = WorkerEvent::BrokenSnapshot {
        message: "bad meta".into(),
    };
    frames
        .send(encode_message(&WorkerMessage::Event(broken.clone())).expect("encode"))
        .expect("reader alive");
    frames.send("garbage".into()).expect("reader alive");
    while seen.lock().is_empty() {
        tokio::task::yield_now().await;
    }
    assert_eq!(*seen.lock(), [broken]);
    assert_eq!(client.take_broken_snapshot().as_deref(), Some("bad meta"));
}

#[tokio::test(flavor = "current_thread")]
async fn forwarded_failure_without_details_has_no_method() {
    let (client, transport, frames) = recording_client(ClientConfig {
        reject_remote_errors: true,
        ..ClientConfig::default()
    });
    let object_id = ObjectId::new(3).expect("non-zero id");
    let call = tokio::spawn({
        let client = client.clone();
        async move { client.call(object_id, Method::GetStatistics).await }
    });
    while transport.posted.lock().is_empty() {
        tokio::task::yield_now().await;
    }
    let call_id = transport.requests()[0].call_id;
    frames
        .send(reply_frame(
            call_id,
            ReplyOutcome::Error(RemoteError {
                error: "no such object".into(),
                error_method_name: None,
                error_call_stack: None,
            }),
        ))
        .expect("reader alive");
    let Err(RpcError::Remote { method, .. }) = call.await.expect("join") else {
        panic!("expected a forwarded failure");
    };
    assert_eq!(method, None);
}
