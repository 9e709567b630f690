use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use heapsight_types::{NodeFilter, ProviderItem, SortField};
use heapsight_wire::{Disposition, Method, decode_request};
use heapsight_worker::testing::SnapshotBuilder;
use tokio::io::ReadBuf;

use super::*;
use crate::config::ClientConfig;
use crate::transport::{ThreadWorker, WorkerTransport};

fn uid(value: u64) -> ProfileUid {
    ProfileUid::new(value).expect("non-zero uid")
}

fn worker(chunk_size: usize) -> WorkerClient {
    let config = ClientConfig {
        chunk_size,
        ..ClientConfig::default()
    };
    WorkerClient::spawn_thread("proxy-test", config, |_| {}).expect("worker starts")
}

fn three_classes() -> SnapshotBuilder {
    let mut builder = SnapshotBuilder::new();
    for (name, count, size) in [("Foo", 10, 10), ("Bär", 5, 10), ("Baz", 1, 5)] {
        for i in 0..count {
            let node = builder.object(name, size);
            builder.property(SnapshotBuilder::ROOT, node, &format!("{name}{i}"));
        }
    }
    builder
}

async fn load(client: &WorkerClient, builder: &SnapshotBuilder, profile: u64) -> SnapshotProxy {
    let json = builder.to_json();
    load_snapshot_from_reader(client, "memory", json.as_bytes(), uid(profile))
        .await
        .expect("snapshot loads")
}

struct FailingReader;

impl AsyncRead for FailingReader {
    fn poll_read(self: Pin<&mut Self>, _cx: &mut Context<'_>, _buf: &mut ReadBuf<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Err(io::Error::other("disk gone")))
    }
}

#[tokio::test(flavor = "current_thread")]
async fn small_chunks_keep_multibyte_names_intact() {
    // 7-byte chunks split "Bär" somewhere in most layouts.
    let client = worker(7);
    let snapshot = load(&client, &three_classes(), 1).await;
    assert_eq!(snapshot.node_count(), 17);
    assert_eq!(snapshot.total_size(), 155);

    let aggregates = snapshot
        .aggregates_with_filter(NodeFilter::everything())
        .await
        .expect("aggregates");
    let summary: Vec<(&str, u32, u64)> = aggregates
        .values()
        .map(|a| (a.name.as_str(), a.count, a.shallow_size))
        .collect();
    assert_eq!(summary, [("Baz", 1, 5), ("Bär", 5, 50), ("Foo", 10, 100)]);

    snapshot.dispose();
    client.dispose();
}

#[test]
fn invalid_bytes_do_not_hold_back_the_stream() {
    let mut stream = vec![0xFF];
    stream.extend_from_slice("abcdefghi ä".as_bytes());
    let mut carry = Vec::new();
    let mut sent = Vec::new();
    for read in stream.chunks(4) {
        carry.extend_from_slice(read);
        sent.extend(take_text(&mut carry));
        assert!(carry.len() <= 3);
    }
    assert!(carry.is_empty());
    assert_eq!(sent, ["\u{FFFD}abc", "defg", "hi ", "ä"]);

    let mut truncated = "ä".as_bytes()[..1].to_vec();
    assert_eq!(take_text(&mut truncated), None);
    assert_eq!(truncated.len(), 1);
}

struct TappedWorker {
    inner: ThreadWorker,
    writes: std::sync::Arc<Mutex<usize>>,
}

impl WorkerTransport for TappedWorker {
    fn post_message(&self, frame: String) -> Result<(), RpcError> {
        if let Ok(request) = decode_request(&frame)
            && let Disposition::Method {
                method: Method::Write { .. },
                ..
            } = request.disposition
        {
            *self.writes.lock() += 1;
        }
        self.inner.post_message(frame)
    }

    fn terminate(&self) {
        self.inner.terminate();
    }
}

#[tokio::test(flavor = "current_thread")]
async fn invalid_utf8_still_streams_every_chunk() {
    let (inner, frames) = ThreadWorker::spawn("tapped").expect("worker starts");
    let writes = std::sync::Arc::new(Mutex::new(0));
    let config = ClientConfig {
        chunk_size: 16,
        ..ClientConfig::default()
    };
    let transport = TappedWorker {
        inner,
        writes: writes.clone(),
    };
    let client = WorkerClient::new(transport, frames, config, |_| {});

    let json = three_classes().to_json().replacen("\"Baz\"", "\"Ba\u{1}z\"", 1);
    let mut bytes = json.into_bytes();
    let marker = bytes.iter().position(|&b| b == 1).expect("marker present");
    bytes[marker] = 0xFF;

    let snapshot = load_snapshot_from_reader(&client, "memory", bytes.as_slice(), uid(1))
        .await
        .expect("snapshot loads");
    assert_eq!(*writes.lock(), bytes.len().div_ceil(16));

    let aggregates = snapshot
        .aggregates_with_filter(NodeFilter::everything())
        .await
        .expect("aggregates");
    assert_eq!(aggregates.get("Ba\u{FFFD}z").map(|a| a.count), Some(1));

    snapshot.dispose();
    client.dispose();
}

#[tokio::test(flavor = "current_thread")]
async fn unparseable_payload_is_a_broken_snapshot() {
    let client = worker(1024);
    let result = load_snapshot_from_reader(&client, "memory", &b"{\"snapshot\": 12"[..], uid(1)).await;
    let Err(LoadError::BrokenSnapshot(message)) = result else {
        panic!("expected a broken snapshot");
    };
    assert!(!message.is_empty());
    client.dispose();
}

#[tokio::test(flavor = "current_thread")]
async fn read_failures_never_reach_the_worker() {
    let client = worker(1024);
    let result = load_snapshot_from_reader(&client, "dump.heapsnapshot", FailingReader, uid(1)).await;
    let Err(LoadError::FileRead { path, message }) = result else {
        panic!("expected a read failure");
    };
    assert_eq!(path, "dump.heapsnapshot");
    assert!(message.contains("disk gone"));

    let missing = load_snapshot_from_file(&client, Path::new("/nonexistent/x.heapsnapshot"), uid(2)).await;
    assert!(matches!(missing, Err(LoadError::FileRead { .. })));
    client.dispose();
}

#[tokio::test(flavor = "current_thread")]
async fn diff_reports_added_and_removed_instances() {
    let client = worker(4096);
    let mut base = SnapshotBuilder::new();
    for (name, id) in [("Foo", 11), ("Foo", 13), ("Bar", 21), ("Bar", 23)] {
        let node = base.object_with_id(name, 8, id);
        base.property(SnapshotBuilder::ROOT, node, "x");
    }
    let mut current = SnapshotBuilder::new();
    for (name, id) in [("Foo", 11), ("Foo", 13), ("Foo", 15), ("Foo", 17), ("Bar", 21)] {
        let node = current.object_with_id(name, 8, id);
        current.property(SnapshotBuilder::ROOT, node, "x");
    }
    let base = load(&client, &base, 1).await;
    let current = load(&client, &current, 2).await;

    let digest = base.aggregates_for_diff().await.expect("digest");
    let diffs = current
        .calculate_snapshot_diff(base.uid(), digest)
        .await
        .expect("diff");
    let foo = diffs.iter().find(|d| d.name == "Foo").expect("Foo diff");
    let bar = diffs.iter().find(|d| d.name == "Bar").expect("Bar diff");
    assert_eq!((foo.added_count, foo.count_delta), (2, 2));
    assert_eq!((bar.removed_count, bar.size_delta), (1, -8));

    let added = current
        .create_added_nodes_provider(base.uid(), "Foo")
        .expect("provider");
    added
        .sort_and_rewind(ComparatorConfig::single(SortField::Id, true))
        .await
        .expect("sort");
    let range = added.serialize_items_range(0, 10).await.expect("range");
    let ids: Vec<u64> = range.items.iter().map(|item| item.node().id).collect();
    assert_eq!(ids, [15, 17]);

    let deleted = base
        .create_deleted_nodes_provider(bar.deleted_indexes.clone())
        .expect("provider");
    assert!(!deleted.is_empty().await.expect("is_empty"));
    let range = deleted.serialize_items_range(0, 10).await.expect("range");
    assert_eq!(range.items[0].node().id, 23);

    added.dispose();
    deleted.dispose();
    base.dispose();
    current.dispose();
    client.dispose();
}

#[tokio::test(flavor = "current_thread")]
async fn edge_providers_page_through_children() {
    let client = worker(4096);
    let snapshot = load(&client, &three_classes(), 1).await;
    let edges = snapshot
        .create_edges_provider(snapshot.root_node_index())
        .expect("provider");
    edges
        .sort_and_rewind(ComparatorConfig::new(SortField::ShallowSize, true, SortField::EdgeName, true))
        .await
        .expect("sort");

    let first = edges.serialize_items_range(0, 4).await.expect("range");
    assert_eq!((first.start_position, first.end_position, first.total_length), (0, 4, 16));
    let ProviderItem::Edge(edge) = &first.items[0] else {
        panic!("edge providers serialize edges");
    };
    assert_eq!(edge.name, "Baz0");
    assert_eq!(edge.node.shallow_size, 5);

    let rest = edges.serialize_items_range(4, 100).await.expect("range");
    assert_eq!(rest.items.len(), 12);
    assert!(rest.is_complete());

    assert_eq!(edges.node_position(edge.node.id).await.expect("position"), Some(0));
    assert_eq!(edges.node_position(999_999).await.expect("position"), None);

    edges.dispose();
    snapshot.dispose();
    client.dispose();
}

#[tokio::test(flavor = "current_thread")]
async fn static_data_defaults_to_zero_until_fetched() {
    let client = worker(4096);
    let snapshot = load(&client, &three_classes(), 1).await;
    let detached = SnapshotProxy::new(client.clone(), snapshot.object().object_id(), uid(9));
    assert_eq!(detached.node_count(), 0);
    assert_eq!(detached.max_js_object_id(), 0);
    assert_eq!(detached.uid(), uid(9));
    detached.set_profile_uid(uid(10));
    assert_eq!(detached.uid(), uid(10));

    let data = detached.update_static_data().await.expect("static data");
    assert_eq!(data, snapshot.static_data().expect("fetched while loading"));
    assert!(detached.same_object(&snapshot));

    // Both handles name the same worker object; one dispose is enough.
    detached.object().disposed.store(true, Ordering::Release);
    snapshot.dispose();
    client.dispose();
}

#[derive(Clone, Default)]
struct CountingTransport {
    posted: std::sync::Arc<Mutex<Vec<String>>>,
}

impl WorkerTransport for CountingTransport {
    fn post_message(&self, frame: String) -> Result<(), RpcError> {
        self.posted.lock().push(frame);
        Ok(())
    }

    fn terminate(&self) {}
}

#[tokio::test(flavor = "current_thread")]
async fn dispose_is_sent_once() {
    let transport = CountingTransport::default();
    let (_frames, received) = tokio::sync::mpsc::unbounded_channel();
    let client = WorkerClient::new(transport.clone(), received, ClientConfig::default(), |_| {});
    let object_id = ObjectId::new(5).expect("non-zero id");
    let proxy = ProxyObject::new(client.clone(), object_id);
    proxy.dispose();
    proxy.dispose();
    assert!(proxy.is_disposed());

    let disposes = transport
        .posted
        .lock()
        .iter()
        .filter(|frame| {
            matches!(
                decode_request(frame).map(|request| request.disposition),
                Ok(Disposition::Dispose { object_id: id }) if id == object_id
            )
        })
        .count();
    assert_eq!(disposes, 1);

    let other_client = WorkerClient::new(
        CountingTransport::default(),
        tokio::sync::mpsc::unbounded_channel().1,
        ClientConfig::default(),
        |_| {},
    );
    let same_id_elsewhere = ProxyObject::new(other_client.clone(), object_id);
    assert!(!proxy.same_object(&same_id_elsewhere));
    same_id_elsewhere.dispose();
    client.dispose();
    other_client.dispose();
}
