//! Actor, registry and session tests driven by an in-memory upstream.

use crate::config::CacheConfig;
use crate::error::{SessionError, StreamError};
use crate::registry::StreamRegistry;
use crate::session::ClientSession;
use crate::stream::{LineStream, StreamHandle, TcpUpstream, Upstream};
use crate::transport::LineConn;
use async_trait::async_trait;
use serde_json::{json, Value};
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_test::{assert_err, assert_ok};

const WAIT: Duration = Duration::from_secs(2);

type Feed = mpsc::UnboundedSender<io::Result<String>>;

/// Upstream whose connections are channels handed to the test.
struct FakeUpstream {
    connections: mpsc::UnboundedSender<(String, Feed)>,
    refuse: bool,
}

#[async_trait]
impl Upstream for FakeUpstream {
    async fn connect(&self, name: &str) -> Result<LineStream, StreamError> {
        if self.refuse {
            return Err(StreamError::Connect {
                address: "fake".to_string(),
                source: io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
            });
        }
        let (feed, lines) = mpsc::unbounded_channel();
        let _ = self.connections.send((name.to_string(), feed));
        Ok(Box::pin(UnboundedReceiverStream::new(lines)))
    }
}

fn fake_upstream(refuse: bool) -> (Arc<FakeUpstream>, mpsc::UnboundedReceiver<(String, Feed)>) {
    let (connections, opened) = mpsc::unbounded_channel();
    (Arc::new(FakeUpstream { connections, refuse }), opened)
}

fn spawn_stream(name: &str) -> (StreamHandle, mpsc::UnboundedReceiver<(String, Feed)>) {
    let (upstream, opened) = fake_upstream(false);
    (StreamHandle::spawn(name, upstream, &CacheConfig::default()), opened)
}

async fn next_feed(opened: &mut mpsc::UnboundedReceiver<(String, Feed)>) -> (String, Feed) {
    assert_ok!(timeout(WAIT, opened.recv()).await).expect("connection opened")
}

fn send(feed: &Feed, record: Value) {
    assert_ok!(feed.send(Ok(record.to_string())));
}

#[tokio::test]
async fn test_subscribers_share_one_connection() {
    let (stream, mut opened) = spawn_stream("ranger");
    let mut first = assert_ok!(stream.subscribe(8).await);
    let mut second = assert_ok!(stream.subscribe(8).await);
    assert_eq!((first.slot(), second.slot()), (0, 1));

    let (name, feed) = next_feed(&mut opened).await;
    assert_eq!(name, "ranger");
    assert!(opened.try_recv().is_err());

    for n in 1..=3 {
        send(&feed, json!({ "n": n }));
    }
    for subscription in [&mut first, &mut second] {
        for n in 1..=3 {
            let record = subscription.recv().await.unwrap();
            assert_eq!(record["n"], json!(n));
        }
    }

    let stats = assert_ok!(stream.stats().await);
    assert_eq!(stats.connections_opened, 1);
    assert_eq!(stats.delivered, 6);
    assert!(stats.streaming);
}

#[tokio::test]
async fn test_slow_subscriber_drops_without_stalling_others() {
    let (stream, mut opened) = spawn_stream("ranger");
    let mut fast = assert_ok!(stream.subscribe(16).await);
    let mut slow = assert_ok!(stream.subscribe(2).await);
    let (_, feed) = next_feed(&mut opened).await;

    for n in 1..=5 {
        send(&feed, json!({ "n": n }));
    }
    for n in 1..=5 {
        assert_eq!(fast.recv().await.unwrap()["n"], json!(n));
    }

    assert_eq!(slow.try_recv().unwrap()["n"], json!(1));
    assert_eq!(slow.try_recv().unwrap()["n"], json!(2));
    assert!(matches!(slow.try_recv(), Err(TryRecvError::Empty)));
    assert_eq!(assert_ok!(stream.stats().await).dropped, 3);

    // Once drained, the slow subscriber sees new records again.
    send(&feed, json!({ "n": 6 }));
    assert_eq!(fast.recv().await.unwrap()["n"], json!(6));
    assert_eq!(slow.recv().await.unwrap()["n"], json!(6));
}

#[tokio::test]
async fn test_connection_closes_on_next_record_without_subscribers() {
    let (stream, mut opened) = spawn_stream("ranger");
    let subscription = assert_ok!(stream.subscribe(4).await);
    let (_, feed) = next_feed(&mut opened).await;

    drop(subscription);
    let stats = assert_ok!(stream.stats().await);
    assert_eq!(stats.occupied, 0);
    assert!(stats.streaming, "unsubscribing alone keeps the upstream open");

    send(&feed, json!({ "n": 1 }));
    assert_ok!(timeout(WAIT, feed.closed()).await);
    assert!(!assert_ok!(stream.stats().await).streaming);

    // A new subscriber reconnects.
    let _again = assert_ok!(stream.subscribe(4).await);
    next_feed(&mut opened).await;
    assert_eq!(assert_ok!(stream.stats().await).connections_opened, 2);
}

#[tokio::test]
async fn test_record_without_subscribers_is_not_cached() {
    let (stream, mut opened) = spawn_stream("ranger");
    let subscription = assert_ok!(stream.subscribe(4).await);
    let (_, feed) = next_feed(&mut opened).await;

    drop(subscription);
    assert_eq!(assert_ok!(stream.stats().await).occupied, 0);

    send(&feed, json!({ "unique_request_id": "late", "n": 1 }));
    assert_ok!(timeout(WAIT, feed.closed()).await);
    assert!(assert_ok!(stream.lookup("late").await).is_none());
    assert_eq!(assert_ok!(stream.stats().await).delivered, 0);
}

#[tokio::test]
async fn test_vacated_slots_are_reused() {
    let (stream, _opened) = spawn_stream("ranger");
    let first = assert_ok!(stream.subscribe(4).await);
    let second = assert_ok!(stream.subscribe(4).await);
    assert_eq!(second.slot(), 1);

    drop(first);
    let third = assert_ok!(stream.subscribe(4).await);
    assert_eq!(third.slot(), 0);

    let stats = assert_ok!(stream.stats().await);
    assert_eq!(stats.slots, 2);
    assert_eq!(stats.occupied, 2);
}

#[tokio::test]
async fn test_subscribe_churn_never_grows_past_peak() {
    let (stream, _opened) = spawn_stream("ranger");
    let peak = 3;
    let mut held = Vec::new();
    for _ in 0..peak {
        held.push(assert_ok!(stream.subscribe(4).await));
    }

    for round in 0..20 {
        // Release one or two subscribers, then take their places again.
        let released = 1 + round % 2;
        for _ in 0..released {
            drop(held.remove(round % held.len()));
        }
        for _ in 0..released {
            let subscription = assert_ok!(stream.subscribe(4).await);
            assert!(subscription.slot() < peak);
            held.push(subscription);
        }

        let stats = assert_ok!(stream.stats().await);
        assert_eq!(stats.slots, peak);
        assert_eq!(stats.occupied, peak);
    }

    let mut slots: Vec<usize> = held.iter().map(|s| s.slot()).collect();
    slots.sort_unstable();
    assert_eq!(slots, vec![0, 1, 2]);
}

#[tokio::test]
async fn test_undecodable_and_blank_lines_are_skipped() {
    let (stream, mut opened) = spawn_stream("ranger");
    let mut subscription = assert_ok!(stream.subscribe(4).await);
    let (_, feed) = next_feed(&mut opened).await;

    assert_ok!(feed.send(Ok("{not json".to_string())));
    assert_ok!(feed.send(Ok("   ".to_string())));
    send(&feed, json!({ "n": 1 }));

    assert_eq!(subscription.recv().await.unwrap()["n"], json!(1));
    assert_eq!(assert_ok!(stream.stats().await).delivered, 1);
}

#[tokio::test]
async fn test_garbage_bytes_from_tcp_upstream_are_skipped() {
    let listener = assert_ok!(TcpListener::bind("127.0.0.1:0").await);
    let address = assert_ok!(listener.local_addr()).to_string();
    let (finished, done) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut feed = b"{\"n\":1}\n\xff\xfe\n".to_vec();
        feed.extend(std::iter::repeat(b'x').take(64 * 1024));
        feed.extend_from_slice(b"\n{\"n\":2}\n");
        socket.write_all(&feed).await.unwrap();
        // Keep the connection open until the test has read everything.
        let _ = done.await;
    });

    let upstream = Arc::new(TcpUpstream::new(address));
    let stream = StreamHandle::spawn("ranger", upstream, &CacheConfig::default());
    let mut subscription = assert_ok!(stream.subscribe(4).await);

    let first = assert_ok!(timeout(WAIT, subscription.recv()).await);
    assert_eq!(first.unwrap()["n"], json!(1));
    let second = assert_ok!(timeout(WAIT, subscription.recv()).await);
    assert_eq!(second.unwrap()["n"], json!(2));
    assert!(assert_ok!(stream.stats().await).streaming);

    let _ = finished.send(());
}

#[tokio::test]
async fn test_upstream_end_releases_subscribers() {
    let (stream, mut opened) = spawn_stream("ranger");
    let mut first = assert_ok!(stream.subscribe(4).await);
    let mut second = assert_ok!(stream.subscribe(4).await);
    let (_, feed) = next_feed(&mut opened).await;

    drop(feed);
    assert!(assert_ok!(timeout(WAIT, first.recv()).await).is_none());
    assert!(assert_ok!(timeout(WAIT, second.recv()).await).is_none());

    let stats = assert_ok!(stream.stats().await);
    assert_eq!(stats.occupied, 0);
    assert!(!stats.streaming);

    // Stale unsubscribes from the released sessions must not clear new slots.
    let mut fresh = assert_ok!(stream.subscribe(4).await);
    drop(first);
    drop(second);
    let (_, feed) = next_feed(&mut opened).await;
    send(&feed, json!({ "n": 1 }));
    assert_eq!(fresh.recv().await.unwrap()["n"], json!(1));
    assert_eq!(assert_ok!(stream.stats().await).occupied, 1);
}

#[tokio::test]
async fn test_upstream_read_error_releases_subscribers() {
    let (stream, mut opened) = spawn_stream("ranger");
    let mut subscription = assert_ok!(stream.subscribe(4).await);
    let (_, feed) = next_feed(&mut opened).await;

    assert_ok!(feed.send(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))));
    assert!(assert_ok!(timeout(WAIT, subscription.recv()).await).is_none());
}

#[tokio::test]
async fn test_connect_failure_is_reported() {
    let (upstream, _opened) = fake_upstream(true);
    let stream = StreamHandle::spawn("ranger", upstream, &CacheConfig::default());

    let result = stream.subscribe(4).await;
    assert!(matches!(result, Err(StreamError::Connect { .. })));

    let stats = assert_ok!(stream.stats().await);
    assert_eq!(stats.occupied, 0);
    assert!(!stats.streaming);
}

#[tokio::test]
async fn test_lookup_recent_record() {
    let (stream, mut opened) = spawn_stream("ranger");
    let mut subscription = assert_ok!(stream.subscribe(4).await);
    let (_, feed) = next_feed(&mut opened).await;

    send(&feed, json!({ "unique_request_id": "abc", "n": 1 }));
    subscription.recv().await.unwrap();

    let found = assert_ok!(stream.lookup("abc").await).unwrap();
    assert_eq!(found["n"], json!(1));
    assert!(assert_ok!(stream.lookup("missing").await).is_none());
}

#[tokio::test]
async fn test_registry_returns_one_actor_per_name() {
    let (upstream, mut opened) = fake_upstream(false);
    let registry = StreamRegistry::spawn(upstream, CacheConfig::default());

    let first = assert_ok!(registry.locate("ranger").await);
    let second = assert_ok!(registry.locate("ranger").await);
    assert_eq!(second.name(), "ranger");
    let _subscription = assert_ok!(first.subscribe(4).await);
    assert_eq!(assert_ok!(second.stats().await).occupied, 1);

    assert_ok!(registry.locate("access").await);
    assert_eq!(
        assert_ok!(registry.names().await),
        vec!["access".to_string(), "ranger".to_string()]
    );

    next_feed(&mut opened).await;
    assert!(opened.try_recv().is_err());
}

struct Client {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl Client {
    async fn send(&mut self, value: Value) {
        let line = format!("{}\n", value);
        assert_ok!(self.writer.write_all(line.as_bytes()).await);
    }

    async fn next(&mut self) -> Value {
        let line = assert_ok!(timeout(WAIT, self.lines.next_line()).await);
        serde_json::from_str(&assert_ok!(line).expect("output line")).unwrap()
    }
}

fn start_session(registry: &StreamRegistry) -> (Client, JoinHandle<Result<(), SessionError>>) {
    let (client, server) = duplex(16 * 1024);
    let (server_read, server_write) = split(server);
    let session = ClientSession::new(LineConn::new(server_read, server_write), registry.clone(), 16);
    let task = tokio::spawn(session.run());

    let (client_read, writer) = split(client);
    let client = Client {
        lines: BufReader::new(client_read).lines(),
        writer,
    };
    (client, task)
}

async fn finish(task: JoinHandle<Result<(), SessionError>>) -> Result<(), SessionError> {
    assert_ok!(assert_ok!(timeout(WAIT, task).await))
}

#[tokio::test]
async fn test_session_filters_and_projects_records() {
    let (upstream, mut opened) = fake_upstream(false);
    let registry = StreamRegistry::spawn(upstream, CacheConfig::default());
    let (mut client, task) = start_session(&registry);

    client
        .send(json!({
            "logName": "ranger",
            "fields": ["n", "Add(n,1)", "RollingWindow(n,2)", "WindowSum(RollingWindow(n,2))", "Nope(n)"],
            "filters": ["Greater(n,1)"]
        }))
        .await;
    let (name, feed) = next_feed(&mut opened).await;
    assert_eq!(name, "ranger");

    for n in 1..=3 {
        send(&feed, json!({ "n": n }));
    }
    assert_eq!(
        client.next().await,
        json!([["n", 2], ["Add(n,1)", 3], ["RollingWindow(n,2)", 2], ["WindowSum(RollingWindow(n,2))", 2.0]])
    );
    assert_eq!(
        client.next().await,
        json!([["n", 3], ["Add(n,1)", 4], ["RollingWindow(n,2)", 3], ["WindowSum(RollingWindow(n,2))", 5.0]])
    );

    // Messages after the query are ignored.
    client.send(json!({ "logName": "other" })).await;
    send(&feed, json!({ "n": 4 }));
    assert_eq!(client.next().await[0], json!(["n", 4]));

    assert_ok!(client.writer.shutdown().await);
    assert_ok!(finish(task).await);

    let stream = assert_ok!(registry.locate("ranger").await);
    assert_eq!(assert_ok!(stream.stats().await).occupied, 0);
}

#[tokio::test]
async fn test_session_rejects_invalid_query() {
    let (upstream, _opened) = fake_upstream(false);
    let registry = StreamRegistry::spawn(upstream, CacheConfig::default());

    let (mut client, task) = start_session(&registry);
    client.send(json!({ "fields": ["n"] })).await;
    assert!(matches!(finish(task).await, Err(SessionError::InvalidQuery(_))));

    let (mut client, task) = start_session(&registry);
    assert_ok!(client.writer.write_all(b"{not json\n").await);
    assert!(matches!(finish(task).await, Err(SessionError::InvalidQuery(_))));

    assert!(assert_ok!(registry.names().await).is_empty());
}

#[tokio::test]
async fn test_session_ends_on_filter_error() {
    let (upstream, mut opened) = fake_upstream(false);
    let registry = StreamRegistry::spawn(upstream, CacheConfig::default());
    let (mut client, task) = start_session(&registry);

    client
        .send(json!({ "logName": "ranger", "fields": ["n"], "filters": ["Greater(missing,1)"] }))
        .await;
    let (_, feed) = next_feed(&mut opened).await;
    send(&feed, json!({ "n": 1 }));

    let result = finish(task).await;
    assert_err!(&result);
    assert!(matches!(result, Err(SessionError::Filter { .. })));
}

#[tokio::test]
async fn test_session_ends_when_upstream_closes() {
    let (upstream, mut opened) = fake_upstream(false);
    let registry = StreamRegistry::spawn(upstream, CacheConfig::default());
    let (mut client, task) = start_session(&registry);

    client.send(json!({ "logName": "ranger", "fields": ["n"] })).await;
    let (_, feed) = next_feed(&mut opened).await;
    send(&feed, json!({ "n": 1 }));
    assert_eq!(client.next().await, json!([["n", 1]]));

    drop(feed);
    assert_ok!(finish(task).await);
}

#[tokio::test]
async fn test_session_reports_unreachable_upstream() {
    let (upstream, _opened) = fake_upstream(true);
    let registry = StreamRegistry::spawn(upstream, CacheConfig::default());
    let (mut client, task) = start_session(&registry);

    client.send(json!({ "logName": "ranger" })).await;
    assert!(matches!(
        finish(task).await,
        Err(SessionError::Stream(StreamError::Connect { .. }))
    ));
}
