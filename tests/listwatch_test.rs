// ABOUTME: Integration tests for the list/watch change source
// ABOUTME: Covers initial listing, resync after watch loss and list retry exhaustion

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::{stream, FutureExt, StreamExt};
use tokio::sync::mpsc;

use statedb_reflector::source::{ListWatchSource, ListerWatcher, WatchEvent, WatchStream};
use statedb_reflector::{
    register_reflector, ChangeEvent, ChangeSource, EventSink, JobGroup, ObjectMeta,
    ReflectorConfig, Table, TableRow,
};

#[derive(Debug, Clone, PartialEq)]
struct Node {
    name: String,
    zone: &'static str,
}

impl ObjectMeta for Node {
    fn name(&self) -> Option<&str> {
        Some(&self.name)
    }
}

impl TableRow for Node {
    type Key = String;

    fn primary_key(&self) -> String {
        self.name.clone()
    }
}

fn node(name: &str, zone: &'static str) -> Node {
    Node {
        name: name.to_string(),
        zone,
    }
}

/// Scripted listings and watch streams. Once the watch script runs out,
/// streams stay open without producing anything. Once the list script runs
/// out, every list call fails.
#[derive(Default)]
struct Script {
    lists: Mutex<VecDeque<Result<Vec<Node>>>>,
    watches: Mutex<VecDeque<Vec<Result<WatchEvent<Node>>>>>,
    list_calls: AtomicUsize,
}

impl Script {
    fn list_ok(self, nodes: Vec<Node>) -> Self {
        self.lists.lock().unwrap().push_back(Ok(nodes));
        self
    }

    fn list_err(self, message: &'static str) -> Self {
        self.lists.lock().unwrap().push_back(Err(anyhow!(message)));
        self
    }

    fn watch(self, events: Vec<Result<WatchEvent<Node>>>) -> Self {
        self.watches.lock().unwrap().push_back(events);
        self
    }

    fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

struct FakeLw(Arc<Script>);

impl ListerWatcher for FakeLw {
    type Object = Node;

    fn list(&self) -> BoxFuture<'_, Result<Vec<Node>>> {
        self.0.list_calls.fetch_add(1, Ordering::SeqCst);
        let next = self.0.lists.lock().unwrap().pop_front();
        async move { next.unwrap_or_else(|| Err(anyhow!("api server unavailable"))) }.boxed()
    }

    fn watch(&self) -> BoxFuture<'_, Result<WatchStream<Node>>> {
        let next = self.0.watches.lock().unwrap().pop_front();
        async move {
            Ok(match next {
                Some(events) => stream::iter(events).boxed(),
                None => stream::pending().boxed(),
            })
        }
        .boxed()
    }
}

fn scripted(script: Script) -> (ListWatchSource<FakeLw>, Arc<Script>) {
    let script = Arc::new(script);
    let source = ListWatchSource::new(FakeLw(Arc::clone(&script)))
        .with_backoff(Duration::from_millis(10), Duration::from_millis(40));
    (source, script)
}

fn spawn(
    source: ListWatchSource<FakeLw>,
) -> (
    tokio::task::JoinHandle<Result<()>>,
    mpsc::Receiver<ChangeEvent<Node>>,
) {
    let (tx, rx) = mpsc::channel(16);
    let task = tokio::spawn(Box::new(source).run(EventSink::new(tx)));
    (task, rx)
}

async fn next_event(rx: &mut mpsc::Receiver<ChangeEvent<Node>>) -> ChangeEvent<Node> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("source stopped")
}

#[tokio::test(start_paused = true)]
async fn test_initial_listing_then_watch_events() {
    let (source, _script) = scripted(
        Script::default()
            .list_ok(vec![node("a", "z1")])
            .watch(vec![
                Ok(WatchEvent::Added(node("b", "z1"))),
                Ok(WatchEvent::Modified(node("a", "z2"))),
                Ok(WatchEvent::Deleted(node("b", "z1"))),
            ]),
    );
    let (task, mut rx) = spawn(source);

    assert_eq!(
        next_event(&mut rx).await,
        ChangeEvent::Replace(vec![node("a", "z1")])
    );
    assert_eq!(next_event(&mut rx).await, ChangeEvent::Add(node("b", "z1")));
    assert_eq!(
        next_event(&mut rx).await,
        ChangeEvent::Update(node("a", "z2"))
    );
    assert_eq!(
        next_event(&mut rx).await,
        ChangeEvent::Delete(node("b", "z1"))
    );
    task.abort();
}

#[tokio::test(start_paused = true)]
async fn test_empty_listing_is_empty_replace() {
    let (source, _script) = scripted(Script::default().list_ok(vec![]));
    let (task, mut rx) = spawn(source);
    assert_eq!(next_event(&mut rx).await, ChangeEvent::Replace(vec![]));
    task.abort();
}

#[tokio::test(start_paused = true)]
async fn test_relists_when_watch_ends() {
    let (source, script) = scripted(
        Script::default()
            .list_ok(vec![node("a", "z1")])
            .list_ok(vec![node("b", "z1")])
            .watch(vec![Ok(WatchEvent::Added(node("c", "z1")))]),
    );
    let (task, mut rx) = spawn(source);

    assert_eq!(
        next_event(&mut rx).await,
        ChangeEvent::Replace(vec![node("a", "z1")])
    );
    assert_eq!(next_event(&mut rx).await, ChangeEvent::Add(node("c", "z1")));
    assert_eq!(
        next_event(&mut rx).await,
        ChangeEvent::Replace(vec![node("b", "z1")])
    );
    assert_eq!(script.list_calls(), 2);
    task.abort();
}

#[tokio::test(start_paused = true)]
async fn test_relists_when_watch_fails() {
    let (source, _script) = scripted(
        Script::default()
            .list_ok(vec![node("a", "z1")])
            .list_ok(vec![node("a", "z1"), node("c", "z1")])
            .watch(vec![
                Ok(WatchEvent::Added(node("b", "z1"))),
                Err(anyhow!("resource version too old")),
                Ok(WatchEvent::Added(node("never", "z1"))),
            ]),
    );
    let (task, mut rx) = spawn(source);

    assert!(matches!(next_event(&mut rx).await, ChangeEvent::Replace(_)));
    assert_eq!(next_event(&mut rx).await, ChangeEvent::Add(node("b", "z1")));
    assert_eq!(
        next_event(&mut rx).await,
        ChangeEvent::Replace(vec![node("a", "z1"), node("c", "z1")])
    );
    task.abort();
}

#[tokio::test(start_paused = true)]
async fn test_transient_list_failure_is_retried() {
    let (source, script) = scripted(
        Script::default()
            .list_err("connection refused")
            .list_ok(vec![node("a", "z1")]),
    );
    let (task, mut rx) = spawn(source);

    assert_eq!(
        next_event(&mut rx).await,
        ChangeEvent::Replace(vec![node("a", "z1")])
    );
    assert_eq!(script.list_calls(), 2);
    task.abort();
}

#[tokio::test(start_paused = true)]
async fn test_gives_up_after_retry_budget() {
    let (source, script) = scripted(Script::default());
    let (task, mut rx) = spawn(source.with_max_list_retries(2));

    let err = task.await.unwrap().unwrap_err();
    assert!(format!("{err:#}").contains("giving up after 3 list attempts"));
    assert!(format!("{err:#}").contains("api server unavailable"));
    assert_eq!(script.list_calls(), 3);
    assert!(rx.recv().await.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_stops_when_sink_closes() {
    let (source, _script) = scripted(Script::default().list_ok(vec![node("a", "z1")]));
    let (tx, rx) = mpsc::channel(1);
    drop(rx);

    let result = Box::new(source).run(EventSink::new(tx)).await;
    assert!(result.is_ok());
}

/// Lists succeed with nothing; every watch closes straight away.
struct ClosingWatch(Arc<AtomicUsize>);

impl ListerWatcher for ClosingWatch {
    type Object = Node;

    fn list(&self) -> BoxFuture<'_, Result<Vec<Node>>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        async { Ok(vec![]) }.boxed()
    }

    fn watch(&self) -> BoxFuture<'_, Result<WatchStream<Node>>> {
        async { Ok(stream::empty().boxed()) }.boxed()
    }
}

#[tokio::test(start_paused = true)]
async fn test_relist_backs_off_when_watch_keeps_closing() {
    let list_calls = Arc::new(AtomicUsize::new(0));
    let source = ListWatchSource::new(ClosingWatch(Arc::clone(&list_calls)))
        .with_backoff(Duration::from_millis(10), Duration::from_millis(40));
    let (tx, mut rx) = mpsc::channel(16);
    let task = tokio::spawn(Box::new(source).run(EventSink::new(tx)));
    let drain = tokio::spawn(async move {
        let mut replaces = 0usize;
        while let Some(event) = rx.recv().await {
            assert_eq!(event, ChangeEvent::Replace(vec![]));
            replaces += 1;
        }
        replaces
    });

    // Delays of 10, 20 and 40ms, then 40ms per relist.
    tokio::time::sleep(Duration::from_secs(1)).await;
    let calls = list_calls.load(Ordering::SeqCst);
    assert!(calls >= 2, "source never relisted");
    assert!(calls <= 30, "relisted {calls} times in one second");

    task.abort();
    let replaces = drain.await.unwrap();
    assert!(replaces <= calls);
}

#[tokio::test(start_paused = true)]
async fn test_resync_through_reflector_removes_stale_rows() {
    let (source, _script) = scripted(
        Script::default()
            .list_ok(vec![node("a", "z1"), node("b", "z1")])
            .list_ok(vec![node("b", "z2")])
            .watch(vec![Ok(WatchEvent::Added(node("c", "z1")))]),
    );
    let table: Arc<Table<Node>> = Arc::new(Table::new("nodes"));
    let mut jobs = JobGroup::new();
    register_reflector(
        &mut jobs,
        Arc::clone(&table),
        ReflectorConfig::new().with_source(source),
    )
    .unwrap();

    tokio::time::timeout(Duration::from_secs(1), table.wait_initialized())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    let rows: Vec<_> = table.read().iter().cloned().collect();
    assert_eq!(rows, vec![node("b", "z2")]);

    let results = jobs.shutdown().await;
    assert!(results.iter().all(|job| job.result.is_ok()));
}
