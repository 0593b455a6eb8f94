// ABOUTME: SQLite table change source built on sqlite-watcher
// ABOUTME: Lists full table snapshots and diffs them whenever the WAL grows

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::{stream, FutureExt, StreamExt};
use serde::Serialize;
use serde_json::{Map, Value};
use sqlite_watcher::{
    diff_snapshots, start_wal_watcher, ChangeOperation, RowChange, SnapshotReader,
    TableSnapshot, WalEvent, WalWatcherConfig, WalWatcherHandle,
};
use tokio::sync::mpsc;

use super::listwatch::{ListWatchSource, ListerWatcher, WatchEvent, WatchStream};
use crate::meta::ObjectMeta;
use crate::table::TableRow;

/// One row of a watched SQLite table. The table name acts as the namespace
/// and the stringified key column as the name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SqliteRow {
    pub table: String,
    pub key: String,
    pub columns: Map<String, Value>,
}

impl ObjectMeta for SqliteRow {
    fn name(&self) -> Option<&str> {
        Some(&self.key)
    }

    fn namespace(&self) -> Option<&str> {
        Some(&self.table)
    }
}

impl TableRow for SqliteRow {
    type Key = (String, String);

    fn primary_key(&self) -> Self::Key {
        (self.table.clone(), self.key.clone())
    }
}

#[derive(Debug, Clone)]
pub struct SqliteSourceConfig {
    pub db_path: PathBuf,
    pub table_name: String,
    /// Column whose value identifies a row. `rowid` works for any rowid table.
    pub key_column: String,
    /// How often the WAL file size is polled.
    pub poll_interval: Duration,
    /// Upper bound between two snapshot diffs even when the WAL did not grow.
    /// Catches writes that reuse WAL space after a passive checkpoint.
    pub rescan_interval: Duration,
}

impl SqliteSourceConfig {
    pub fn new(db_path: impl Into<PathBuf>, table_name: impl Into<String>) -> Self {
        Self {
            db_path: db_path.into(),
            table_name: table_name.into(),
            key_column: "rowid".to_string(),
            poll_interval: Duration::from_millis(500),
            rescan_interval: Duration::from_secs(5),
        }
    }
}

struct SnapshotState {
    reader: SnapshotReader,
    last: TableSnapshot,
}

/// [`ListerWatcher`] over a single SQLite table.
pub struct SqliteTableSource {
    config: SqliteSourceConfig,
    state: Arc<Mutex<SnapshotState>>,
}

impl SqliteTableSource {
    /// Opens the database and checks that the table exists.
    pub fn open(config: SqliteSourceConfig) -> Result<Self> {
        let reader = SnapshotReader::open(&config.db_path, &config.table_name, &config.key_column)?;
        Ok(Self {
            config,
            state: Arc::new(Mutex::new(SnapshotState {
                reader,
                last: TableSnapshot::default(),
            })),
        })
    }

    /// Wraps the source in a [`ListWatchSource`] ready for registration.
    pub fn into_change_source(self) -> ListWatchSource<Self> {
        ListWatchSource::new(self)
    }

    pub fn table_name(&self) -> &str {
        &self.config.table_name
    }
}

impl ListerWatcher for SqliteTableSource {
    type Object = SqliteRow;

    fn list(&self) -> BoxFuture<'_, Result<Vec<SqliteRow>>> {
        let state = Arc::clone(&self.state);
        async move {
            let snapshot = blocking(move || {
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                let snapshot = state.reader.read()?;
                state.last = snapshot.clone();
                Ok(snapshot)
            })
            .await?;

            let table = snapshot.table_name;
            Ok(snapshot
                .rows
                .into_iter()
                .map(|(key, columns)| SqliteRow {
                    table: table.clone(),
                    key,
                    columns,
                })
                .collect())
        }
        .boxed()
    }

    fn watch(&self) -> BoxFuture<'_, Result<WatchStream<SqliteRow>>> {
        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        async move {
            let (tx, rx) = mpsc::channel(64);
            let handle = start_wal_watcher(
                &config.db_path,
                WalWatcherConfig {
                    poll_interval: config.poll_interval,
                    min_event_bytes: 1,
                },
                tx,
            )?;
            let mut rescan = tokio::time::interval(config.rescan_interval);
            rescan.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            rescan.reset();

            let watch = WalWatch {
                rx,
                rescan,
                pending: VecDeque::new(),
                state,
                _guard: WatcherGuard(Some(handle)),
            };
            Ok(stream::unfold(watch, next_watch_event).boxed())
        }
        .boxed()
    }
}

struct WalWatch {
    rx: mpsc::Receiver<WalEvent>,
    rescan: tokio::time::Interval,
    pending: VecDeque<RowChange>,
    state: Arc<Mutex<SnapshotState>>,
    _guard: WatcherGuard,
}

/// Stops the WAL polling thread off the async executor.
struct WatcherGuard(Option<WalWatcherHandle>);

impl Drop for WatcherGuard {
    fn drop(&mut self) {
        if let Some(mut handle) = self.0.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    runtime.spawn_blocking(move || handle.stop());
                }
                Err(_) => handle.stop(),
            }
        }
    }
}

async fn next_watch_event(
    mut watch: WalWatch,
) -> Option<(Result<WatchEvent<SqliteRow>>, WalWatch)> {
    loop {
        if let Some(change) = watch.pending.pop_front() {
            return Some((Ok(to_watch_event(change)), watch));
        }

        tokio::select! {
            event = watch.rx.recv() => match event {
                Some(WalEvent::Grew { .. }) => {}
                Some(WalEvent::Truncated { previous_size, .. }) => {
                    tracing::debug!(previous_size, "wal truncated; ending watch");
                    return None;
                }
                None => {
                    return Some((Err(anyhow!("wal watcher stopped unexpectedly")), watch));
                }
            },
            _ = watch.rescan.tick() => {}
        }

        let state = Arc::clone(&watch.state);
        let changes = blocking(move || {
            let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
            let current = state.reader.read()?;
            let changes = diff_snapshots(&state.last, &current);
            state.last = current;
            Ok(changes)
        })
        .await;
        match changes {
            Ok(changes) => watch.pending.extend(changes),
            Err(err) => return Some((Err(err), watch)),
        }
    }
}

fn to_watch_event(change: RowChange) -> WatchEvent<SqliteRow> {
    let row = SqliteRow {
        table: change.table_name,
        key: change.primary_key,
        columns: change.payload,
    };
    match change.operation {
        ChangeOperation::Insert => WatchEvent::Added(row),
        ChangeOperation::Update => WatchEvent::Modified(row),
        ChangeOperation::Delete => WatchEvent::Deleted(row),
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|err| anyhow!("sqlite snapshot task failed: {err}"))?
}
