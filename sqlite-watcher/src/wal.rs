use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc::Sender;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct WalWatcherConfig {
    pub poll_interval: Duration,
    pub min_event_bytes: u64,
}

impl Default for WalWatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            min_event_bytes: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalEvent {
    /// The WAL grew; new frames were appended since the last poll.
    Grew { bytes_added: u64, current_size: u64 },
    /// The WAL shrank (checkpoint with TRUNCATE/RESTART or file removal). Any
    /// incremental position derived from the old file is no longer valid.
    Truncated { previous_size: u64, current_size: u64 },
}

pub struct WalWatcherHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl WalWatcherHandle {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.thread.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for WalWatcherHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Polls the `-wal` file next to `db_path` and reports growth and truncation.
///
/// Events are delivered with `blocking_send`, so a slow consumer applies
/// backpressure to the polling thread. The thread exits once the receiver is
/// dropped or the handle is stopped.
pub fn start_wal_watcher<P: AsRef<Path>>(
    db_path: P,
    options: WalWatcherConfig,
    sender: Sender<WalEvent>,
) -> Result<WalWatcherHandle> {
    let db_path = db_path.as_ref().canonicalize().with_context(|| {
        format!(
            "failed to canonicalize database path {}",
            db_path.as_ref().display()
        )
    })?;
    if !db_path.is_file() {
        anyhow::bail!("database path {} is not a file", db_path.display());
    }

    let wal_path = wal_file_path(&db_path);
    let poll_interval = options.poll_interval;
    let min_event_bytes = options.min_event_bytes;
    let stop_flag = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop_flag);

    let handle = thread::spawn(move || {
        let mut last_len = wal_file_size(&wal_path).unwrap_or(0);
        debug!(
            wal = %wal_path.display(),
            last_len,
            "wal watcher started"
        );
        while !thread_stop.load(Ordering::SeqCst) {
            let event = match wal_file_size(&wal_path) {
                Ok(len) if len < last_len => {
                    debug!(
                        wal = %wal_path.display(),
                        prev = last_len,
                        current = len,
                        "wal truncated"
                    );
                    let event = WalEvent::Truncated {
                        previous_size: last_len,
                        current_size: len,
                    };
                    last_len = len;
                    Some(event)
                }
                Ok(len) if len > last_len => {
                    let delta = len - last_len;
                    last_len = len;
                    (delta >= min_event_bytes).then_some(WalEvent::Grew {
                        bytes_added: delta,
                        current_size: len,
                    })
                }
                Ok(_) => None,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    let previous_size = std::mem::take(&mut last_len);
                    (previous_size > 0).then_some(WalEvent::Truncated {
                        previous_size,
                        current_size: 0,
                    })
                }
                Err(err) => {
                    warn!(
                        wal = %wal_path.display(),
                        error = %err,
                        "failed to read wal metadata"
                    );
                    None
                }
            };

            if let Some(event) = event {
                if sender.blocking_send(event).is_err() {
                    debug!("wal watcher stopping because receiver closed");
                    break;
                }
            }

            thread::sleep(poll_interval);
        }

        debug!("wal watcher exiting");
    });

    Ok(WalWatcherHandle {
        stop: stop_flag,
        thread: Some(handle),
    })
}

fn wal_file_path(db_path: &Path) -> PathBuf {
    let mut os_string = OsString::from(db_path.as_os_str());
    os_string.push("-wal");
    PathBuf::from(os_string)
}

fn wal_file_size(path: &Path) -> std::io::Result<u64> {
    std::fs::metadata(path).map(|m| m.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use std::time::Instant;
    use tempfile::tempdir;
    use tokio::sync::mpsc::channel;
    use tokio::time::timeout;

    fn wal_writer(db_path: &Path) -> Connection {
        let writer = Connection::open(db_path).unwrap();
        writer.pragma_update(None, "journal_mode", "wal").unwrap();
        writer
            .pragma_update(None, "wal_autocheckpoint", 0i64)
            .unwrap();
        writer
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn emits_event_when_wal_grows() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("watch.sqlite");
        let writer = wal_writer(&db_path);
        writer
            .execute(
                "CREATE TABLE changes(id INTEGER PRIMARY KEY, value TEXT)",
                [],
            )
            .unwrap();

        let (tx, mut rx) = channel(16);
        let handle = start_wal_watcher(
            &db_path,
            WalWatcherConfig {
                poll_interval: Duration::from_millis(50),
                min_event_bytes: 1,
            },
            tx,
        )
        .unwrap();

        for i in 0..50 {
            writer
                .execute(
                    "INSERT INTO changes(value) VALUES (?1)",
                    [format!("value-{i}")],
                )
                .unwrap();
        }

        let event = timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            WalEvent::Grew {
                bytes_added,
                current_size,
            } => {
                assert!(bytes_added > 0);
                assert!(current_size >= bytes_added);
            }
            other => panic!("expected growth, got {other:?}"),
        }

        drop(rx);
        drop(handle);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn reports_wal_truncation() {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("truncate.sqlite");
        let writer = wal_writer(&db_path);
        writer
            .execute("CREATE TABLE stuff(id INTEGER PRIMARY KEY, value TEXT)", [])
            .unwrap();

        let (tx, mut rx) = channel(16);
        let handle = start_wal_watcher(
            &db_path,
            WalWatcherConfig {
                poll_interval: Duration::from_millis(25),
                min_event_bytes: 1,
            },
            tx,
        )
        .unwrap();

        for i in 0..10 {
            writer
                .execute("INSERT INTO stuff(value) VALUES (?1)", [format!("row-{i}")])
                .unwrap();
        }

        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();

        writer
            .execute_batch("PRAGMA wal_checkpoint(TRUNCATE);")
            .unwrap();

        let start = Instant::now();
        let mut truncated = false;
        while start.elapsed() < Duration::from_secs(5) {
            match timeout(Duration::from_millis(200), rx.recv()).await {
                Ok(Some(WalEvent::Truncated { current_size, .. })) => {
                    assert_eq!(current_size, 0);
                    truncated = true;
                    break;
                }
                Ok(Some(_)) | Err(_) => continue,
                Ok(None) => break,
            }
        }
        assert!(truncated, "expected a truncation event");

        drop(rx);
        drop(handle);
    }
}
