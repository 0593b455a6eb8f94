// ABOUTME: Reflector engine mirroring a change source into a table
// ABOUTME: Events are coalesced into windows and each window is committed in one write txn

pub mod commit;
pub mod config;
pub mod window;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{ReflectorError, Result};
use crate::health::Health;
use crate::jobs::{JobGroup, Shutdown};
use crate::meta::ObjectMeta;
use crate::source::{ChangeSource, EventSink};
use crate::table::{Table, TableRow};

use commit::Committer;
use config::TransformFn;
use window::Window;

pub use commit::CommitStats;
pub use config::{
    QueryAllFn, ReflectorConfig, DEFAULT_EVENT_CAPACITY, DEFAULT_MAX_BATCH_KEYS,
    DEFAULT_MAX_WAIT_TIME,
};

/// Name of the job running the reflector for `table_name`.
pub fn job_name(table_name: &str) -> String {
    format!("reflector-[{table_name}]")
}

/// Registers a job in `jobs` that keeps `table` in sync with the config's
/// change source.
///
/// The table gets an initializer before this returns, so readers waiting on
/// [`Table::wait_initialized`] see the table as uninitialized until the first
/// snapshot has been committed. Fails without starting anything when the
/// config has no source.
pub fn register_reflector<S, T>(
    jobs: &mut JobGroup,
    table: Arc<Table<T>>,
    config: ReflectorConfig<S, T>,
) -> Result<()>
where
    S: ObjectMeta + Send + 'static,
    T: TableRow,
{
    let mut config = config.with_defaults();
    let source = config.source.take().ok_or(ReflectorError::MissingSource)?;

    let name = job_name(table.name());
    let initializer = {
        let mut txn = table.write();
        let initializer = txn.register_initializer(name.clone());
        txn.commit();
        initializer
    };

    let reflector = Reflector {
        table_name: table.name().to_string(),
        source,
        transform: config.transform,
        committer: Committer::new(table, initializer, config.query_all),
        max_batch_keys: config.max_batch_keys,
        max_wait_time: config.max_wait_time,
        event_capacity: config.event_capacity,
    };
    tracing::debug!(
        job = %name,
        max_batch_keys = reflector.max_batch_keys,
        max_wait_ms = reflector.max_wait_time.as_millis() as u64,
        "registering reflector"
    );
    jobs.add_oneshot(name, move |shutdown, health| async move {
        reflector.run(shutdown, health).await?;
        Ok(())
    });
    Ok(())
}

struct Reflector<S, T: TableRow> {
    table_name: String,
    source: Box<dyn ChangeSource<Object = S>>,
    transform: TransformFn<S, T>,
    committer: Committer<T>,
    max_batch_keys: usize,
    max_wait_time: Duration,
    event_capacity: usize,
}

impl<S, T> Reflector<S, T>
where
    S: ObjectMeta + Send + 'static,
    T: TableRow,
{
    async fn run(self, mut shutdown: Shutdown, health: Health) -> Result<()> {
        let Reflector {
            table_name,
            source,
            transform,
            committer,
            max_batch_keys,
            max_wait_time,
            event_capacity,
        } = self;
        let flusher = Flusher {
            table_name: &table_name,
            committer: &committer,
            health: &health,
        };

        let (tx, mut rx) = mpsc::channel(event_capacity);
        let mut producer = tokio::spawn(source.run(EventSink::new(tx)));
        let mut window = Window::new();
        let mut deadline: Option<Instant> = None;

        tracing::info!(table = %table_name, "reflector started");
        loop {
            let commit_at = deadline.unwrap_or_else(Instant::now);
            tokio::select! {
                biased;

                _ = shutdown.recv() => {
                    stop_producer(&producer, &table_name, &window);
                    return Ok(());
                }

                _ = tokio::time::sleep_until(commit_at), if deadline.is_some() => {
                    deadline = None;
                    flusher.flush(&mut window);
                }

                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if let Err(err) = window.push(event, &transform) {
                        producer.abort();
                        tracing::error!(table = %table_name, "dropping window: {}", err);
                        return Err(err);
                    }
                    if deadline.is_none() {
                        deadline = Some(Instant::now() + max_wait_time);
                    }
                    if window.len() >= max_batch_keys {
                        deadline = None;
                        flusher.flush(&mut window);
                    }
                }
            }
        }

        // Every sink is gone. Commit what arrived, then report how the source ended.
        let outcome = tokio::select! {
            biased;

            _ = shutdown.recv() => {
                stop_producer(&producer, &table_name, &window);
                return Ok(());
            }
            outcome = &mut producer => outcome,
        };
        flusher.flush(&mut window);

        match outcome {
            Ok(Ok(())) => {
                tracing::info!(table = %table_name, "change source finished");
                Ok(())
            }
            Ok(Err(err)) => Err(ReflectorError::Source(err)),
            Err(err) => Err(ReflectorError::TaskFailed(err.to_string())),
        }
    }
}

struct Flusher<'a, T: TableRow> {
    table_name: &'a str,
    committer: &'a Committer<T>,
    health: &'a Health,
}

impl<T: TableRow> Flusher<'_, T> {
    fn flush(&self, window: &mut Window<T>) {
        if window.is_empty() {
            return;
        }
        let keys = window.len();
        let resync = window.has_baseline();
        let stats = self.committer.commit(window.take());
        tracing::debug!(
            table = %self.table_name,
            keys,
            resync,
            inserted = stats.inserted,
            deleted = stats.deleted,
            total = stats.total,
            "committed window"
        );
        self.health.ok(stats.to_string());
    }
}

fn stop_producer<T>(
    producer: &JoinHandle<anyhow::Result<()>>,
    table_name: &str,
    window: &Window<T>,
) {
    producer.abort();
    tracing::info!(
        table = %table_name,
        discarded_keys = window.len(),
        "reflector stopped"
    );
}
