// ABOUTME: List-then-watch change source with automatic resync
// ABOUTME: Emits Replace on every (re)list and incremental events from the watch stream

use std::time::Duration;

use anyhow::{Context, Result};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use tokio::time::Instant;

use super::{ChangeSource, EventSink};
use crate::meta::ObjectMeta;
use crate::utils::retry_with_backoff;

/// Incremental notification from a watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent<O> {
    Added(O),
    Modified(O),
    Deleted(O),
}

pub type WatchStream<O> = BoxStream<'static, Result<WatchEvent<O>>>;

/// A list/watch subscription.
///
/// `list` returns everything currently visible. `watch` returns the changes
/// after that listing. A watch stream that ends or yields an error means
/// events may have been missed; the caller relists.
pub trait ListerWatcher: Send + Sync + 'static {
    type Object: ObjectMeta + Send + 'static;

    fn list(&self) -> BoxFuture<'_, Result<Vec<Self::Object>>>;

    fn watch(&self) -> BoxFuture<'_, Result<WatchStream<Self::Object>>>;
}

/// Maximum attempts to list before the source fails for good.
pub const DEFAULT_MAX_LIST_RETRIES: u32 = 5;
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Turns a [`ListerWatcher`] into a [`ChangeSource`].
///
/// Every successful list, the first one and every resync, is delivered as
/// `Replace`. Watch interruptions trigger a relist. A watch that closes before
/// `max_backoff` has passed delays the relist; the delay doubles while
/// watches keep closing without delivering events. Only a list that keeps
/// failing after the retry budget terminates the source.
pub struct ListWatchSource<L> {
    lw: L,
    max_list_retries: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl<L: ListerWatcher> ListWatchSource<L> {
    pub fn new(lw: L) -> Self {
        Self {
            lw,
            max_list_retries: DEFAULT_MAX_LIST_RETRIES,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }

    pub fn with_max_list_retries(mut self, retries: u32) -> Self {
        self.max_list_retries = retries;
        self
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    async fn run_loop(self, sink: EventSink<L::Object>) -> Result<()> {
        let mut resyncs = 0u64;
        let mut relist_delay = self.initial_backoff.min(self.max_backoff);
        loop {
            let lw = &self.lw;
            let (objs, mut stream) = retry_with_backoff(
                || async move {
                    let objs = lw.list().await.context("list failed")?;
                    let stream = lw.watch().await.context("watch failed")?;
                    Ok((objs, stream))
                },
                self.max_list_retries,
                self.initial_backoff,
                self.max_backoff,
            )
            .await
            .with_context(|| {
                format!(
                    "giving up after {} list attempts",
                    self.max_list_retries + 1
                )
            })?;

            if resyncs > 0 {
                tracing::warn!(resyncs, objects = objs.len(), "resynced change source");
            } else {
                tracing::debug!(objects = objs.len(), "initial listing complete");
            }
            if sink.replace(objs).await.is_err() {
                return Ok(());
            }

            let watch_started = Instant::now();
            let mut delivered = false;
            while let Some(item) = stream.next().await {
                delivered |= item.is_ok();
                let sent = match item {
                    Ok(WatchEvent::Added(obj)) => sink.add(obj).await,
                    Ok(WatchEvent::Modified(obj)) => sink.update(obj).await,
                    Ok(WatchEvent::Deleted(obj)) => sink.delete(obj).await,
                    Err(err) => {
                        tracing::warn!("watch interrupted, relisting: {:#}", err);
                        break;
                    }
                };
                if sent.is_err() {
                    return Ok(());
                }
            }
            resyncs += 1;

            // A watch that keeps closing right away must not turn into a relist loop.
            if watch_started.elapsed() >= self.max_backoff {
                relist_delay = self.initial_backoff.min(self.max_backoff);
                continue;
            }
            tracing::debug!(
                delay_ms = relist_delay.as_millis() as u64,
                delivered,
                "watch closed early; delaying relist"
            );
            tokio::time::sleep(relist_delay).await;
            relist_delay = if delivered {
                self.initial_backoff.min(self.max_backoff)
            } else {
                (relist_delay * 2).min(self.max_backoff)
            };
        }
    }
}

impl<L: ListerWatcher> ChangeSource for ListWatchSource<L> {
    type Object = L::Object;

    fn run(self: Box<Self>, sink: EventSink<L::Object>) -> BoxFuture<'static, Result<()>> {
        (*self).run_loop(sink).boxed()
    }
}
