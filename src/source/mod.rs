// ABOUTME: Change source abstraction feeding the reflector
// ABOUTME: Sources push typed add/update/delete/replace events into a bounded sink

pub mod channel;
pub mod listwatch;
#[cfg(feature = "sqlite-sync")]
pub mod sqlite;

use futures::future::BoxFuture;
use tokio::sync::mpsc;

use crate::meta::ObjectMeta;

pub use channel::{channel_source, ChannelSource, SourceHandle};
pub use listwatch::{ListWatchSource, ListerWatcher, WatchEvent, WatchStream};
#[cfg(feature = "sqlite-sync")]
pub use sqlite::{SqliteRow, SqliteSourceConfig, SqliteTableSource};

/// A normalized change notification.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent<O> {
    Add(O),
    Update(O),
    Delete(O),
    /// Complete snapshot of everything currently visible at the source. Never
    /// absent; an empty source yields an empty vector.
    Replace(Vec<O>),
}

impl<O> ChangeEvent<O> {
    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Add(_) => "add",
            ChangeEvent::Update(_) => "update",
            ChangeEvent::Delete(_) => "delete",
            ChangeEvent::Replace(_) => "replace",
        }
    }
}

/// The consumer of a source stopped listening. Sources should return `Ok(())`
/// when they see this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("event sink closed")]
pub struct SinkClosed;

/// Push side of the bounded channel between a change source and the reflector.
/// Sending waits while the channel is full, so a slow commit applies
/// backpressure to the source.
#[derive(Debug)]
pub struct EventSink<O> {
    tx: mpsc::Sender<ChangeEvent<O>>,
}

impl<O> Clone for EventSink<O> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<O: Send> EventSink<O> {
    pub fn new(tx: mpsc::Sender<ChangeEvent<O>>) -> Self {
        Self { tx }
    }

    pub async fn send(&self, event: ChangeEvent<O>) -> Result<(), SinkClosed> {
        self.tx.send(event).await.map_err(|_| SinkClosed)
    }

    pub async fn add(&self, obj: O) -> Result<(), SinkClosed> {
        self.send(ChangeEvent::Add(obj)).await
    }

    pub async fn update(&self, obj: O) -> Result<(), SinkClosed> {
        self.send(ChangeEvent::Update(obj)).await
    }

    pub async fn delete(&self, obj: O) -> Result<(), SinkClosed> {
        self.send(ChangeEvent::Delete(obj)).await
    }

    pub async fn replace(&self, objs: Vec<O>) -> Result<(), SinkClosed> {
        self.send(ChangeEvent::Replace(objs)).await
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// A producer of change events.
///
/// `run` must emit a `Replace` on its initial listing and on every resync, and
/// keeps producing until the sink closes (return `Ok(())`) or the underlying
/// subscription fails for good (return the error). It never touches the
/// target table.
pub trait ChangeSource: Send + 'static {
    type Object: ObjectMeta + Send + 'static;

    fn run(
        self: Box<Self>,
        sink: EventSink<Self::Object>,
    ) -> BoxFuture<'static, anyhow::Result<()>>;
}
