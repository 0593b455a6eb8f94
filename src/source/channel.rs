// ABOUTME: In-process change source driven through a handle
// ABOUTME: Used to feed events from application code and in tests

use anyhow::{anyhow, Result};
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::mpsc;

use super::{ChangeEvent, ChangeSource, EventSink};
use crate::meta::ObjectMeta;

type Item<O> = std::result::Result<ChangeEvent<O>, anyhow::Error>;

/// Creates a source/handle pair. Events pushed through the handle are
/// forwarded to the reflector in order. Dropping every handle completes the
/// source cleanly; [`SourceHandle::fail`] terminates it with an error.
pub fn channel_source<O>(capacity: usize) -> (ChannelSource<O>, SourceHandle<O>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSource { rx }, SourceHandle { tx })
}

pub struct ChannelSource<O> {
    rx: mpsc::Receiver<Item<O>>,
}

#[derive(Debug)]
pub struct SourceHandle<O> {
    tx: mpsc::Sender<Item<O>>,
}

impl<O> Clone for SourceHandle<O> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<O: Send + 'static> SourceHandle<O> {
    pub async fn send(&self, event: ChangeEvent<O>) -> Result<()> {
        self.tx
            .send(Ok(event))
            .await
            .map_err(|_| anyhow!("change source is no longer running"))
    }

    pub async fn add(&self, obj: O) -> Result<()> {
        self.send(ChangeEvent::Add(obj)).await
    }

    pub async fn update(&self, obj: O) -> Result<()> {
        self.send(ChangeEvent::Update(obj)).await
    }

    pub async fn delete(&self, obj: O) -> Result<()> {
        self.send(ChangeEvent::Delete(obj)).await
    }

    pub async fn replace(&self, objs: Vec<O>) -> Result<()> {
        self.send(ChangeEvent::Replace(objs)).await
    }

    /// Terminates the source with `err` after all previously sent events.
    pub async fn fail(self, err: anyhow::Error) -> Result<()> {
        self.tx
            .send(Err(err))
            .await
            .map_err(|_| anyhow!("change source is no longer running"))
    }
}

impl<O> ChangeSource for ChannelSource<O>
where
    O: ObjectMeta + Send + 'static,
{
    type Object = O;

    fn run(self: Box<Self>, sink: EventSink<O>) -> BoxFuture<'static, Result<()>> {
        let mut rx = self.rx;
        async move {
            while let Some(item) = rx.recv().await {
                let event = item?;
                if sink.send(event).await.is_err() {
                    return Ok(());
                }
            }
            Ok(())
        }
        .boxed()
    }
}
