//! Composition of discovery sources into a single stream of dial candidates.

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::enr::NodeRecord;

/// Default number of buffered candidates shared by all sources of a mix.
pub const MIX_BUFFER: usize = 256;

/// A producer of node records. `run` owns the source until the output closes.
#[async_trait]
pub trait NodeSource: Send + 'static {
    fn name(&self) -> &str;

    async fn run(self: Box<Self>, out: mpsc::Sender<NodeRecord>);
}

/// Wraps a channel fed by another subsystem, e.g. a DHT random walk.
pub struct ChannelSource {
    name: String,
    rx: mpsc::Receiver<NodeRecord>,
}

impl ChannelSource {
    pub fn new(name: impl Into<String>, rx: mpsc::Receiver<NodeRecord>) -> Self {
        Self {
            name: name.into(),
            rx,
        }
    }
}

#[async_trait]
impl NodeSource for ChannelSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn run(self: Box<Self>, out: mpsc::Sender<NodeRecord>) {
        let ChannelSource { mut rx, .. } = *self;
        while let Some(node) = rx.recv().await {
            if out.send(node).await.is_err() {
                return;
            }
        }
    }
}

/// Interleaves candidates from any number of sources. Sources block on a
/// bounded buffer, so a fast source cannot starve a slow one indefinitely.
pub struct SourceMix {
    tx: mpsc::Sender<NodeRecord>,
    rx: tokio::sync::Mutex<mpsc::Receiver<NodeRecord>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: watch::Sender<bool>,
}

impl SourceMix {
    pub fn new(buffer: usize) -> Self {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (closed, _) = watch::channel(false);
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            tasks: Mutex::new(Vec::new()),
            closed,
        }
    }

    /// Spawns the source on the current runtime.
    pub fn add_source(&self, source: Box<dyn NodeSource>) {
        if self.is_closed() {
            return;
        }
        debug!(source = source.name(), "adding discovery source");
        let tx = self.tx.clone();
        self.tasks.lock().push(tokio::spawn(source.run(tx)));
    }

    /// Waits for the next candidate. Returns `None` once closed.
    pub async fn next(&self) -> Option<NodeRecord> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow() {
            return None;
        }
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = closed.wait_for(|c| *c) => None,
            node = rx.recv() => node,
        }
    }

    pub fn close(&self) {
        self.closed.send_replace(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }
}

type Predicate = Box<dyn Fn(&NodeRecord) -> bool + Send + Sync>;

/// A mix that only yields records accepted by a predicate.
pub struct FilteredIterator {
    mix: SourceMix,
    filter: Predicate,
}

impl FilteredIterator {
    pub fn new(mix: SourceMix, filter: impl Fn(&NodeRecord) -> bool + Send + Sync + 'static) -> Self {
        Self {
            mix,
            filter: Box::new(filter),
        }
    }

    pub async fn next(&self) -> Option<NodeRecord> {
        loop {
            let node = self.mix.next().await?;
            if (self.filter)(&node) {
                return Some(node);
            }
        }
    }

    pub fn close(&self) {
        self.mix.close();
    }

    pub fn is_closed(&self) -> bool {
        self.mix.is_closed()
    }
}
