//! One-to-many event delivery over bounded channels.
//!
//! `Feed::send` waits for every live subscriber to accept the value, so a
//! subscriber sees each event exactly once and in order. A subscriber leaves
//! by calling [`Subscription::unsubscribe`] (or dropping the handle); its
//! receiver then drains and returns `None`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;

struct FeedInner<T> {
    next_id: u64,
    subscribers: HashMap<u64, mpsc::Sender<T>>,
    closed: bool,
}

pub struct Feed<T> {
    inner: Arc<Mutex<FeedInner<T>>>,
}

impl<T> Default for Feed<T> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(FeedInner {
                next_id: 0,
                subscribers: HashMap::new(),
                closed: false,
            })),
        }
    }
}

impl<T: Clone + Send + 'static> Feed<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber with a queue of `buffer` pending events.
    /// Subscribing to a closed feed yields an already-closed receiver.
    pub fn subscribe(&self, buffer: usize) -> (Subscription, mpsc::Receiver<T>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        if !inner.closed {
            inner.subscribers.insert(id, tx);
        }
        drop(inner);

        let feed = Arc::downgrade(&self.inner);
        let sub = Subscription {
            cancel: Some(Box::new(move || {
                if let Some(feed) = feed.upgrade() {
                    feed.lock().subscribers.remove(&id);
                }
            })),
        };
        (sub, rx)
    }

    /// Delivers `value` to every subscriber, returning how many accepted it.
    pub async fn send(&self, value: T) -> usize {
        let targets: Vec<(u64, mpsc::Sender<T>)> = {
            let inner = self.inner.lock();
            inner
                .subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut delivered = 0;
        for (id, tx) in targets {
            if tx.send(value.clone()).await.is_ok() {
                delivered += 1;
            } else {
                self.inner.lock().subscribers.remove(&id);
            }
        }
        delivered
    }

    /// Drops every subscriber queue. Later sends are no-ops.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        inner.subscribers.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.lock().subscribers.len()
    }
}

/// Handle to an active subscription.
pub struct Subscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    /// Detaches from the feed. Safe to call more than once.
    pub fn unsubscribe(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
