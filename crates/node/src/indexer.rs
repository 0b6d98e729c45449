//! Background section indexer following the canonical head.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chain::event::Subscription;
use chain::ChainReader;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Blocks per bloom bits section.
pub const BLOOM_SECTION_SIZE: u64 = 4096;

/// Confirmations a section needs before it is indexed.
pub const BLOOM_CONFIRMS: u64 = 256;

/// Head events buffered by the indexer.
const HEAD_BUFFER: usize = 16;

/// Counts completed bloom sections as the head advances.
pub struct BloomIndexer {
    sections: Arc<AtomicU64>,
    subscription: Subscription,
    quit: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

/// Sections fully covered, with enough confirmations, at `head`.
pub fn indexed_sections(head: u64) -> u64 {
    (head + 1).saturating_sub(BLOOM_CONFIRMS) / BLOOM_SECTION_SIZE
}

impl BloomIndexer {
    pub fn start(chain: Arc<dyn ChainReader>) -> Self {
        let sections = Arc::new(AtomicU64::new(indexed_sections(chain.current_header().number)));
        let (subscription, mut heads) = chain.subscribe_chain_head(HEAD_BUFFER);
        let (quit_tx, mut quit_rx) = oneshot::channel();

        let counter = sections.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = &mut quit_rx => break,
                    event = heads.recv() => {
                        let Some(event) = event else { break };
                        let done = indexed_sections(event.header.number);
                        let previous = counter.fetch_max(done, Ordering::SeqCst);
                        if done > previous {
                            info!(sections = done, head = event.header.number, "bloom sections indexed");
                        }
                    }
                }
            }
            debug!("bloom indexer stopped");
        });

        Self {
            sections,
            subscription,
            quit: Some(quit_tx),
            task: Some(task),
        }
    }

    pub fn sections(&self) -> u64 {
        self.sections.load(Ordering::SeqCst)
    }

    pub async fn close(&mut self) {
        self.subscription.unsubscribe();
        if let Some(quit) = self.quit.take() {
            let _ = quit.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}
