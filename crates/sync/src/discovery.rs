//! Fork-aware node discovery and advertisement of the local fork id.

use std::sync::Arc;

use chain::ChainReader;
use devp2p::discovery::{ChannelSource, FilteredIterator, SourceMix, MIX_BUFFER};
use devp2p::dns_discovery::DnsDiscovery;
use devp2p::enr::{EnrEntry, LocalNode, NodeRecord};
use devp2p::error::Error;
use devp2p::forkid::{ForkFilter, ForkId};
use devp2p::rlp::RlpItem;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use chain::event::Subscription;

/// Head events buffered by the ENR updater.
pub const ENR_UPDATE_BUFFER: usize = 10;

/// The `etd` record entry: the fork id followed by fields from newer versions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtdEntry {
    pub fork_id: ForkId,
    pub rest: Vec<RlpItem>,
}

impl EnrEntry for EtdEntry {
    const KEY: &'static str = "etd";

    fn to_rlp(&self) -> RlpItem {
        let mut fields = vec![self.fork_id.to_rlp()];
        fields.extend(self.rest.iter().cloned());
        RlpItem::List(fields)
    }

    fn from_rlp(item: RlpItem) -> Result<Self, Error> {
        let mut fields = item.into_list()?.into_iter();
        let fork_id = fields
            .next()
            .ok_or(Error::Enr("etd entry without fork id".to_string()))
            .and_then(ForkId::from_rlp)?;
        Ok(Self {
            fork_id,
            rest: fields.collect(),
        })
    }
}

/// The `les` record entry advertised by light servers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LesEntry {
    pub vfx_version: u64,
    pub rest: Vec<RlpItem>,
}

impl EnrEntry for LesEntry {
    const KEY: &'static str = "les";

    fn to_rlp(&self) -> RlpItem {
        let mut fields = vec![RlpItem::uint(self.vfx_version)];
        fields.extend(self.rest.iter().cloned());
        RlpItem::List(fields)
    }

    fn from_rlp(item: RlpItem) -> Result<Self, Error> {
        let mut fields = item.into_list()?.into_iter();
        let vfx_version = match fields.next() {
            Some(v) => v.into_u64()?,
            None => 0,
        };
        Ok(Self {
            vfx_version,
            rest: fields.collect(),
        })
    }
}

/// The `etd` entry for the chain at block `head`.
pub fn etd_entry_at(chain: &dyn ChainReader, head: u64) -> EtdEntry {
    let genesis = chain.genesis_hash();
    EtdEntry {
        fork_id: ForkId::new(&genesis.0, &chain.config().fork_blocks(), head),
        rest: Vec::new(),
    }
}

/// The `etd` entry for the current chain head.
pub fn current_etd_entry(chain: &dyn ChainReader) -> EtdEntry {
    etd_entry_at(chain, chain.current_header().number)
}

/// Where the ENR updater publishes the local entry.
pub trait EntrySink: Send + Sync + 'static {
    fn set_entry(&self, entry: &EtdEntry);
}

impl EntrySink for LocalNode {
    fn set_entry(&self, entry: &EtdEntry) {
        self.set(entry);
    }
}

/// Background task keeping the local `etd` entry current.
pub struct EnrUpdater {
    subscription: Mutex<Subscription>,
    quit: Mutex<Option<oneshot::Sender<()>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl EnrUpdater {
    /// Unsubscribes from head events and waits for the task to exit. Must run
    /// before the chain closes its head feed.
    pub async fn stop(&self) {
        self.subscription.lock().unsubscribe();
        if let Some(quit) = self.quit.lock().take() {
            let _ = quit.send(());
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

/// Sets the current entry and republishes it on every chain head event.
pub fn start_enr_updater(chain: Arc<dyn ChainReader>, sink: Arc<dyn EntrySink>) -> EnrUpdater {
    sink.set_entry(&current_etd_entry(chain.as_ref()));
    let (subscription, mut heads) = chain.subscribe_chain_head(ENR_UPDATE_BUFFER);
    let (quit_tx, mut quit_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        loop {
            tokio::select! {
                biased;
                _ = &mut quit_rx => break,
                event = heads.recv() => match event {
                    Some(event) => {
                        let entry = etd_entry_at(chain.as_ref(), event.header.number);
                        debug!(number = event.header.number, fork_hash = %hex::encode(entry.fork_id.fork_hash), "updating etd entry");
                        sink.set_entry(&entry);
                    }
                    None => break,
                },
            }
        }
        debug!("enr updater stopped");
    });

    EnrUpdater {
        subscription: Mutex::new(subscription),
        quit: Mutex::new(Some(quit_tx)),
        task: Mutex::new(Some(task)),
    }
}

/// Accepts records whose `etd` entry is compatible with the local chain.
pub fn etd_filter(chain: Arc<dyn ChainReader>) -> impl Fn(&NodeRecord) -> bool + Send + Sync + 'static {
    let forks = ForkFilter::new(&chain.genesis_hash().0, &chain.config().fork_blocks());
    move |node| match node.load::<EtdEntry>() {
        Ok(entry) => forks
            .validate(&entry.fork_id, chain.current_header().number)
            .is_ok(),
        Err(_) => false,
    }
}

/// Accepts light servers: both `les` and `etd` entries, fork compatible.
pub fn les_filter(chain: Arc<dyn ChainReader>) -> impl Fn(&NodeRecord) -> bool + Send + Sync + 'static {
    let etd = etd_filter(chain);
    move |node| node.load::<LesEntry>().is_ok() && etd(node)
}

/// Builds a candidate iterator from DNS trees and an optional DHT feed.
pub fn setup_discovery<F>(
    urls: &[String],
    dht: Option<mpsc::Receiver<NodeRecord>>,
    filter: F,
) -> Result<FilteredIterator, Error>
where
    F: Fn(&NodeRecord) -> bool + Send + Sync + 'static,
{
    let mix = SourceMix::new(MIX_BUFFER);
    for url in urls {
        let dns = DnsDiscovery::new(url)?;
        mix.add_source(Box::new(dns));
    }
    if let Some(rx) = dht {
        mix.add_source(Box::new(ChannelSource::new("dht", rx)));
    }
    info!(dns_trees = urls.len(), "discovery configured");
    Ok(FilteredIterator::new(mix, filter))
}
