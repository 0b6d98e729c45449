use std::future::Future;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use alloy_primitives::{b256, U256};
use chain::engine::{Engine, Ethash, Faker};
use chain::types::BlockHeader;
use chain::{ChainReader, ChainTracker};
use devp2p::discovery::FilteredIterator;
use devp2p::enr::{LocalNode, NodeId};
use forks::Network;
use k256::ecdsa::SigningKey;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::PublicKey;
use prometheus::Registry;
use sync::discovery::{etd_filter, setup_discovery, start_enr_updater, EnrUpdater};
use sync::downloader::{ChannelDownloader, DownloaderQueues};
use sync::fetcher::{AnnounceFetcher, ImportBlock, TxAnnounceQueue, TxQueues};
use sync::handler::Capability;
use sync::peer::short_id;
use sync::{Handler, HandlerConfig, HandlerError, SyncMetrics};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, RuntimeConfig};
use crate::import::{run_block_import, run_downloader};
use crate::indexer::BloomIndexer;
use crate::txpool::{run_tx_queues, TxPool, TX_POOL_CAPACITY};

const DOWNLOADER_BUFFER: usize = 64;
const IMPORT_BUFFER: usize = 256;
const TX_BUFFER: usize = 256;

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no built-in genesis for network {0}")]
    NoGenesis(Network),
    #[error("etherbase missing: etherbase must be explicitly specified")]
    EtherbaseMissing,
    #[error("backend already started")]
    AlreadyStarted,
    #[error("node key: {0}")]
    NodeKey(String),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Handler(#[from] HandlerError),
    #[error(transparent)]
    Discovery(#[from] devp2p::error::Error),
    #[error("metrics: {0}")]
    Metrics(#[from] prometheus::Error),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Genesis header of the built-in networks.
pub fn genesis_header(network: Network) -> Option<BlockHeader> {
    match network {
        Network::Mainnet => Some(BlockHeader {
            state_root: b256!("d7f8974fb5ac78d9ac099b9ad5018bedc2ce0a72dad1827a1709da30580f0544"),
            difficulty: U256::from(17_179_869_184u64),
            gas_limit: 5000,
            extra_data: b256!("11bbe8db4e347b4e8c937c1c8370e4b5ed33adb3db69cbdb7a38e1e50b1b82fa").to_vec(),
            nonce: [0, 0, 0, 0, 0, 0, 0, 0x42],
            ..Default::default()
        }),
        Network::Dev => Some(BlockHeader {
            difficulty: U256::from(1u64),
            gas_limit: 8_000_000,
            extra_data: b"etd-node dev".to_vec(),
            ..Default::default()
        }),
        Network::Mordor => None,
    }
}

/// Queue ends handed to the worker loops on start.
struct Queues {
    downloader: DownloaderQueues,
    blocks: mpsc::Receiver<ImportBlock>,
    txs: TxQueues,
}

/// A background loop with its own shutdown signal.
struct Worker {
    name: &'static str,
    stop: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Worker {
    fn spawn<F, Fut>(name: &'static str, run: F) -> Self
    where
        F: FnOnce(watch::Receiver<bool>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (stop, shutdown) = watch::channel(false);
        Self {
            name,
            stop,
            task: tokio::spawn(run(shutdown)),
        }
    }

    async fn stop(self) {
        self.stop.send_replace(true);
        if let Err(e) = self.task.await {
            error!(worker = self.name, err = %e, "worker failed");
        }
    }
}

struct Running {
    discovery: Vec<Arc<FilteredIterator>>,
    dialers: Vec<JoinHandle<()>>,
    enr_updater: EnrUpdater,
    indexer: BloomIndexer,
    tx_queue: Worker,
    downloader: Worker,
    importer: Worker,
}

/// The assembled node: chain, engine, sync handler and their feeder loops.
pub struct Backend {
    config: RuntimeConfig,
    registry: Registry,
    chain: Arc<ChainTracker>,
    engine: Arc<dyn Engine>,
    handler: Handler,
    local_node: Arc<LocalNode>,
    tx_pool: Arc<TxPool>,
    mining: AtomicBool,
    queues: Option<Queues>,
    running: Option<Running>,
}

impl Backend {
    pub fn new(config: RuntimeConfig) -> Result<Self, BackendError> {
        let genesis = genesis_header(config.network).ok_or(BackendError::NoGenesis(config.network))?;
        let chain = Arc::new(ChainTracker::new(config.network.chain_config(), genesis));
        info!(
            network = %config.network,
            genesis = %chain.genesis_hash(),
            "initialised chain"
        );

        let engine: Arc<dyn Engine> = match config.network {
            Network::Dev => Arc::new(Faker),
            _ => Arc::new(Ethash::new()),
        };

        let registry = Registry::new();
        let metrics = SyncMetrics::new(&registry)?;
        let (downloader, downloader_queues) = ChannelDownloader::new(DOWNLOADER_BUFFER);
        let (block_fetcher, blocks) = AnnounceFetcher::new(IMPORT_BUFFER, metrics.fetcher_rejected.clone());
        let (tx_fetcher, txs) = TxAnnounceQueue::new(TX_BUFFER, metrics.fetcher_rejected.clone());

        let mut handler_config = HandlerConfig::new(
            chain.clone(),
            Arc::new(downloader),
            Arc::new(block_fetcher),
            Arc::new(tx_fetcher),
            metrics,
        );
        handler_config.sync_mode = config.sync_mode;
        handler_config.checkpoint = config.checkpoint;
        handler_config.whitelist = config.whitelist.clone();
        handler_config.snapshot = config.snapshot;
        let handler = Handler::new(handler_config)?;

        let key = load_or_generate_nodekey(&config.datadir.join("nodekey"))?;
        let node_id = node_id(&key);
        info!(node_id = %short_id(&node_id), "node identity loaded");

        Ok(Self {
            config,
            registry,
            chain,
            engine,
            handler,
            local_node: Arc::new(LocalNode::new(node_id)),
            tx_pool: Arc::new(TxPool::new(TX_POOL_CAPACITY)),
            mining: AtomicBool::new(false),
            queues: Some(Queues {
                downloader: downloader_queues,
                blocks,
                txs,
            }),
            running: None,
        })
    }

    /// Starts the sync handler, discovery and the feeder loops.
    pub async fn start(&mut self) -> Result<(), BackendError> {
        if self.queues.is_none() {
            return Err(BackendError::AlreadyStarted);
        }
        let max_peers = self.config.etd_peers()?;
        let chain: Arc<dyn ChainReader> = self.chain.clone();

        self.handler.start(max_peers)?;

        let mut discovery = Vec::new();
        for (source, urls) in [
            ("etd", &self.config.discovery_dns),
            ("snap", &self.config.snap_discovery_dns),
        ] {
            if urls.is_empty() {
                continue;
            }
            match setup_discovery(urls, None, etd_filter(chain.clone())) {
                Ok(candidates) => discovery.push((source, Arc::new(candidates))),
                Err(e) => {
                    for (_, candidates) in &discovery {
                        candidates.close();
                    }
                    self.handler.stop().await;
                    return Err(e.into());
                }
            }
        }
        let dialers = discovery
            .iter()
            .map(|(source, candidates)| tokio::spawn(log_dial_candidates(*source, candidates.clone())))
            .collect();
        let enr_updater = start_enr_updater(chain.clone(), self.local_node.clone());
        let indexer = BloomIndexer::start(chain);

        let Some(Queues {
            downloader: downloader_queues,
            blocks,
            txs,
        }) = self.queues.take()
        else {
            return Err(BackendError::AlreadyStarted);
        };
        let tx_queue = {
            let pool = self.tx_pool.clone();
            let peers = self.handler.peers().clone();
            Worker::spawn("tx queue", move |shutdown| run_tx_queues(pool, peers, txs, shutdown))
        };
        let downloader = {
            let chain = self.chain.clone();
            Worker::spawn("downloader", move |shutdown| run_downloader(chain, downloader_queues, shutdown))
        };
        let importer = {
            let chain = self.chain.clone();
            Worker::spawn("block import", move |shutdown| run_block_import(chain, blocks, shutdown))
        };

        self.running = Some(Running {
            discovery: discovery.into_iter().map(|(_, candidates)| candidates).collect(),
            dialers,
            enr_updater,
            indexer,
            tx_queue,
            downloader,
            importer,
        });
        info!(max_peers, snapshot = self.config.snapshot, "backend started");

        if self.config.mining {
            self.start_mining(self.config.miner_threads)?;
        }
        Ok(())
    }

    /// Tears everything down: discovery, the handler, the indexer, the pool,
    /// the chain writers, then the chain and the engine.
    pub async fn stop(&mut self) {
        let mut rest = None;
        if let Some(Running {
            discovery,
            dialers,
            enr_updater,
            indexer,
            tx_queue,
            downloader,
            importer,
        }) = self.running.take()
        {
            for candidates in &discovery {
                candidates.close();
            }
            for dialer in dialers {
                let _ = dialer.await;
            }
            enr_updater.stop().await;
            rest = Some((indexer, tx_queue, downloader, importer));
        }

        self.handler.stop().await;

        if let Some((mut indexer, tx_queue, downloader, importer)) = rest {
            indexer.close().await;
            tx_queue.stop().await;
            downloader.stop().await;
            importer.stop().await;
        }

        self.stop_mining();
        self.chain.stop();
        self.engine.close();
        info!("backend stopped");
    }

    /// Whether `header` was produced by this node or one of its local accounts.
    pub fn is_local_block(&self, header: &BlockHeader) -> bool {
        let author = match self.engine.author(header) {
            Ok(author) => author,
            Err(e) => {
                warn!(number = header.number, hash = %header.hash(), err = %e, "failed to retrieve block author");
                return false;
            }
        };
        if self.config.etherbase == Some(author) {
            return true;
        }
        self.config.txpool_locals.contains(&author)
    }

    /// Side blocks worth keeping during a reorg: only our own.
    pub fn should_preserve(&self, header: &BlockHeader) -> bool {
        self.is_local_block(header)
    }

    /// Sets the miner thread count and starts mining. Zero threads lets the
    /// engine pick. Mining needs an etherbase.
    pub fn start_mining(&self, threads: i32) -> Result<(), BackendError> {
        if let Some(threaded) = self.engine.threaded() {
            info!(threads, "updated mining threads");
            threaded.set_threads(if threads == 0 { -1 } else { threads });
        }
        if self.is_mining() {
            return Ok(());
        }
        let etherbase = match self.config.etherbase {
            Some(etherbase) => etherbase,
            None => {
                error!("cannot start mining without etherbase");
                return Err(BackendError::EtherbaseMissing);
            }
        };
        // Mining implies the node considers itself synced.
        self.handler.set_accept_txs(true);
        self.mining.store(true, Ordering::SeqCst);
        info!(etherbase = %etherbase, "mining started");
        Ok(())
    }

    pub fn stop_mining(&self) {
        if let Some(threaded) = self.engine.threaded() {
            threaded.set_threads(-1);
        }
        if self.mining.swap(false, Ordering::SeqCst) {
            info!("mining stopped");
        }
    }

    pub fn is_mining(&self) -> bool {
        self.mining.load(Ordering::SeqCst)
    }

    /// True once the node accepts transactions.
    pub fn synced(&self) -> bool {
        self.handler.accept_txs()
    }

    pub fn protocols(&self) -> Vec<Capability> {
        self.handler.protocols()
    }

    pub fn chain(&self) -> &Arc<ChainTracker> {
        &self.chain
    }

    pub fn handler(&self) -> &Handler {
        &self.handler
    }

    pub fn local_node(&self) -> &Arc<LocalNode> {
        &self.local_node
    }

    pub fn tx_pool(&self) -> &Arc<TxPool> {
        &self.tx_pool
    }

    /// Bloom sections indexed so far; zero before start.
    pub fn bloom_sections(&self) -> u64 {
        self.running.as_ref().map_or(0, |running| running.indexer.sections())
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

/// Logs dial candidates until discovery closes. Dialing itself belongs to the
/// transport.
async fn log_dial_candidates(source: &'static str, candidates: Arc<FilteredIterator>) {
    while let Some(node) = candidates.next().await {
        debug!(source, node = %short_id(&node.id), addr = ?node.tcp_addr(), "dial candidate");
    }
    debug!(source, "discovery closed");
}

fn load_or_generate_nodekey(path: &Path) -> Result<SigningKey, BackendError> {
    if path.exists() {
        let hex_str = std::fs::read_to_string(path)?.trim().to_string();
        let bytes = hex::decode(&hex_str).map_err(|e| BackendError::NodeKey(e.to_string()))?;
        if bytes.len() != 32 {
            return Err(BackendError::NodeKey(format!(
                "nodekey must be 32 bytes, got {}",
                bytes.len()
            )));
        }
        let key = SigningKey::from_slice(&bytes).map_err(|e| BackendError::NodeKey(e.to_string()))?;
        info!(path = %path.display(), "loaded existing node key");
        Ok(key)
    } else {
        let key = SigningKey::random(&mut rand::thread_rng());
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, hex::encode(key.to_bytes().as_slice()))?;
        info!(path = %path.display(), "generated new node key");
        Ok(key)
    }
}

/// Uncompressed public key without the 0x04 prefix.
fn node_id(key: &SigningKey) -> NodeId {
    let public_key: PublicKey = key.verifying_key().into();
    let point = public_key.to_encoded_point(false);
    let mut id = [0u8; 64];
    id.copy_from_slice(&point.as_bytes()[1..65]);
    id
}
