//! Consumers of the sync queues: a header-only sync cycle driver and the
//! import loop for blocks completed by the announce fetcher.

use std::sync::Arc;
use std::time::Duration;

use chain::error::ChainError;
use chain::types::BlockHeader;
use chain::{ChainReader, ChainTracker};
use sync::downloader::{Delivery, DownloaderQueues, SyncRequest};
use sync::error::SyncError;
use sync::fetcher::ImportBlock;
use sync::peer::short_id;
use sync::PeerId;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Headers requested per round trip.
pub const MAX_HEADER_FETCH: u64 = 192;

/// Time a sync peer has to answer one header request.
pub const HEADER_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Serves sync cycles handed over by the channel downloader until shutdown.
pub async fn run_downloader(
    chain: Arc<ChainTracker>,
    mut queues: DownloaderQueues,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            request = queues.requests.recv() => {
                let Some(request) = request else { break };
                let result = tokio::select! {
                    _ = shutdown.changed() => Err(SyncError::Cancelled),
                    result = sync_headers(&chain, &request, &mut queues.deliveries) => result,
                };
                if let Err(e) = &result {
                    debug!(peer = %short_id(request.peer.id()), err = %e, "header sync aborted");
                }
                let _ = request.done.send(result);
            }
        }
    }
    debug!("downloader loop stopped");
}

/// Pulls headers from the request's peer until the local head reaches the
/// announced total difficulty.
async fn sync_headers(
    chain: &ChainTracker,
    request: &SyncRequest,
    deliveries: &mut mpsc::Receiver<Delivery>,
) -> Result<(), SyncError> {
    let peer = &request.peer;
    loop {
        let td = chain.head_td();
        if td >= request.td {
            info!(number = chain.current_header().number, td = %td, "header sync complete");
            return Ok(());
        }

        let from = chain.current_header().number + 1;
        if !peer.request_headers_by_number(from, MAX_HEADER_FETCH, 0, false) {
            return Err(SyncError::PeerDropped);
        }
        let headers = timeout(HEADER_REQUEST_TIMEOUT, next_headers(deliveries, peer.id()))
            .await
            .map_err(|_| SyncError::Timeout)?
            .ok_or(SyncError::Cancelled)?;
        if headers.is_empty() {
            return Err(SyncError::Downloader(format!("no headers from block {}", from)));
        }

        let count = headers.len();
        for header in headers {
            chain
                .insert(header)
                .await
                .map_err(|e| SyncError::Downloader(e.to_string()))?;
        }
        if chain.head_td() <= td {
            return Err(SyncError::Downloader("delivered headers did not extend the chain".to_string()));
        }
        debug!(peer = %short_id(peer.id()), from, count, "imported header batch");
    }
}

/// Waits for the next header batch from `peer`. Anything else is stale.
async fn next_headers(deliveries: &mut mpsc::Receiver<Delivery>, peer: &PeerId) -> Option<Vec<BlockHeader>> {
    while let Some(delivery) = deliveries.recv().await {
        match delivery {
            Delivery::Headers { peer: from, headers } if from == *peer => return Some(headers),
            other => debug!(kind = delivery_kind(&other), "discarding unrequested delivery"),
        }
    }
    None
}

fn delivery_kind(delivery: &Delivery) -> &'static str {
    match delivery {
        Delivery::Headers { .. } => "headers",
        Delivery::Bodies { .. } => "bodies",
        Delivery::Receipts { .. } => "receipts",
        Delivery::NodeData { .. } => "node data",
    }
}

/// Inserts blocks completed by the announce fetcher.
pub async fn run_block_import(
    chain: Arc<ChainTracker>,
    mut blocks: mpsc::Receiver<ImportBlock>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            block = blocks.recv() => {
                let Some(ImportBlock { origin, block }) = block else { break };
                let number = block.number();
                let hash = block.hash();
                match chain.insert(block.header).await {
                    Ok(true) => info!(number, hash = %hash, "imported propagated block"),
                    Ok(false) => debug!(number, hash = %hash, "propagated block not canonical"),
                    Err(ChainError::UnknownParent(parent)) => {
                        debug!(peer = %short_id(&origin), number, parent = %parent, "propagated block has unknown parent")
                    }
                    Err(e) => warn!(peer = %short_id(&origin), number, err = %e, "propagated block rejected"),
                }
            }
        }
    }
    debug!("block import loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy_primitives::{B256, U256};
    use chain::types::{Block, BlockBody};
    use forks::ChainConfig;
    use sync::downloader::ChannelDownloader;
    use sync::packet::HashOrNumber;
    use sync::{Downloader, EtdPeer, PeerCommand, SyncMode};

    fn genesis() -> BlockHeader {
        BlockHeader {
            difficulty: U256::from(10u64),
            ..Default::default()
        }
    }

    fn chain_of(parent: &BlockHeader, len: usize) -> Vec<BlockHeader> {
        let mut out = Vec::with_capacity(len);
        let mut parent = parent.clone();
        for _ in 0..len {
            let header = BlockHeader {
                parent_hash: parent.hash(),
                number: parent.number + 1,
                difficulty: U256::from(10u64),
                ..Default::default()
            };
            out.push(header.clone());
            parent = header;
        }
        out
    }

    #[tokio::test]
    async fn sync_cycle_imports_requested_headers() {
        let genesis = genesis();
        let chain = Arc::new(ChainTracker::new(ChainConfig::dev(), genesis.clone()));
        let (downloader, queues) = ChannelDownloader::new(8);
        let downloader = Arc::new(downloader);
        let (_stop, shutdown) = watch::channel(false);
        tokio::spawn(run_downloader(chain.clone(), queues, shutdown));

        let remote = chain_of(&genesis, 3);
        let (peer, mut commands) = EtdPeer::new([1; 64], 66, remote[2].hash(), U256::from(40u64));
        let sync = {
            let downloader = downloader.clone();
            let peer = peer.clone();
            tokio::spawn(async move {
                downloader
                    .synchronise(peer, remote[2].hash(), U256::from(40u64), SyncMode::Full)
                    .await
            })
        };

        match commands.recv().await.unwrap() {
            PeerCommand::GetBlockHeaders { origin, amount, .. } => {
                assert_eq!(origin, HashOrNumber::Number(1));
                assert_eq!(amount, MAX_HEADER_FETCH);
            }
            other => panic!("unexpected command {:?}", other),
        }
        downloader.deliver_headers(&[2; 64], vec![]).unwrap();
        downloader.deliver_headers(&[1; 64], chain_of(&genesis, 3)).unwrap();

        sync.await.unwrap().unwrap();
        assert_eq!(chain.current_header().number, 3);
        assert_eq!(chain.head_td(), U256::from(40u64));
    }

    #[tokio::test]
    async fn empty_answer_fails_cycle() {
        let genesis = genesis();
        let chain = Arc::new(ChainTracker::new(ChainConfig::dev(), genesis));
        let (downloader, queues) = ChannelDownloader::new(8);
        let downloader = Arc::new(downloader);
        let (_stop, shutdown) = watch::channel(false);
        tokio::spawn(run_downloader(chain.clone(), queues, shutdown));

        let (peer, mut commands) = EtdPeer::new([1; 64], 66, B256::repeat_byte(1), U256::from(99u64));
        let sync = {
            let downloader = downloader.clone();
            tokio::spawn(async move {
                downloader
                    .synchronise(peer, B256::repeat_byte(1), U256::from(99u64), SyncMode::Full)
                    .await
            })
        };
        commands.recv().await.unwrap();
        downloader.deliver_headers(&[1; 64], vec![]).unwrap();

        assert!(matches!(sync.await.unwrap(), Err(SyncError::Downloader(_))));
        assert_eq!(chain.current_header().number, 0);
    }

    #[tokio::test]
    async fn propagated_blocks_extend_the_chain() {
        let genesis = genesis();
        let chain = Arc::new(ChainTracker::new(ChainConfig::dev(), genesis.clone()));
        let (tx, rx) = mpsc::channel(4);
        let (stop, shutdown) = watch::channel(false);
        let task = tokio::spawn(run_block_import(chain.clone(), rx, shutdown));

        let header = chain_of(&genesis, 1).remove(0);
        let orphan = BlockHeader {
            parent_hash: B256::repeat_byte(0xaa),
            number: 7,
            ..Default::default()
        };
        for header in [orphan, header.clone()] {
            tx.send(ImportBlock {
                origin: [1; 64],
                block: Block::new(header, BlockBody::default()),
            })
            .await
            .unwrap();
        }
        drop(tx);
        task.await.unwrap();
        drop(stop);

        assert_eq!(chain.head_hash(), header.hash());
    }
}
