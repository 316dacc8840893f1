//! The cluster-wide block store facade.
//!
//! A `Distributor` places every block on the peers the current ring names,
//! serves reads and writes under the configured consistency levels, and
//! answers block requests arriving from the other peers.

pub mod client;
mod handle;
mod read;
mod rpc;
mod watcher;
mod write;

pub use client::PeerClient;
pub use handle::DistributorHandle;
pub use watcher::RingWatcher;

use crate::block::BlockRef;
use crate::cache::ReadCache;
use crate::error::{Result, TorusError};
use crate::gc::GarbageCollector;
use crate::metadata::MetadataService;
use crate::options::{BlockOptions, DistributorOptions, RebalanceOptions};
use crate::peer::RebalanceInfo;
use crate::protocol::ProtocolServer;
use crate::rebalance::RebalanceDriver;
use crate::ring::Ring;
use crate::storage::{BlockIterator, BlockStore};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

pub struct Distributor {
    uuid: String,
    metadata: Arc<dyn MetadataService>,
    blocks: Arc<dyn BlockStore>,
    client: Arc<PeerClient>,
    ring: RwLock<Arc<dyn Ring>>,
    read_cache: ReadCache,
    options: DistributorOptions,
    rebalance_info: RwLock<RebalanceInfo>,
    closed: AtomicBool,
}

impl Distributor {
    pub async fn new(
        metadata: Arc<dyn MetadataService>,
        blocks: Arc<dyn BlockStore>,
        options: DistributorOptions,
    ) -> Result<Arc<Self>> {
        let global = metadata.global_metadata().await?;
        if blocks.block_size() != global.block_size {
            return Err(TorusError::Config(format!(
                "local store block size {} does not match cluster block size {}",
                blocks.block_size(),
                global.block_size
            )));
        }

        let ring = metadata.get_ring().await?;
        let peers = metadata.get_peers().await?;
        let block_size = global.block_size as usize;

        let client = Arc::new(PeerClient::new(
            Arc::clone(&metadata),
            peers,
            block_size,
            options.timeouts.clone(),
        ));
        let read_cache = ReadCache::with_budget(options.read_cache_size, global.block_size);

        tracing::info!(
            "Distributor {} starting on ring v{} (read level {}, write level {}, cache {} blocks)",
            metadata.uuid(),
            ring.version(),
            options.read_level,
            options.write_level,
            read_cache.capacity()
        );

        Ok(Arc::new(Self {
            uuid: metadata.uuid().to_string(),
            metadata,
            blocks,
            client,
            ring: RwLock::new(ring),
            read_cache,
            options,
            rebalance_info: RwLock::new(RebalanceInfo::default()),
            closed: AtomicBool::new(false),
        }))
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn options(&self) -> &DistributorOptions {
        &self.options
    }

    pub fn metadata(&self) -> &Arc<dyn MetadataService> {
        &self.metadata
    }

    /// The store holding this peer's own replicas.
    pub fn local_store(&self) -> &Arc<dyn BlockStore> {
        &self.blocks
    }

    pub fn client(&self) -> &Arc<PeerClient> {
        &self.client
    }

    pub(crate) fn read_cache(&self) -> &ReadCache {
        &self.read_cache
    }

    pub async fn ring(&self) -> Arc<dyn Ring> {
        Arc::clone(&*self.ring.read().await)
    }

    /// Swaps in a newer ring. A ring that is not strictly newer than the
    /// active one is refused.
    pub async fn replace_ring(&self, ring: Arc<dyn Ring>) -> Result<()> {
        let mut current = self.ring.write().await;
        if ring.version() <= current.version() {
            return Err(TorusError::RingVersionRegression {
                current: current.version(),
                proposed: ring.version(),
            });
        }

        tracing::info!(
            "Adopting ring v{} (was v{}): {}",
            ring.version(),
            current.version(),
            ring.describe()
        );
        *current = ring;
        Ok(())
    }

    pub async fn rebalance_info(&self) -> RebalanceInfo {
        self.rebalance_info.read().await.clone()
    }

    pub(crate) async fn set_rebalance_info(&self, info: RebalanceInfo) {
        *self.rebalance_info.write().await = info;
    }

    pub async fn refresh_peers(&self) -> Result<()> {
        self.client.refresh_peers().await
    }

    /// Starts serving peers, watching the ring and rebalancing.
    pub async fn launch(
        self: &Arc<Self>,
        listener: TcpListener,
        gc: Arc<dyn GarbageCollector>,
        rebalance: RebalanceOptions,
    ) -> Result<DistributorHandle> {
        let shutdown = CancellationToken::new();

        let server = ProtocolServer::start(
            listener,
            Arc::clone(self) as Arc<dyn crate::protocol::RequestHandler>,
            self.block_size() as usize,
            shutdown.child_token(),
        )?;

        let watcher = RingWatcher::new(Arc::clone(self), shutdown.clone());
        let watcher = tokio::spawn(watcher.run());

        let rebalancer = if rebalance.enabled {
            let driver =
                RebalanceDriver::new(Arc::clone(self), gc, rebalance, shutdown.child_token());
            Some(tokio::spawn(driver.run()))
        } else {
            tracing::info!("Rebalancing disabled for {}", self.uuid);
            None
        };

        Ok(DistributorHandle::new(
            Arc::clone(self),
            server,
            shutdown,
            watcher,
            rebalancer,
        ))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TorusError::Closed);
        }
        Ok(())
    }

    fn check_block_size(&self, data: &Bytes) -> Result<()> {
        let expected = self.block_size() as usize;
        if data.len() != expected {
            return Err(TorusError::InvalidBlockSize {
                expected,
                actual: data.len(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl BlockStore for Distributor {
    async fn get_block(&self, block_ref: BlockRef) -> Result<Bytes> {
        self.get_block_with(block_ref, BlockOptions::default()).await
    }

    async fn write_block(&self, block_ref: BlockRef, data: Bytes) -> Result<()> {
        self.write_block_with(block_ref, data, BlockOptions::default())
            .await
    }

    async fn delete_block(&self, block_ref: BlockRef) -> Result<()> {
        self.ensure_open()?;
        self.read_cache.remove(&block_ref);
        self.blocks.delete_block(block_ref).await
    }

    async fn has_block(&self, block_ref: BlockRef) -> Result<bool> {
        self.ensure_open()?;
        if self.blocks.has_block(block_ref).await? {
            return Ok(true);
        }

        let permutation = self.ring().await.get_peers(block_ref)?;
        let timeout = self.options.timeouts.op();
        for peer in permutation.desired().iter().filter(|p| **p != self.uuid) {
            match self
                .client
                .rebalance_check(peer, &[block_ref], timeout)
                .await
            {
                Ok(present) if present.first().copied().unwrap_or(false) => return Ok(true),
                Ok(_) => {}
                Err(error) => {
                    tracing::debug!("Presence check of {} on {} failed: {}", block_ref, peer, error);
                }
            }
        }
        Ok(false)
    }

    async fn num_blocks(&self) -> u64 {
        self.blocks.num_blocks().await
    }

    async fn used_blocks(&self) -> u64 {
        self.blocks.used_blocks().await
    }

    async fn block_iterator(&self) -> Result<Box<dyn BlockIterator>> {
        self.ensure_open()?;
        self.blocks.block_iterator().await
    }

    fn block_size(&self) -> u64 {
        self.blocks.block_size()
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()?;
        self.blocks.flush().await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.client.close().await;
        self.read_cache.clear();
        self.blocks.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{GlobalMetadata, MemoryMetadata};
    use crate::options::{ReadLevel, WriteLevel};
    use crate::ring::{EmptyRing, SingleRing};
    use crate::storage::MemoryBlockStore;

    const BLOCK_SIZE: u64 = 64;

    async fn single_node(ring: Arc<dyn Ring>) -> (Arc<Distributor>, MemoryMetadata) {
        let metadata = MemoryMetadata::new("solo", GlobalMetadata { block_size: BLOCK_SIZE }, ring);
        let blocks = Arc::new(MemoryBlockStore::new(BLOCK_SIZE, 0));
        let distributor = Distributor::new(
            Arc::new(metadata.clone()),
            blocks,
            DistributorOptions::default(),
        )
        .await
        .unwrap();
        (distributor, metadata)
    }

    fn block(fill: u8) -> Bytes {
        Bytes::from(vec![fill; BLOCK_SIZE as usize])
    }

    #[tokio::test]
    async fn test_block_size_mismatch_is_rejected() {
        let metadata = MemoryMetadata::new(
            "solo",
            GlobalMetadata { block_size: 128 },
            Arc::new(EmptyRing::new(1)),
        );
        let result = Distributor::new(
            Arc::new(metadata),
            Arc::new(MemoryBlockStore::new(BLOCK_SIZE, 0)),
            DistributorOptions::default(),
        )
        .await;
        assert!(matches!(result, Err(TorusError::Config(_))));
    }

    #[tokio::test]
    async fn test_single_node_read_write() {
        let (distributor, _) = single_node(Arc::new(SingleRing::new(1, "solo"))).await;
        let block_ref = BlockRef::new(1, 2, 3);

        distributor.write_block(block_ref, block(7)).await.unwrap();
        assert_eq!(distributor.get_block(block_ref).await.unwrap(), block(7));
        assert!(distributor.has_block(block_ref).await.unwrap());
        assert_eq!(
            distributor.local_store().get_block(block_ref).await.unwrap(),
            block(7)
        );

        for write_level in [WriteLevel::One, WriteLevel::Local] {
            let options = BlockOptions::default().write_level(write_level);
            let other = BlockRef::new(1, 2, 4);
            distributor
                .write_block_with(other, block(9), options)
                .await
                .unwrap();
            distributor.read_cache().clear();
            let read = distributor
                .get_block_with(other, BlockOptions::default().read_level(ReadLevel::Spread))
                .await
                .unwrap();
            assert_eq!(read, block(9));
        }

        assert!(matches!(
            distributor.write_block(block_ref, Bytes::from_static(b"short")).await,
            Err(TorusError::InvalidBlockSize { .. })
        ));
    }

    #[tokio::test]
    async fn test_empty_ring_has_no_peers() {
        let (distributor, _) = single_node(Arc::new(EmptyRing::new(1))).await;
        let block_ref = BlockRef::new(1, 1, 1);

        assert!(matches!(
            distributor.get_block(block_ref).await,
            Err(TorusError::NoPeersBlock)
        ));
        assert!(matches!(
            distributor.write_block(block_ref, block(1)).await,
            Err(TorusError::NoPeersBlock)
        ));
        assert!(distributor.read_cache().get(&block_ref).is_none());
    }

    #[tokio::test]
    async fn test_delete_is_local_only() {
        let (distributor, _) = single_node(Arc::new(SingleRing::new(1, "solo"))).await;
        let block_ref = BlockRef::new(1, 1, 1);

        distributor.write_block(block_ref, block(3)).await.unwrap();
        distributor.delete_block(block_ref).await.unwrap();
        assert!(!distributor.has_block(block_ref).await.unwrap());
        assert!(distributor.get_block(block_ref).await.is_err());
    }

    #[tokio::test]
    async fn test_ring_replacement_requires_newer_version() {
        let (distributor, _) = single_node(Arc::new(SingleRing::new(5, "solo"))).await;

        let stale = distributor
            .replace_ring(Arc::new(SingleRing::new(5, "solo")))
            .await;
        assert!(matches!(
            stale,
            Err(TorusError::RingVersionRegression {
                current: 5,
                proposed: 5
            })
        ));
        assert!(stale.unwrap_err().is_fatal());

        distributor
            .replace_ring(Arc::new(SingleRing::new(6, "solo")))
            .await
            .unwrap();
        assert_eq!(distributor.ring().await.version(), 6);
    }

    #[tokio::test]
    async fn test_closed_distributor_refuses_requests() {
        let (distributor, _) = single_node(Arc::new(SingleRing::new(1, "solo"))).await;
        distributor.close().await.unwrap();
        distributor.close().await.unwrap();

        assert!(matches!(
            distributor.get_block(BlockRef::new(1, 1, 1)).await,
            Err(TorusError::Closed)
        ));
        assert!(matches!(
            distributor.write_block(BlockRef::new(1, 1, 1), block(1)).await,
            Err(TorusError::Closed)
        ));
    }
}
