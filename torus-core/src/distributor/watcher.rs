use super::Distributor;
use crate::error::Result;
use crate::metadata::RingEvent;
use crate::ring::Ring;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Follows ring updates from metadata and swaps them into the distributor.
///
/// A ring that is not newer than the active one means metadata can no longer
/// be trusted: the watcher cancels the whole node and returns the error.
pub struct RingWatcher {
    distributor: Arc<Distributor>,
    shutdown: CancellationToken,
}

impl RingWatcher {
    pub fn new(distributor: Arc<Distributor>, shutdown: CancellationToken) -> Self {
        Self {
            distributor,
            shutdown,
        }
    }

    pub async fn run(self) -> Result<()> {
        let metadata = Arc::clone(self.distributor.metadata());
        let mut subscription = metadata.subscribe_new_rings();

        // Catch up with anything published before the subscription existed.
        // Announcements already buffered on the subscription may trail it.
        let mut caught_up = None;
        match metadata.get_ring().await {
            Ok(ring) => {
                let version = ring.version();
                self.observe(ring, true).await?;
                caught_up = Some(version);
            }
            Err(error) => tracing::warn!("Failed to read ring at watcher start: {}", error),
        }

        loop {
            let event = tokio::select! {
                _ = self.shutdown.cancelled() => return Ok(()),
                event = subscription.recv() => event,
            };

            match event {
                Some(RingEvent::NewRing(ring)) => {
                    if let Some(version) = caught_up {
                        if ring.version() <= version {
                            tracing::debug!(
                                "Skipping ring v{} announced before catching up to v{}",
                                ring.version(),
                                version
                            );
                            continue;
                        }
                    }
                    caught_up = None;
                    self.observe(ring, false).await?;
                }
                Some(RingEvent::Missed) => match metadata.get_ring().await {
                    Ok(ring) => {
                        let version = ring.version();
                        self.observe(ring, true).await?;
                        caught_up = Some(version);
                    }
                    Err(error) => {
                        tracing::warn!("Failed to re-read ring after missed updates: {}", error);
                    }
                },
                None => {
                    tracing::info!("Ring updates closed, watcher for {} exiting", self.distributor.uuid());
                    return Ok(());
                }
            }
        }
    }

    /// Adopts `ring`, returning whether it replaced the active one. Rings
    /// must be strictly newer unless `may_repeat` allows the active version.
    async fn observe(&self, ring: Arc<dyn Ring>, may_repeat: bool) -> Result<bool> {
        let current = self.distributor.ring().await.version();
        if may_repeat && ring.version() == current {
            return Ok(false);
        }

        if let Err(error) = self.distributor.replace_ring(ring).await {
            tracing::error!(
                "Refusing ring update on {}, shutting down: {}",
                self.distributor.uuid(),
                error
            );
            self.shutdown.cancel();
            return Err(error);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::VolumeId;
    use crate::error::TorusError;
    use crate::metadata::{GlobalMetadata, MemoryMetadata, MetadataService, RingSubscription};
    use crate::options::DistributorOptions;
    use crate::peer::{PeerInfo, PeerInfoList};
    use crate::ring::SingleRing;
    use crate::storage::MemoryBlockStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Publishes v2 then v3 while the watcher is catching up, so both
    /// announcements sit on its subscription behind the ring it reads.
    struct RacingMetadata {
        inner: MemoryMetadata,
        armed: AtomicBool,
    }

    #[async_trait]
    impl MetadataService for RacingMetadata {
        fn uuid(&self) -> &str {
            self.inner.uuid()
        }

        async fn global_metadata(&self) -> Result<GlobalMetadata> {
            self.inner.global_metadata().await
        }

        async fn get_ring(&self) -> Result<Arc<dyn Ring>> {
            if self.armed.swap(false, Ordering::SeqCst) {
                self.inner.set_ring(Arc::new(SingleRing::new(2, "solo"))).await?;
                self.inner.set_ring(Arc::new(SingleRing::new(3, "solo"))).await?;
            }
            self.inner.get_ring().await
        }

        async fn set_ring(&self, ring: Arc<dyn Ring>) -> Result<()> {
            self.inner.set_ring(ring).await
        }

        fn subscribe_new_rings(&self) -> RingSubscription {
            self.inner.subscribe_new_rings()
        }

        async fn get_peers(&self) -> Result<PeerInfoList> {
            self.inner.get_peers().await
        }

        async fn register_peer(&self, info: PeerInfo) -> Result<()> {
            self.inner.register_peer(info).await
        }

        async fn get_lease(&self) -> Result<i64> {
            self.inner.get_lease().await
        }

        async fn get_volumes(&self) -> Result<Vec<VolumeId>> {
            self.inner.get_volumes().await
        }
    }

    async fn wait_for_version(distributor: &Distributor, version: u64) {
        for _ in 0..200 {
            if distributor.ring().await.version() == version {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("ring never reached v{}", version);
    }

    #[tokio::test]
    async fn test_updates_during_catch_up_are_not_regressions() {
        let inner = MemoryMetadata::new(
            "solo",
            GlobalMetadata { block_size: 16 },
            Arc::new(SingleRing::new(1, "solo")),
        );
        let metadata = Arc::new(RacingMetadata {
            inner: inner.clone(),
            armed: AtomicBool::new(false),
        });
        let distributor = Distributor::new(
            Arc::clone(&metadata) as Arc<dyn MetadataService>,
            Arc::new(MemoryBlockStore::new(16, 0)),
            DistributorOptions::default(),
        )
        .await
        .unwrap();
        metadata.armed.store(true, Ordering::SeqCst);

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(RingWatcher::new(Arc::clone(&distributor), shutdown.clone()).run());

        wait_for_version(&distributor, 3).await;
        inner.set_ring(Arc::new(SingleRing::new(4, "solo"))).await.unwrap();
        wait_for_version(&distributor, 4).await;
        assert!(!shutdown.is_cancelled());

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_live_regression_stops_the_node() {
        let inner = MemoryMetadata::new(
            "solo",
            GlobalMetadata { block_size: 16 },
            Arc::new(SingleRing::new(1, "solo")),
        );
        let distributor = Distributor::new(
            Arc::new(inner.clone()),
            Arc::new(MemoryBlockStore::new(16, 0)),
            DistributorOptions::default(),
        )
        .await
        .unwrap();

        let shutdown = CancellationToken::new();
        let task = tokio::spawn(RingWatcher::new(Arc::clone(&distributor), shutdown.clone()).run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        // The local view runs ahead of metadata, so the next live
        // announcement is older than what the node serves.
        distributor
            .replace_ring(Arc::new(SingleRing::new(5, "solo")))
            .await
            .unwrap();
        inner.set_ring(Arc::new(SingleRing::new(2, "solo"))).await.unwrap();

        let result = task.await.unwrap();
        assert!(matches!(
            result,
            Err(TorusError::RingVersionRegression {
                current: 5,
                proposed: 2
            })
        ));
        assert!(shutdown.is_cancelled());
    }
}
