use super::Rebalancer;
use crate::distributor::Distributor;
use crate::gc::GarbageCollector;
use crate::options::RebalanceOptions;
use crate::peer::RebalanceInfo;
use crate::storage::BlockStore;
use chrono::Utc;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Runs rebalance passes until cancelled. Ticks run one at a time.
pub struct RebalanceDriver {
    rebalancer: Rebalancer,
    distributor: Arc<Distributor>,
    gc: Arc<dyn GarbageCollector>,
    options: RebalanceOptions,
    shutdown: CancellationToken,
    /// Ring version the last pass finished on without the ring moving.
    converged_version: Option<u64>,
}

impl RebalanceDriver {
    pub fn new(
        distributor: Arc<Distributor>,
        gc: Arc<dyn GarbageCollector>,
        options: RebalanceOptions,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            rebalancer: Rebalancer::new(Arc::clone(&distributor), Arc::clone(&gc), options.batch_size),
            distributor,
            gc,
            options,
            shutdown,
            converged_version: None,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("Rebalance loop started for {}", self.distributor.uuid());

        loop {
            self.prepare_gc().await;

            let Some(pass_blocks) = self.run_pass().await else {
                break;
            };

            let ring_version = self.distributor.ring().await.version();
            let converged = ring_version == self.rebalancer.pass_ring_version();
            if converged {
                self.converged_version = Some(ring_version);
            }
            self.distributor
                .set_rebalance_info(RebalanceInfo {
                    rebalancing: !converged,
                    last_rebalance_blocks: pass_blocks,
                    last_rebalance_bytes: pass_blocks * self.distributor.local_store().block_size(),
                    last_rebalance_finish: Some(Utc::now()),
                })
                .await;

            tracing::info!(
                "Rebalance pass on {} finished: {} blocks migrated, ring v{}{}",
                self.distributor.uuid(),
                pass_blocks,
                ring_version,
                if converged { "" } else { " (ring changed during pass)" }
            );

            if !self.sleep(pass_delay(&self.options, converged)).await {
                break;
            }
        }

        tracing::info!("Rebalance loop stopped for {}", self.distributor.uuid());
    }

    /// Liveness snapshots for every volume. Any failure leaves the whole
    /// pass treating every block as live.
    async fn prepare_gc(&mut self) {
        self.gc.clear();

        let volumes = match self.distributor.metadata().get_volumes().await {
            Ok(volumes) => volumes,
            Err(error) => {
                tracing::warn!("Failed to list volumes for GC: {}", error);
                self.rebalancer.set_gc_trusted(false);
                return;
            }
        };

        let mut trusted = true;
        for volume in volumes {
            if let Err(error) = self.gc.prep_volume(volume).await {
                tracing::warn!("GC prep for volume {} failed: {}", volume, error);
                trusted = false;
            }
        }
        self.rebalancer.set_gc_trusted(trusted);
    }

    /// Blocks migrated during the pass, or `None` once cancelled.
    async fn run_pass(&mut self) -> Option<u64> {
        let mut pass_blocks = 0u64;
        let mut announced = false;

        loop {
            let outcome = tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                outcome = self.rebalancer.tick() => outcome,
            };

            if !announced && self.rebalancer.in_pass() {
                announced = true;
                self.announce_pass().await;
            }

            let delay = match outcome {
                Ok(outcome) => {
                    pass_blocks += outcome.migrated as u64;
                    if outcome.pass_complete {
                        return Some(pass_blocks);
                    }
                    self.options.tick_delay(outcome.migrated)
                }
                Err(error) => {
                    tracing::warn!("Rebalance tick failed: {}", error);
                    self.options.tick_delay(0)
                }
            };

            if !self.sleep(delay).await {
                return None;
            }
        }
    }

    /// Flags the pass in progress when it runs on a ring the last pass did
    /// not converge on.
    async fn announce_pass(&self) {
        let version = self.rebalancer.pass_ring_version();
        if self.converged_version == Some(version) {
            return;
        }

        let mut info = self.distributor.rebalance_info().await;
        if !info.rebalancing {
            info.rebalancing = true;
            self.distributor.set_rebalance_info(info).await;
            tracing::info!(
                "Rebalancing {} towards ring v{}",
                self.distributor.uuid(),
                version
            );
        }
    }

    /// False when cancelled during the wait.
    async fn sleep(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

/// Cooldown plus random jitter, so peers do not pass in lockstep. A pass
/// that saw the ring change is followed quickly by another.
fn pass_delay(options: &RebalanceOptions, converged: bool) -> Duration {
    let jitter = if options.pass_jitter_ms > 0 {
        rand::thread_rng().gen_range(0..=options.pass_jitter_ms)
    } else {
        0
    };
    let base = if converged {
        options.pass_cooldown_ms
    } else {
        options.min_tick_delay_ms
    };
    Duration::from_millis(base + jitter)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockRef, VolumeId};
    use crate::error::{Result, TorusError};
    use crate::metadata::{GlobalMetadata, MemoryMetadata};
    use crate::options::DistributorOptions;
    use crate::ring::SingleRing;
    use crate::storage::{BlockStore, MemoryBlockStore};
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingGc {
        preps: AtomicUsize,
    }

    #[async_trait]
    impl GarbageCollector for FailingGc {
        async fn prep_volume(&self, _volume: VolumeId) -> Result<()> {
            self.preps.fetch_add(1, Ordering::SeqCst);
            Err(TorusError::Internal("snapshot unavailable".to_string()))
        }

        fn is_dead(&self, _block_ref: BlockRef) -> bool {
            true
        }

        fn clear(&self) {}
    }

    fn fast_options() -> RebalanceOptions {
        RebalanceOptions {
            idle_tick_delay_ms: 5,
            min_tick_delay_ms: 1,
            pass_cooldown_ms: 5,
            pass_jitter_ms: 5,
            ..RebalanceOptions::default()
        }
    }

    #[tokio::test]
    async fn test_failed_gc_prep_deletes_nothing() {
        let metadata = MemoryMetadata::new(
            "solo",
            GlobalMetadata { block_size: 16 },
            Arc::new(SingleRing::new(1, "solo")),
        );
        metadata.add_volume(1).await;
        metadata.add_volume(2).await;

        let distributor = Distributor::new(
            Arc::new(metadata),
            Arc::new(MemoryBlockStore::new(16, 0)),
            DistributorOptions::default(),
        )
        .await
        .unwrap();
        for i in 0..5 {
            distributor
                .write_block(BlockRef::new(1, 1, i), Bytes::from(vec![4u8; 16]))
                .await
                .unwrap();
        }

        let gc = Arc::new(FailingGc {
            preps: AtomicUsize::new(0),
        });
        let shutdown = CancellationToken::new();
        let driver = RebalanceDriver::new(
            Arc::clone(&distributor),
            Arc::clone(&gc) as Arc<dyn GarbageCollector>,
            fast_options(),
            shutdown.clone(),
        );
        let task = tokio::spawn(driver.run());

        for _ in 0..200 {
            if distributor.rebalance_info().await.last_rebalance_finish.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        let info = distributor.rebalance_info().await;
        assert!(info.last_rebalance_finish.is_some());
        assert!(!info.rebalancing);
        assert!(gc.preps.load(Ordering::SeqCst) >= 2);
        assert_eq!(distributor.local_store().used_blocks().await, 5);
    }

    #[tokio::test]
    async fn test_rebalancing_flag_is_set_while_a_new_ring_is_reconciled() {
        let metadata = MemoryMetadata::new(
            "solo",
            GlobalMetadata { block_size: 16 },
            Arc::new(SingleRing::new(1, "solo")),
        );
        let distributor = Distributor::new(
            Arc::new(metadata),
            Arc::new(MemoryBlockStore::new(16, 0)),
            DistributorOptions::default(),
        )
        .await
        .unwrap();
        for i in 0..20 {
            distributor
                .write_block(BlockRef::new(1, 1, i), Bytes::from(vec![1u8; 16]))
                .await
                .unwrap();
        }

        let options = RebalanceOptions {
            batch_size: 1,
            idle_tick_delay_ms: 10,
            min_tick_delay_ms: 10,
            pass_cooldown_ms: 1_000,
            pass_jitter_ms: 0,
            ..RebalanceOptions::default()
        };
        let shutdown = CancellationToken::new();
        let driver = RebalanceDriver::new(
            Arc::clone(&distributor),
            Arc::new(crate::gc::NullGarbageCollector),
            options,
            shutdown.clone(),
        );
        let task = tokio::spawn(driver.run());

        let mut first_finish = None;
        for _ in 0..600 {
            let info = distributor.rebalance_info().await;
            if info.last_rebalance_finish.is_some() {
                assert!(!info.rebalancing);
                first_finish = info.last_rebalance_finish;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(first_finish.is_some(), "first pass never finished");

        distributor
            .replace_ring(Arc::new(SingleRing::new(2, "solo")))
            .await
            .unwrap();

        let mut seen_rebalancing = false;
        for _ in 0..1_500 {
            if distributor.rebalance_info().await.rebalancing {
                seen_rebalancing = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        assert!(seen_rebalancing);

        let mut settled = None;
        for _ in 0..600 {
            let info = distributor.rebalance_info().await;
            if !info.rebalancing && info.last_rebalance_finish > first_finish {
                settled = Some(info);
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        task.await.unwrap();

        let info = settled.expect("second pass never converged");
        assert_eq!(info.last_rebalance_blocks, 0);
        assert_eq!(info.last_rebalance_bytes, 0);
    }

    #[test]
    fn test_pass_delay_bounds() {
        let options = RebalanceOptions {
            pass_cooldown_ms: 100,
            pass_jitter_ms: 50,
            min_tick_delay_ms: 1,
            ..RebalanceOptions::default()
        };
        for _ in 0..20 {
            let delay = pass_delay(&options, true);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(150));

            let delay = pass_delay(&options, false);
            assert!(delay <= Duration::from_millis(51));
        }

        let steady = RebalanceOptions {
            pass_jitter_ms: 0,
            ..options
        };
        assert_eq!(pass_delay(&steady, true), Duration::from_millis(100));
    }
}
