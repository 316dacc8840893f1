//! Reconciles the blocks held locally with the placement the ring asks for.
//!
//! Each tick pulls one batch of local refs, pushes them to desired peers that
//! lack them, and deletes local copies that are dead or confirmed replicated
//! everywhere they belong.

mod driver;

pub use driver::RebalanceDriver;

use crate::block::BlockRef;
use crate::distributor::Distributor;
use crate::error::Result;
use crate::gc::GarbageCollector;
use crate::storage::BlockIterator;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickOutcome {
    pub migrated: usize,
    pub deleted: usize,
    /// The local iterator is exhausted; the next tick starts a new pass.
    pub pass_complete: bool,
}

pub struct Rebalancer {
    distributor: Arc<Distributor>,
    gc: Arc<dyn GarbageCollector>,
    batch_size: usize,
    iterator: Option<Box<dyn BlockIterator>>,
    pass_ring_version: u64,
    gc_trusted: bool,
}

impl Rebalancer {
    pub fn new(
        distributor: Arc<Distributor>,
        gc: Arc<dyn GarbageCollector>,
        batch_size: usize,
    ) -> Self {
        Self {
            distributor,
            gc,
            batch_size: batch_size.max(1),
            iterator: None,
            pass_ring_version: 0,
            gc_trusted: true,
        }
    }

    /// Ring version seen when the current or last pass started.
    pub fn pass_ring_version(&self) -> u64 {
        self.pass_ring_version
    }

    pub fn in_pass(&self) -> bool {
        self.iterator.is_some()
    }

    /// When false, nothing is deleted as dead: the liveness snapshot for this
    /// pass is incomplete.
    pub fn set_gc_trusted(&mut self, trusted: bool) {
        self.gc_trusted = trusted;
    }

    pub async fn tick(&mut self) -> Result<TickOutcome> {
        if self.iterator.is_none() {
            let ring = self.distributor.ring().await;
            self.pass_ring_version = ring.version();
            self.iterator = Some(self.distributor.local_store().block_iterator().await?);
            tracing::debug!(
                "Rebalance pass starting on {} at ring v{}",
                self.distributor.uuid(),
                self.pass_ring_version
            );
        }

        let mut batch = Vec::with_capacity(self.batch_size);
        let mut exhausted = false;
        if let Some(iterator) = self.iterator.as_mut() {
            while batch.len() < self.batch_size {
                match iterator.next_ref() {
                    Some(block_ref) => batch.push(block_ref),
                    None => {
                        exhausted = true;
                        break;
                    }
                }
            }
        }

        let outcome = self.rebalance_batch(&batch).await;
        if exhausted {
            self.iterator = None;
        }

        Ok(TickOutcome {
            pass_complete: exhausted,
            ..outcome
        })
    }

    async fn rebalance_batch(&self, batch: &[BlockRef]) -> TickOutcome {
        let uuid = self.distributor.uuid();
        let ring = self.distributor.ring().await;
        let local = self.distributor.local_store();

        // Dead blocks go regardless of placement. Pending ones go only once
        // every desired peer is confirmed to hold them.
        let mut dead = BTreeSet::new();
        let mut pending_delete = BTreeSet::new();
        let mut outbound: BTreeMap<String, Vec<BlockRef>> = BTreeMap::new();

        for block_ref in batch {
            if self.gc_trusted && self.gc.is_dead(*block_ref) {
                dead.insert(*block_ref);
                continue;
            }

            let permutation = match ring.get_peers(*block_ref) {
                Ok(permutation) => permutation,
                Err(error) => {
                    tracing::warn!("Ring lookup for {} failed: {}", block_ref, error);
                    continue;
                }
            };
            if permutation.is_empty() {
                continue;
            }

            if !permutation.is_desired(uuid) {
                pending_delete.insert(*block_ref);
            }
            for peer in permutation.desired().iter().filter(|peer| *peer != uuid) {
                outbound.entry(peer.clone()).or_default().push(*block_ref);
            }
        }

        let client = self.distributor.client();
        let timeout = client.timeouts().rebalance();
        let mut migrated = 0;

        for (peer, refs) in &outbound {
            let present = match client.rebalance_check(peer, refs, timeout).await {
                Ok(present) => present,
                Err(error) => {
                    tracing::warn!(
                        "Rebalance check of {} blocks with {} failed: {}",
                        refs.len(),
                        peer,
                        error
                    );
                    for block_ref in refs {
                        pending_delete.remove(block_ref);
                    }
                    continue;
                }
            };

            for (block_ref, has) in refs.iter().zip(present) {
                if has {
                    continue;
                }

                let data = match local.get_block(*block_ref).await {
                    Ok(data) => data,
                    Err(error) => {
                        tracing::warn!("Failed to read {} for migration: {}", block_ref, error);
                        pending_delete.remove(block_ref);
                        continue;
                    }
                };

                match client.put_block(peer, *block_ref, &data, timeout).await {
                    Ok(()) => migrated += 1,
                    Err(error) => {
                        tracing::warn!("Failed to migrate {} to {}: {}", block_ref, peer, error);
                        pending_delete.remove(block_ref);
                    }
                }
            }
        }

        let mut deleted = 0;
        for block_ref in dead.iter().chain(pending_delete.iter()) {
            match local.delete_block(*block_ref).await {
                Ok(()) => deleted += 1,
                Err(error) => tracing::warn!("Failed to delete {}: {}", block_ref, error),
            }
        }
        if deleted > 0 {
            if let Err(error) = local.flush().await {
                tracing::warn!("Flush after rebalance deletes failed: {}", error);
            }
        }

        if migrated > 0 || deleted > 0 {
            tracing::debug!(
                "Rebalance tick on {}: migrated {}, deleted {} ({} dead)",
                uuid,
                migrated,
                deleted,
                dead.len()
            );
        }

        TickOutcome {
            migrated,
            deleted,
            pass_complete: false,
        }
    }
}
