use super::Distributor;
use crate::block::BlockRef;
use crate::error::{Result, TorusError};
use crate::options::{BlockOptions, ReadLevel, WriteLevel};
use crate::ring::PeerPermutation;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const MAX_READ_ATTEMPTS: u32 = 10;
const READ_BACKOFF_BASE: Duration = Duration::from_millis(10);

impl Distributor {
    pub async fn get_block_with(&self, block_ref: BlockRef, options: BlockOptions) -> Result<Bytes> {
        self.ensure_open()?;

        if let Some(data) = self.read_cache.get(&block_ref) {
            return Ok(data);
        }

        let permutation = self.ring().await.get_peers(block_ref)?;
        if permutation.is_empty() {
            return Err(TorusError::NoPeersBlock);
        }

        let write_level = options.write_level.unwrap_or(self.options.write_level);
        let mut tried_local = false;
        if write_level == WriteLevel::Local || permutation.is_desired(&self.uuid) {
            tried_local = true;
            match self.blocks.get_block(block_ref).await {
                Ok(data) => return Ok(data),
                Err(error) => {
                    tracing::debug!("Local read of {} missed: {}", block_ref, error);
                }
            }
        }

        let read_level = options.read_level.unwrap_or(self.options.read_level);
        let result = match read_level {
            ReadLevel::Block => self.read_with_backoff(block_ref, &permutation).await,
            ReadLevel::Sequential => self.read_sequential(block_ref, &permutation).await,
            ReadLevel::Spread => self.read_spread(block_ref, &permutation).await,
        };

        match result {
            Ok(data) => {
                self.read_cache.put(&block_ref, data.clone());
                Ok(data)
            }
            Err(error) => {
                // A copy held outside the desired set, e.g. awaiting migration.
                if !tried_local {
                    if let Ok(data) = self.blocks.get_block(block_ref).await {
                        tracing::debug!("Serving {} from a local copy outside its replica set", block_ref);
                        return Ok(data);
                    }
                }
                Err(error)
            }
        }
    }

    pub(super) fn remote_peers<'a>(&self, peers: &'a [String]) -> Vec<&'a String> {
        peers.iter().filter(|peer| **peer != self.uuid).collect()
    }

    /// Walks the whole permutation per attempt, doubling both the per-peer
    /// timeout and the pause between attempts.
    async fn read_with_backoff(
        &self,
        block_ref: BlockRef,
        permutation: &PeerPermutation,
    ) -> Result<Bytes> {
        let peers = self.remote_peers(&permutation.peers);
        if peers.is_empty() {
            return Err(TorusError::NoPeer);
        }

        let mut timeout = self.options.timeouts.op();
        let mut backoff = READ_BACKOFF_BASE;
        for attempt in 0..MAX_READ_ATTEMPTS {
            for peer in &peers {
                match self.client.get_block(peer, block_ref, timeout).await {
                    Ok(data) => return Ok(data),
                    Err(error) => {
                        tracing::debug!(
                            "Read of {} from {} failed (attempt {}): {}",
                            block_ref,
                            peer,
                            attempt + 1,
                            error
                        );
                    }
                }
            }

            if attempt + 1 < MAX_READ_ATTEMPTS {
                tokio::time::sleep(backoff).await;
                backoff *= 2;
                timeout *= 2;
            }
        }

        tracing::warn!(
            "Block {} unavailable after {} attempts over {} peers",
            block_ref,
            MAX_READ_ATTEMPTS,
            peers.len()
        );
        Err(TorusError::BlockUnavailable)
    }

    async fn read_sequential(
        &self,
        block_ref: BlockRef,
        permutation: &PeerPermutation,
    ) -> Result<Bytes> {
        let peers = self.remote_peers(&permutation.peers);
        if peers.is_empty() {
            return Err(TorusError::NoPeer);
        }

        let timeout = self.options.timeouts.op();
        for peer in peers {
            match self.client.get_block(peer, block_ref, timeout).await {
                Ok(data) => return Ok(data),
                Err(error) if error.is_peer_miss() => {
                    tracing::debug!("Read of {} from {} missed: {}", block_ref, peer, error);
                }
                Err(error) => return Err(error),
            }
        }
        Err(TorusError::BlockUnavailable)
    }

    /// Asks every desired replica at once; the first answer wins and the
    /// stragglers finish on their own.
    async fn read_spread(
        &self,
        block_ref: BlockRef,
        permutation: &PeerPermutation,
    ) -> Result<Bytes> {
        let peers = self.remote_peers(permutation.desired());
        if peers.is_empty() {
            return Err(TorusError::NoPeer);
        }

        let timeout = self.options.timeouts.op();
        let (tx, mut rx) = mpsc::channel(peers.len());
        for peer in &peers {
            let client = Arc::clone(&self.client);
            let peer = (*peer).clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = client.get_block(&peer, block_ref, timeout).await;
                // The reader may already have its answer.
                let _ = tx.send((peer, result)).await;
            });
        }
        drop(tx);

        let mut failures = 0;
        while let Some((peer, result)) = rx.recv().await {
            match result {
                Ok(data) => return Ok(data),
                Err(error) => {
                    failures += 1;
                    tracing::debug!("Spread read of {} from {} failed: {}", block_ref, peer, error);
                }
            }
        }

        tracing::debug!("Spread read of {} failed on all {} replicas", block_ref, failures);
        Err(TorusError::BlockUnavailable)
    }
}
