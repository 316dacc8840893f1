use super::Distributor;
use crate::block::BlockRef;
use crate::error::{Result, TorusError};
use crate::options::{BlockOptions, WriteLevel};
use crate::ring::PeerPermutation;
use bytes::Bytes;
use futures::future::join_all;

impl Distributor {
    pub async fn write_block_with(
        &self,
        block_ref: BlockRef,
        data: Bytes,
        options: BlockOptions,
    ) -> Result<()> {
        self.ensure_open()?;
        self.check_block_size(&data)?;

        let permutation = self.ring().await.get_peers(block_ref)?;
        if permutation.is_empty() {
            return Err(TorusError::NoPeersBlock);
        }

        self.read_cache.put(&block_ref, data.clone());

        let write_level = options.write_level.unwrap_or(self.options.write_level);
        let result = match write_level {
            WriteLevel::Local => match self.blocks.write_block(block_ref, data.clone()).await {
                Ok(()) => Ok(()),
                Err(error) => {
                    tracing::warn!(
                        "Local write of {} failed, falling back to any replica: {}",
                        block_ref,
                        error
                    );
                    self.write_one(block_ref, data, &permutation).await
                }
            },
            WriteLevel::One => self.write_one(block_ref, data, &permutation).await,
            WriteLevel::All => self.write_all(block_ref, data, &permutation).await,
        };

        if result.is_err() {
            self.read_cache.remove(&block_ref);
        }
        result
    }

    async fn write_one(
        &self,
        block_ref: BlockRef,
        data: Bytes,
        permutation: &PeerPermutation,
    ) -> Result<()> {
        if permutation.is_desired(&self.uuid) {
            match self.blocks.write_block(block_ref, data.clone()).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::warn!("Local write of {} failed: {}", block_ref, error);
                }
            }
        }

        let timeout = self.options.timeouts.write();
        for peer in self.remote_peers(&permutation.peers) {
            match self.client.put_block(peer, block_ref, &data, timeout).await {
                Ok(()) => return Ok(()),
                Err(error) => {
                    tracing::debug!("Write of {} to {} failed: {}", block_ref, peer, error);
                }
            }
        }

        tracing::warn!("No peer accepted block {}", block_ref);
        Err(TorusError::NoPeer)
    }

    /// Every desired replica is attempted; one acceptance is enough.
    async fn write_all(
        &self,
        block_ref: BlockRef,
        data: Bytes,
        permutation: &PeerPermutation,
    ) -> Result<()> {
        let desired = permutation.desired();
        let timeout = self.options.timeouts.write();

        let writes = desired.iter().map(|peer| {
            let data = data.clone();
            async move {
                let result = if *peer == self.uuid {
                    self.blocks.write_block(block_ref, data).await
                } else {
                    self.client.put_block(peer, block_ref, &data, timeout).await
                };
                (peer, result)
            }
        });

        let mut accepted = 0;
        for (peer, result) in join_all(writes).await {
            match result {
                Ok(()) => accepted += 1,
                Err(error) => {
                    tracing::debug!("Write of {} to {} failed: {}", block_ref, peer, error);
                }
            }
        }

        if accepted == 0 {
            tracing::warn!("No replica accepted block {}", block_ref);
            return Err(TorusError::NoPeer);
        }
        if accepted < desired.len() {
            tracing::warn!(
                "Block {} written to {}/{} replicas",
                block_ref,
                accepted,
                desired.len()
            );
        }
        Ok(())
    }
}
