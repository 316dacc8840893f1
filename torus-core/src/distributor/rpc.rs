use super::Distributor;
use crate::block::BlockRef;
use crate::error::{Result, TorusError};
use crate::protocol::RequestHandler;
use async_trait::async_trait;
use bytes::Bytes;

#[async_trait]
impl RequestHandler for Distributor {
    async fn block(&self, block_ref: BlockRef) -> Result<Bytes> {
        self.ensure_open()?;
        self.blocks.get_block(block_ref).await.map_err(|error| {
            tracing::debug!("Peer asked for {} which is not here: {}", block_ref, error);
            TorusError::BlockUnavailable
        })
    }

    async fn put_block(&self, block_ref: BlockRef, data: Bytes) -> Result<()> {
        self.ensure_open()?;

        let ring = self.ring().await;
        match ring.get_peers(block_ref) {
            Ok(permutation) if permutation.is_desired(&self.uuid) => {}
            Ok(_) => {
                tracing::warn!(
                    "Accepting block {} not placed here by ring v{}",
                    block_ref,
                    ring.version()
                );
            }
            Err(error) => {
                tracing::warn!("Ring lookup for incoming block {} failed: {}", block_ref, error);
            }
        }

        self.read_cache.remove(&block_ref);
        self.blocks.write_block(block_ref, data).await?;
        self.blocks.flush().await
    }

    async fn rebalance_check(&self, refs: &[BlockRef]) -> Result<Vec<bool>> {
        self.ensure_open()?;

        let mut present = Vec::with_capacity(refs.len());
        for block_ref in refs {
            present.push(self.blocks.has_block(*block_ref).await?);
        }
        Ok(present)
    }
}
