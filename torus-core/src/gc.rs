use crate::block::{BlockRef, VolumeId};
use crate::error::Result;
use async_trait::async_trait;

/// Classifies blocks no volume references any more.
///
/// `prep_volume` takes a liveness snapshot for one volume; `is_dead` answers
/// against the snapshots taken since the last `clear`.
#[async_trait]
pub trait GarbageCollector: Send + Sync {
    async fn prep_volume(&self, volume: VolumeId) -> Result<()>;

    fn is_dead(&self, block_ref: BlockRef) -> bool;

    fn clear(&self);
}

/// Treats every block as live.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullGarbageCollector;

#[async_trait]
impl GarbageCollector for NullGarbageCollector {
    async fn prep_volume(&self, _volume: VolumeId) -> Result<()> {
        Ok(())
    }

    fn is_dead(&self, _block_ref: BlockRef) -> bool {
        false
    }

    fn clear(&self) {}
}
