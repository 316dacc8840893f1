//! Local block storage contract and the in-memory engine.

use crate::block::BlockRef;
use crate::error::{Result, TorusError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

/// Walks the refs held by a store. Blocks written after the iterator was
/// opened may or may not be visited.
pub trait BlockIterator: Send + Sync {
    fn next_ref(&mut self) -> Option<BlockRef>;
}

/// Storage for fixed-size blocks. Implementations must tolerate concurrent
/// readers and writers.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn get_block(&self, block_ref: BlockRef) -> Result<Bytes>;

    async fn write_block(&self, block_ref: BlockRef, data: Bytes) -> Result<()>;

    async fn delete_block(&self, block_ref: BlockRef) -> Result<()>;

    async fn has_block(&self, block_ref: BlockRef) -> Result<bool>;

    async fn num_blocks(&self) -> u64;

    /// Number of occupied blocks; equal to `num_blocks` for stores without
    /// preallocation.
    async fn used_blocks(&self) -> u64;

    async fn block_iterator(&self) -> Result<Box<dyn BlockIterator>>;

    fn block_size(&self) -> u64;

    async fn flush(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Iterator over a snapshot of refs.
pub struct SnapshotIterator {
    refs: std::vec::IntoIter<BlockRef>,
}

impl SnapshotIterator {
    pub fn new(mut refs: Vec<BlockRef>) -> Self {
        refs.sort();
        Self {
            refs: refs.into_iter(),
        }
    }
}

impl BlockIterator for SnapshotIterator {
    fn next_ref(&mut self) -> Option<BlockRef> {
        self.refs.next()
    }
}

pub struct MemoryBlockStore {
    block_size: u64,
    capacity: u64,
    blocks: RwLock<HashMap<BlockRef, Bytes>>,
    closed: AtomicBool,
}

impl MemoryBlockStore {
    /// `capacity` is in blocks; zero means unbounded.
    pub fn new(block_size: u64, capacity: u64) -> Self {
        Self {
            block_size,
            capacity,
            blocks: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TorusError::Closed);
        }
        Ok(())
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get_block(&self, block_ref: BlockRef) -> Result<Bytes> {
        self.ensure_open()?;
        let blocks = self.blocks.read().await;
        blocks
            .get(&block_ref)
            .cloned()
            .ok_or(TorusError::BlockNotFound)
    }

    async fn write_block(&self, block_ref: BlockRef, data: Bytes) -> Result<()> {
        self.ensure_open()?;
        if data.len() as u64 != self.block_size {
            return Err(TorusError::InvalidBlockSize {
                expected: self.block_size as usize,
                actual: data.len(),
            });
        }

        let mut blocks = self.blocks.write().await;
        if self.capacity > 0
            && !blocks.contains_key(&block_ref)
            && blocks.len() as u64 >= self.capacity
        {
            return Err(TorusError::OutOfSpace);
        }
        blocks.insert(block_ref, data);
        Ok(())
    }

    async fn delete_block(&self, block_ref: BlockRef) -> Result<()> {
        self.ensure_open()?;
        let mut blocks = self.blocks.write().await;
        blocks.remove(&block_ref);
        Ok(())
    }

    async fn has_block(&self, block_ref: BlockRef) -> Result<bool> {
        self.ensure_open()?;
        let blocks = self.blocks.read().await;
        Ok(blocks.contains_key(&block_ref))
    }

    async fn num_blocks(&self) -> u64 {
        if self.capacity > 0 {
            return self.capacity;
        }
        self.used_blocks().await
    }

    async fn used_blocks(&self) -> u64 {
        self.blocks.read().await.len() as u64
    }

    async fn block_iterator(&self) -> Result<Box<dyn BlockIterator>> {
        self.ensure_open()?;
        let refs = self.blocks.read().await.keys().copied().collect();
        Ok(Box::new(SnapshotIterator::new(refs)))
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }

    async fn flush(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}
