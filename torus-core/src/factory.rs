//! Backend selection for the pluggable collaborators.

use crate::block::VolumeId;
use crate::error::{Result, TorusError};
use crate::metadata::{GlobalMetadata, MemoryMetadata, MetadataService};
use crate::peer::PeerInfo;
use crate::ring::{EmptyRing, ModRing, Ring, SingleRing};
use crate::storage::{BlockStore, MemoryBlockStore};
use std::sync::Arc;

fn resolve_backend(kind: &str, backend: Option<&str>) -> Result<String> {
    let backend = backend.unwrap_or_default().trim().to_ascii_lowercase();
    if backend.is_empty() {
        return Err(TorusError::Config(format!("{} backend cannot be empty", kind)));
    }
    Ok(backend)
}

#[derive(Debug, Clone, Default)]
pub struct BlockStoreBuilder {
    backend: Option<String>,
    block_size: Option<u64>,
    capacity_blocks: Option<u64>,
}

impl BlockStoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = Some(block_size);
        self
    }

    /// Zero means unbounded.
    pub fn capacity_blocks(mut self, capacity: u64) -> Self {
        self.capacity_blocks = Some(capacity);
        self
    }

    pub fn build(&self) -> Result<Arc<dyn BlockStore>> {
        let backend = resolve_backend("block store", self.backend.as_deref())?;
        let block_size = self
            .block_size
            .filter(|size| *size > 0)
            .ok_or_else(|| TorusError::Config("block size must be positive".to_string()))?;

        match backend.as_str() {
            "memory" => Ok(Arc::new(MemoryBlockStore::new(
                block_size,
                self.capacity_blocks.unwrap_or(0),
            ))),
            _ => Err(TorusError::Config(format!(
                "unsupported block store backend: {}",
                backend
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RingBuilder {
    backend: Option<String>,
    version: Option<u64>,
    members: Vec<String>,
    replication: Option<usize>,
}

impl RingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn members(mut self, members: Vec<String>) -> Self {
        self.members = members;
        self
    }

    pub fn replication(mut self, replication: usize) -> Self {
        self.replication = Some(replication);
        self
    }

    pub fn build(&self) -> Result<Arc<dyn Ring>> {
        let backend = resolve_backend("ring", self.backend.as_deref())?;
        let version = self.version.unwrap_or(1);

        match backend.as_str() {
            "empty" => Ok(Arc::new(EmptyRing::new(version))),
            "single" => match self.members.as_slice() {
                [peer] => Ok(Arc::new(SingleRing::new(version, peer.clone()))),
                _ => Err(TorusError::Config(format!(
                    "single ring needs exactly one member, got {}",
                    self.members.len()
                ))),
            },
            "mod" => {
                if self.members.is_empty() {
                    return Err(TorusError::Config(
                        "mod ring needs at least one member".to_string(),
                    ));
                }
                let replication = self.replication.unwrap_or(2);
                Ok(Arc::new(ModRing::new(
                    version,
                    self.members.clone(),
                    replication,
                )?))
            }
            _ => Err(TorusError::Config(format!(
                "unsupported ring backend: {}",
                backend
            ))),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MetadataBuilder {
    backend: Option<String>,
    uuid: Option<String>,
    block_size: Option<u64>,
    ring: Option<Arc<dyn Ring>>,
    peers: Vec<PeerInfo>,
    volumes: Vec<VolumeId>,
}

impl MetadataBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn block_size(mut self, block_size: u64) -> Self {
        self.block_size = Some(block_size);
        self
    }

    pub fn ring(mut self, ring: Arc<dyn Ring>) -> Self {
        self.ring = Some(ring);
        self
    }

    pub fn peers(mut self, peers: Vec<PeerInfo>) -> Self {
        self.peers = peers;
        self
    }

    pub fn volumes(mut self, volumes: Vec<VolumeId>) -> Self {
        self.volumes = volumes;
        self
    }

    pub async fn build(&self) -> Result<Arc<dyn MetadataService>> {
        let backend = resolve_backend("metadata", self.backend.as_deref())?;
        let uuid = self
            .uuid
            .as_deref()
            .map(str::trim)
            .filter(|uuid| !uuid.is_empty())
            .ok_or_else(|| TorusError::Config("node uuid cannot be empty".to_string()))?;
        let block_size = self
            .block_size
            .filter(|size| *size > 0)
            .ok_or_else(|| TorusError::Config("block size must be positive".to_string()))?;

        match backend.as_str() {
            "memory" => {
                let ring = self
                    .ring
                    .clone()
                    .unwrap_or_else(|| Arc::new(EmptyRing::new(1)) as Arc<dyn Ring>);
                let metadata = MemoryMetadata::new(uuid, GlobalMetadata { block_size }, ring);
                for peer in &self.peers {
                    metadata.seed_peer(peer.clone()).await;
                }
                for volume in &self.volumes {
                    metadata.add_volume(*volume).await;
                }
                Ok(Arc::new(metadata))
            }
            _ => Err(TorusError::Config(format!(
                "unsupported metadata backend: {}",
                backend
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::BlockRef;

    #[test]
    fn test_ring_builder_backends() {
        let ring = RingBuilder::new()
            .backend(" MOD ")
            .version(3)
            .members(vec!["c".into(), "a".into(), "b".into()])
            .replication(2)
            .build()
            .unwrap();
        assert_eq!(ring.version(), 3);
        assert_eq!(ring.get_peers(BlockRef::new(1, 1, 1)).unwrap().desired().len(), 2);

        let single = RingBuilder::new()
            .backend("single")
            .members(vec!["only".into()])
            .build()
            .unwrap();
        assert_eq!(single.members(), vec!["only".to_string()]);

        assert!(RingBuilder::new().backend("empty").build().unwrap().members().is_empty());
        assert!(matches!(
            RingBuilder::new().backend("single").build(),
            Err(TorusError::Config(_))
        ));
        assert!(matches!(
            RingBuilder::new().backend("ketama").members(vec!["a".into()]).build(),
            Err(TorusError::Config(_))
        ));
        assert!(matches!(RingBuilder::new().build(), Err(TorusError::Config(_))));
    }

    #[test]
    fn test_block_store_builder() {
        let store = BlockStoreBuilder::new()
            .backend("memory")
            .block_size(4096)
            .capacity_blocks(10)
            .build()
            .unwrap();
        assert_eq!(store.block_size(), 4096);

        assert!(matches!(
            BlockStoreBuilder::new().backend("memory").build(),
            Err(TorusError::Config(_))
        ));
        assert!(matches!(
            BlockStoreBuilder::new().backend("badger").block_size(1).build(),
            Err(TorusError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_metadata_builder_seeds_state() {
        let metadata = MetadataBuilder::new()
            .backend("memory")
            .uuid("node-a")
            .block_size(512)
            .peers(vec![PeerInfo::new("node-b", "127.0.0.1:4000")])
            .volumes(vec![3, 1])
            .build()
            .await
            .unwrap();

        assert_eq!(metadata.uuid(), "node-a");
        assert_eq!(metadata.global_metadata().await.unwrap().block_size, 512);
        assert_eq!(metadata.get_ring().await.unwrap().version(), 1);
        let peers = metadata.get_peers().await.unwrap();
        assert_eq!(peers.uuids(), vec!["node-b".to_string()]);
        assert!(peers.get("node-b").unwrap().last_seen.is_none());
        assert_eq!(metadata.get_volumes().await.unwrap(), vec![1, 3]);

        assert!(matches!(
            MetadataBuilder::new().backend("memory").block_size(512).build().await,
            Err(TorusError::Config(_))
        ));
        assert!(matches!(
            MetadataBuilder::new().backend("etcd").uuid("a").block_size(512).build().await,
            Err(TorusError::Config(_))
        ));
    }
}
