use serde::{Deserialize, Serialize};
use std::sync::Arc;
use torus_core::{
    BlockStoreBuilder, DistributorOptions, MetadataBuilder, PeerInfo, RebalanceOptions, Result,
    Ring, RingBuilder, TorusError, VolumeId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub node: NodeConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub distributor: DistributorOptions,
    #[serde(default)]
    pub rebalance: RebalanceOptions,
    pub cluster: ClusterConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub uuid: String,
    pub listen_addr: String,
    /// Address other peers dial; defaults to the bound listen address.
    #[serde(default)]
    pub advertise_addr: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_backend")]
    pub backend: String,
    #[serde(default = "default_block_size")]
    pub block_size: u64,
    /// Zero means unbounded.
    #[serde(default)]
    pub capacity_blocks: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            block_size: default_block_size(),
            capacity_blocks: 0,
        }
    }
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_block_size() -> u64 {
    512 * 1024
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    #[serde(default = "default_metadata_backend")]
    pub metadata: String,
    #[serde(default = "default_ring_backend")]
    pub ring: String,
    #[serde(default = "default_ring_version")]
    pub ring_version: u64,
    #[serde(default = "default_replication")]
    pub replication: usize,
    pub peers: Vec<PeerConfig>,
    #[serde(default)]
    pub volumes: Vec<VolumeId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerConfig {
    pub uuid: String,
    pub address: String,
}

fn default_metadata_backend() -> String {
    "memory".to_string()
}

fn default_ring_backend() -> String {
    "mod".to_string()
}

fn default_ring_version() -> u64 {
    1
}

fn default_replication() -> usize {
    2
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path))
            .add_source(
                ::config::Environment::with_prefix("TORUS")
                    .prefix_separator("_")
                    .separator("__"),
            )
            .build()
            .map_err(|e| TorusError::Config(e.to_string()))?;

        let config: Config = settings
            .try_deserialize()
            .map_err(|e| TorusError::Config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.node.uuid.trim().is_empty() {
            return Err(TorusError::Config("node.uuid cannot be empty".to_string()));
        }

        let mut seen = std::collections::HashSet::new();
        for peer in &self.cluster.peers {
            if !seen.insert(peer.uuid.as_str()) {
                return Err(TorusError::Config(format!(
                    "duplicate peer uuid '{}' in cluster.peers",
                    peer.uuid
                )));
            }
        }

        if self.cluster.ring != "empty" && !seen.contains(self.node.uuid.as_str()) {
            tracing::warn!(
                "Node {} is not listed in cluster.peers and will hold no blocks",
                self.node.uuid
            );
        }
        Ok(())
    }

    pub fn ring_builder(&self) -> RingBuilder {
        RingBuilder::new()
            .backend(self.cluster.ring.clone())
            .version(self.cluster.ring_version)
            .members(
                self.cluster
                    .peers
                    .iter()
                    .map(|peer| peer.uuid.clone())
                    .collect(),
            )
            .replication(self.cluster.replication)
    }

    pub fn block_store_builder(&self) -> BlockStoreBuilder {
        BlockStoreBuilder::new()
            .backend(self.storage.backend.clone())
            .block_size(self.storage.block_size)
            .capacity_blocks(self.storage.capacity_blocks)
    }

    pub fn metadata_builder(&self, ring: Arc<dyn Ring>) -> MetadataBuilder {
        MetadataBuilder::new()
            .backend(self.cluster.metadata.clone())
            .uuid(self.node.uuid.clone())
            .block_size(self.storage.block_size)
            .ring(ring)
            .peers(
                self.cluster
                    .peers
                    .iter()
                    .filter(|peer| peer.uuid != self.node.uuid)
                    .map(|peer| PeerInfo::new(peer.uuid.clone(), peer.address.clone()))
                    .collect(),
            )
            .volumes(self.cluster.volumes.clone())
    }
}
