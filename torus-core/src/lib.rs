//! Torus Core - block placement, replication and rebalancing for a Torus
//! storage cluster

pub mod block;
pub mod cache;
pub mod distributor;
pub mod error;
pub mod factory;
pub mod gc;
pub mod metadata;
pub mod options;
pub mod peer;
pub mod protocol;
pub mod rebalance;
pub mod ring;
pub mod storage;

pub use block::{BLOCK_REF_BYTE_SIZE, BlockRef, BlockType, INodeId, IndexId, VolumeId};
pub use cache::ReadCache;
pub use distributor::{Distributor, DistributorHandle, PeerClient, RingWatcher};
pub use error::{Result, TorusError};
pub use factory::{BlockStoreBuilder, MetadataBuilder, RingBuilder};
pub use gc::{GarbageCollector, NullGarbageCollector};
pub use metadata::{GlobalMetadata, MemoryMetadata, MetadataService, RingEvent, RingSubscription};
pub use options::{
    BlockOptions, DistributorOptions, ReadLevel, RebalanceOptions, TimeoutConfig, WriteLevel,
};
pub use peer::{PeerInfo, PeerInfoList, RebalanceInfo};
pub use protocol::{ProtocolClient, ProtocolServer, RequestHandler};
pub use rebalance::{RebalanceDriver, Rebalancer, TickOutcome};
pub use ring::{EmptyRing, ModRing, PeerPermutation, Ring, SingleRing};
pub use storage::{BlockIterator, BlockStore, MemoryBlockStore, SnapshotIterator};
