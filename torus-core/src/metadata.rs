//! Cluster metadata contract and the static in-memory backend.

use crate::block::VolumeId;
use crate::error::{Result, TorusError};
use crate::peer::{PeerInfo, PeerInfoList};
use crate::ring::Ring;
use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{RwLock, broadcast};

const RING_UPDATE_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalMetadata {
    pub block_size: u64,
}

#[derive(Debug)]
pub enum RingEvent {
    NewRing(Arc<dyn Ring>),
    /// Updates were dropped; re-read the current ring.
    Missed,
}

/// Stream of ring updates. Dropping it unsubscribes.
pub struct RingSubscription {
    receiver: broadcast::Receiver<Arc<dyn Ring>>,
}

impl RingSubscription {
    pub fn new(receiver: broadcast::Receiver<Arc<dyn Ring>>) -> Self {
        Self { receiver }
    }

    /// `None` once the metadata service has gone away.
    pub async fn recv(&mut self) -> Option<RingEvent> {
        match self.receiver.recv().await {
            Ok(ring) => Some(RingEvent::NewRing(ring)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Ring subscription lagged, skipped {} updates", skipped);
                Some(RingEvent::Missed)
            }
            Err(broadcast::error::RecvError::Closed) => None,
        }
    }
}

#[async_trait]
pub trait MetadataService: Send + Sync {
    /// Uuid of the local peer.
    fn uuid(&self) -> &str;

    async fn global_metadata(&self) -> Result<GlobalMetadata>;

    async fn get_ring(&self) -> Result<Arc<dyn Ring>>;

    async fn set_ring(&self, ring: Arc<dyn Ring>) -> Result<()>;

    fn subscribe_new_rings(&self) -> RingSubscription;

    async fn get_peers(&self) -> Result<PeerInfoList>;

    async fn register_peer(&self, info: PeerInfo) -> Result<()>;

    async fn get_lease(&self) -> Result<i64>;

    async fn get_volumes(&self) -> Result<Vec<VolumeId>>;
}

struct MemoryMetadataState {
    global: GlobalMetadata,
    ring: RwLock<Arc<dyn Ring>>,
    peers: RwLock<PeerInfoList>,
    volumes: RwLock<Vec<VolumeId>>,
    lease: AtomicI64,
    ring_updates: broadcast::Sender<Arc<dyn Ring>>,
}

/// Process-local metadata. Handles cloned through `for_peer` share state,
/// so several in-process peers see one cluster.
#[derive(Clone)]
pub struct MemoryMetadata {
    uuid: String,
    state: Arc<MemoryMetadataState>,
}

impl MemoryMetadata {
    pub fn new(uuid: impl Into<String>, global: GlobalMetadata, ring: Arc<dyn Ring>) -> Self {
        let (ring_updates, _) = broadcast::channel(RING_UPDATE_CAPACITY);
        Self {
            uuid: uuid.into(),
            state: Arc::new(MemoryMetadataState {
                global,
                ring: RwLock::new(ring),
                peers: RwLock::new(PeerInfoList::default()),
                volumes: RwLock::new(Vec::new()),
                lease: AtomicI64::new(0),
                ring_updates,
            }),
        }
    }

    pub fn for_peer(&self, uuid: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            state: Arc::clone(&self.state),
        }
    }

    pub async fn add_volume(&self, volume: VolumeId) {
        let mut volumes = self.state.volumes.write().await;
        if !volumes.contains(&volume) {
            volumes.push(volume);
            volumes.sort_unstable();
        }
    }

    /// Adds a peer known from static configuration. Unlike `register_peer`
    /// this is not a heartbeat, so `last_seen` is left as given.
    pub async fn seed_peer(&self, info: PeerInfo) {
        self.state.peers.write().await.upsert(info);
    }

    pub async fn remove_peer(&self, uuid: &str) {
        self.state.peers.write().await.0.retain(|peer| peer.uuid != uuid);
    }

    /// Heartbeat verdict for a peer.
    pub async fn set_peer_timed_out(&self, uuid: &str, timed_out: bool) {
        let mut peers = self.state.peers.write().await;
        if let Some(peer) = peers.0.iter_mut().find(|peer| peer.uuid == uuid) {
            peer.timed_out = timed_out;
        }
    }
}

#[async_trait]
impl MetadataService for MemoryMetadata {
    fn uuid(&self) -> &str {
        &self.uuid
    }

    async fn global_metadata(&self) -> Result<GlobalMetadata> {
        Ok(self.state.global.clone())
    }

    async fn get_ring(&self) -> Result<Arc<dyn Ring>> {
        Ok(self.state.ring.read().await.clone())
    }

    async fn set_ring(&self, ring: Arc<dyn Ring>) -> Result<()> {
        {
            let mut current = self.state.ring.write().await;
            if ring.version() <= current.version() {
                return Err(TorusError::RingVersionRegression {
                    current: current.version(),
                    proposed: ring.version(),
                });
            }
            *current = Arc::clone(&ring);
        }

        // No subscribers is fine.
        let _ = self.state.ring_updates.send(ring);
        Ok(())
    }

    fn subscribe_new_rings(&self) -> RingSubscription {
        RingSubscription::new(self.state.ring_updates.subscribe())
    }

    async fn get_peers(&self) -> Result<PeerInfoList> {
        Ok(self.state.peers.read().await.clone())
    }

    async fn register_peer(&self, mut info: PeerInfo) -> Result<()> {
        info.last_seen = Some(Utc::now());
        self.state.peers.write().await.upsert(info);
        Ok(())
    }

    async fn get_lease(&self) -> Result<i64> {
        Ok(self.state.lease.fetch_add(1, Ordering::SeqCst) + 1)
    }

    async fn get_volumes(&self) -> Result<Vec<VolumeId>> {
        Ok(self.state.volumes.read().await.clone())
    }
}
