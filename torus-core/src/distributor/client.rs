use crate::block::BlockRef;
use crate::error::{Result, TorusError};
use crate::metadata::MetadataService;
use crate::options::TimeoutConfig;
use crate::peer::{PeerInfo, PeerInfoList};
use crate::protocol::{MAX_REBALANCE_CHECK_REFS, ProtocolClient};
use bytes::Bytes;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

/// Lazily dialed, cached connections to the other peers.
pub struct PeerClient {
    metadata: Arc<dyn MetadataService>,
    peers: RwLock<PeerInfoList>,
    conns: Mutex<HashMap<String, Arc<ProtocolClient>>>,
    block_size: usize,
    timeouts: TimeoutConfig,
}

impl PeerClient {
    pub fn new(
        metadata: Arc<dyn MetadataService>,
        peers: PeerInfoList,
        block_size: usize,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            metadata,
            peers: RwLock::new(peers),
            conns: Mutex::new(HashMap::new()),
            block_size,
            timeouts,
        }
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    pub async fn peers(&self) -> PeerInfoList {
        self.peers.read().await.clone()
    }

    /// Reloads the peer map. Connections to peers that vanished, moved or
    /// timed out are dropped. A peer whose last heartbeat is older than the
    /// peer timeout is treated as timed out.
    pub async fn refresh_peers(&self) -> Result<()> {
        let mut fresh = self.metadata.get_peers().await?;
        let silent = self.silent_peers(&fresh);

        let (stale, newly_silent) = {
            let mut peers = self.peers.write().await;
            let stale: Vec<String> = peers
                .0
                .iter()
                .filter(|old| match fresh.get(&old.uuid) {
                    Some(new) => new.timed_out || new.address != old.address,
                    None => true,
                })
                .map(|old| old.uuid.clone())
                .collect();

            let mut newly_silent = Vec::new();
            for peer in fresh.0.iter_mut().filter(|peer| silent.contains(&peer.uuid)) {
                if !peers.get(&peer.uuid).is_some_and(|old| old.timed_out) {
                    newly_silent.push(peer.uuid.clone());
                }
                peer.timed_out = true;
            }

            *peers = fresh;
            (stale, newly_silent)
        };

        for uuid in stale {
            self.evict(&uuid).await;
        }
        for uuid in newly_silent {
            self.on_peer_timeout(&uuid).await;
        }
        Ok(())
    }

    fn silent_peers(&self, peers: &PeerInfoList) -> Vec<String> {
        let Some(limit) = self.timeouts.peer_timeout() else {
            return Vec::new();
        };
        let now = Utc::now();

        peers
            .0
            .iter()
            .filter(|peer| peer.uuid != self.metadata.uuid() && !peer.timed_out)
            .filter(|peer| match peer.last_seen {
                Some(seen) => (now - seen).to_std().is_ok_and(|age| age > limit),
                None => false,
            })
            .map(|peer| peer.uuid.clone())
            .collect()
    }

    /// Heartbeat callback: the peer stopped answering, never reuse its socket.
    pub async fn on_peer_timeout(&self, uuid: &str) {
        {
            let mut peers = self.peers.write().await;
            if let Some(peer) = peers.0.iter_mut().find(|peer| peer.uuid == uuid) {
                peer.timed_out = true;
            }
        }
        self.evict(uuid).await;
        tracing::info!("Peer {} timed out, connection evicted", uuid);
    }

    /// Cached connection or a fresh dial. `None` when the address is unknown,
    /// the peer is timed out, or the dial fails.
    pub async fn get_conn(&self, uuid: &str) -> Option<Arc<ProtocolClient>> {
        {
            let mut conns = self.conns.lock().await;
            if let Some(conn) = conns.get(uuid) {
                if conn.is_open() {
                    return Some(Arc::clone(conn));
                }
                conns.remove(uuid);
            }
        }

        let info = self.lookup_peer(uuid).await?;
        if info.timed_out {
            return None;
        }

        let conn = match ProtocolClient::connect(
            &info.address,
            self.block_size,
            self.timeouts.connect(),
            self.timeouts.keepalive(),
        )
        .await
        {
            Ok(conn) => Arc::new(conn),
            Err(error) => {
                tracing::debug!("Failed to dial peer {} at {}: {}", uuid, info.address, error);
                return None;
            }
        };

        let mut conns = self.conns.lock().await;
        if let Some(existing) = conns.get(uuid) {
            if existing.is_open() {
                return Some(Arc::clone(existing));
            }
        }
        conns.insert(uuid.to_string(), Arc::clone(&conn));
        Some(conn)
    }

    pub async fn get_block(
        &self,
        uuid: &str,
        block_ref: BlockRef,
        timeout: Duration,
    ) -> Result<Bytes> {
        let conn = self.get_conn(uuid).await.ok_or(TorusError::NoPeer)?;

        match tokio::time::timeout(timeout, conn.block(block_ref)).await {
            Ok(Ok(Some(data))) => Ok(data),
            Ok(Ok(None)) => Err(TorusError::BlockUnavailable),
            Ok(Err(error)) => {
                tracing::debug!("Block {} from {} failed: {}", block_ref, uuid, error);
                self.evict_conn(uuid, &conn).await;
                Err(TorusError::BlockUnavailable)
            }
            Err(_) => {
                tracing::debug!("Block {} from {} timed out", block_ref, uuid);
                self.evict_conn(uuid, &conn).await;
                Err(TorusError::BlockUnavailable)
            }
        }
    }

    pub async fn put_block(
        &self,
        uuid: &str,
        block_ref: BlockRef,
        data: &Bytes,
        timeout: Duration,
    ) -> Result<()> {
        let conn = self.get_conn(uuid).await.ok_or(TorusError::NoPeer)?;

        match tokio::time::timeout(timeout, conn.put_block(block_ref, data)).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(TorusError::BlockUnavailable),
            Ok(Err(TorusError::InvalidBlockSize { expected, actual })) => {
                Err(TorusError::InvalidBlockSize { expected, actual })
            }
            Ok(Err(error)) => {
                tracing::debug!("Put {} to {} failed: {}", block_ref, uuid, error);
                self.evict_conn(uuid, &conn).await;
                Err(TorusError::BlockUnavailable)
            }
            Err(_) => {
                tracing::debug!("Put {} to {} timed out", block_ref, uuid);
                self.evict_conn(uuid, &conn).await;
                Err(TorusError::BlockUnavailable)
            }
        }
    }

    /// Presence flags for `refs` on one peer, in order. Batches larger than
    /// the wire limit are split.
    pub async fn rebalance_check(
        &self,
        uuid: &str,
        refs: &[BlockRef],
        timeout: Duration,
    ) -> Result<Vec<bool>> {
        let conn = self.get_conn(uuid).await.ok_or(TorusError::NoPeer)?;

        let mut present = Vec::with_capacity(refs.len());
        for chunk in refs.chunks(MAX_REBALANCE_CHECK_REFS) {
            match tokio::time::timeout(timeout, conn.rebalance_check(chunk)).await {
                Ok(Ok(Some(flags))) => present.extend(flags),
                Ok(Ok(None)) => return Err(TorusError::BlockUnavailable),
                Ok(Err(error)) => {
                    tracing::debug!("Rebalance check with {} failed: {}", uuid, error);
                    self.evict_conn(uuid, &conn).await;
                    return Err(TorusError::BlockUnavailable);
                }
                Err(_) => {
                    tracing::debug!("Rebalance check with {} timed out", uuid);
                    self.evict_conn(uuid, &conn).await;
                    return Err(TorusError::BlockUnavailable);
                }
            }
        }
        Ok(present)
    }

    pub async fn close(&self) {
        let conns: Vec<Arc<ProtocolClient>> = {
            let mut conns = self.conns.lock().await;
            conns.drain().map(|(_, conn)| conn).collect()
        };
        for conn in conns {
            conn.close().await;
        }
    }

    async fn lookup_peer(&self, uuid: &str) -> Option<PeerInfo> {
        if let Some(info) = self.peers.read().await.get(uuid) {
            return Some(info.clone());
        }

        if let Err(error) = self.refresh_peers().await {
            tracing::warn!("Failed to refresh peers while resolving {}: {}", uuid, error);
            return None;
        }
        self.peers.read().await.get(uuid).cloned()
    }

    async fn evict(&self, uuid: &str) {
        let removed = self.conns.lock().await.remove(uuid);
        if let Some(conn) = removed {
            conn.close().await;
        }
    }

    async fn evict_conn(&self, uuid: &str, conn: &Arc<ProtocolClient>) {
        let removed = {
            let mut conns = self.conns.lock().await;
            match conns.get(uuid) {
                Some(cached) if Arc::ptr_eq(cached, conn) => conns.remove(uuid),
                _ => None,
            }
        };
        if let Some(conn) = removed {
            conn.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{GlobalMetadata, MemoryMetadata};
    use crate::protocol::{ProtocolServer, RequestHandler};
    use crate::ring::EmptyRing;
    use async_trait::async_trait;
    use tokio::net::TcpListener;
    use tokio_util::sync::CancellationToken;

    const BLOCK_SIZE: usize = 16;

    struct FullHandler;

    #[async_trait]
    impl RequestHandler for FullHandler {
        async fn block(&self, _block_ref: BlockRef) -> Result<Bytes> {
            Ok(Bytes::from(vec![1u8; BLOCK_SIZE]))
        }

        async fn put_block(&self, _block_ref: BlockRef, _data: Bytes) -> Result<()> {
            Err(TorusError::OutOfSpace)
        }

        async fn rebalance_check(&self, refs: &[BlockRef]) -> Result<Vec<bool>> {
            Ok(vec![true; refs.len()])
        }
    }

    async fn setup() -> (PeerClient, MemoryMetadata, ProtocolServer) {
        setup_with(TimeoutConfig::default()).await
    }

    async fn setup_with(timeouts: TimeoutConfig) -> (PeerClient, MemoryMetadata, ProtocolServer) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let server = ProtocolServer::start(
            listener,
            Arc::new(FullHandler),
            BLOCK_SIZE,
            CancellationToken::new(),
        )
        .unwrap();

        let metadata = MemoryMetadata::new(
            "self",
            GlobalMetadata {
                block_size: BLOCK_SIZE as u64,
            },
            Arc::new(EmptyRing::new(1)),
        );
        metadata
            .register_peer(PeerInfo::new("remote", server.local_addr().to_string()))
            .await
            .unwrap();

        let client = PeerClient::new(
            Arc::new(metadata.clone()),
            PeerInfoList::default(),
            BLOCK_SIZE,
            timeouts,
        );
        (client, metadata, server)
    }

    #[tokio::test]
    async fn test_unknown_peer_refreshes_once() {
        let (client, _metadata, server) = setup().await;

        assert!(client.get_conn("nobody").await.is_none());
        let conn = client.get_conn("remote").await.unwrap();
        let again = client.get_conn("remote").await.unwrap();
        assert!(Arc::ptr_eq(&conn, &again));

        let timeout = client.timeouts().op();
        assert_eq!(
            client
                .get_block("remote", BlockRef::new(1, 1, 1), timeout)
                .await
                .unwrap()
                .len(),
            BLOCK_SIZE
        );
        assert!(matches!(
            client
                .put_block("remote", BlockRef::new(1, 1, 1), &Bytes::from(vec![0u8; BLOCK_SIZE]), timeout)
                .await,
            Err(TorusError::BlockUnavailable)
        ));
        let refs: Vec<BlockRef> = (0..600).map(|i| BlockRef::new(1, 1, i)).collect();
        assert_eq!(
            client.rebalance_check("remote", &refs, timeout).await.unwrap(),
            vec![true; 600]
        );
        assert!(matches!(
            client.get_block("nobody", BlockRef::new(1, 1, 1), timeout).await,
            Err(TorusError::NoPeer)
        ));

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_peer_timeout_evicts_connection() {
        let (client, metadata, server) = setup().await;

        let conn = client.get_conn("remote").await.unwrap();
        client.on_peer_timeout("remote").await;
        assert!(!conn.is_open());
        assert!(client.get_conn("remote").await.is_none());

        metadata.set_peer_timed_out("remote", false).await;
        client.refresh_peers().await.unwrap();
        let fresh = client.get_conn("remote").await.unwrap();
        assert!(!Arc::ptr_eq(&conn, &fresh));

        metadata.set_peer_timed_out("remote", true).await;
        client.refresh_peers().await.unwrap();
        assert!(!fresh.is_open());
        assert!(client.get_conn("remote").await.is_none());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_silent_peer_is_timed_out_on_refresh() {
        let timeouts = TimeoutConfig {
            peer_timeout_ms: 50,
            ..TimeoutConfig::default()
        };
        let (client, metadata, server) = setup_with(timeouts).await;
        metadata
            .seed_peer(PeerInfo::new("static", server.local_addr().to_string()))
            .await;

        let conn = client.get_conn("remote").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        client.refresh_peers().await.unwrap();

        assert!(!conn.is_open());
        assert!(client.get_conn("remote").await.is_none());
        assert!(client.peers().await.get("remote").unwrap().timed_out);
        // Never heard from, so never expired.
        assert!(client.get_conn("static").await.is_some());

        metadata
            .register_peer(PeerInfo::new("remote", server.local_addr().to_string()))
            .await
            .unwrap();
        client.refresh_peers().await.unwrap();
        assert!(client.get_conn("remote").await.is_some());

        server.shutdown().await;
    }

    #[tokio::test]
    async fn test_vanished_peer_connection_is_dropped() {
        let (client, metadata, server) = setup().await;

        let conn = client.get_conn("remote").await.unwrap();
        metadata.remove_peer("remote").await;
        client.refresh_peers().await.unwrap();

        assert!(!conn.is_open());
        assert!(client.peers().await.get("remote").is_none());
        assert!(client.get_conn("remote").await.is_none());

        server.shutdown().await;
    }
}
