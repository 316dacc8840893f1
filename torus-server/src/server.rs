use crate::config::Config;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use torus_core::{BlockStore, Distributor, NullGarbageCollector, PeerInfo, Result};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);

pub async fn run_node(cfg: Config) -> Result<()> {
    let ring = cfg.ring_builder().build()?;
    tracing::info!("Configured ring: {}", ring.describe());

    let metadata = cfg.metadata_builder(ring).build().await?;
    let blocks = cfg.block_store_builder().build()?;

    let listener = TcpListener::bind(&cfg.node.listen_addr).await?;
    let advertise_addr = match &cfg.node.advertise_addr {
        Some(addr) => addr.clone(),
        None => listener.local_addr()?.to_string(),
    };

    let distributor = Distributor::new(metadata, blocks, cfg.distributor.clone()).await?;
    register_local_peer(&distributor, &advertise_addr).await?;

    let handle = distributor
        .launch(listener, Arc::new(NullGarbageCollector), cfg.rebalance.clone())
        .await?;
    tracing::info!(
        "Node {} serving peers on {} (advertised as {})",
        distributor.uuid(),
        handle.local_addr(),
        advertise_addr
    );

    let shutdown = handle.shutdown_token();
    let heartbeat = tokio::spawn(heartbeat_loop(
        Arc::clone(&distributor),
        advertise_addr,
        shutdown.clone(),
    ));

    tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => tracing::info!("Received shutdown signal"),
            Err(error) => tracing::warn!("Failed to listen for shutdown signal: {}", error),
        },
        _ = shutdown.cancelled() => {
            tracing::warn!("Node {} stopping after an internal failure", distributor.uuid());
        }
    }

    shutdown.cancel();
    if let Err(error) = heartbeat.await {
        tracing::warn!("Heartbeat task failed: {}", error);
    }
    handle.shutdown().await
}

async fn register_local_peer(distributor: &Distributor, address: &str) -> Result<()> {
    let mut info = PeerInfo::new(distributor.uuid(), address);
    info.total_blocks = distributor.num_blocks().await;
    info.used_blocks = distributor.used_blocks().await;
    info.rebalance_info = distributor.rebalance_info().await;
    tracing::debug!("Registering peer {}", serde_json::to_string(&info)?);
    distributor.metadata().register_peer(info).await
}

async fn heartbeat_loop(distributor: Arc<Distributor>, address: String, shutdown: CancellationToken) {
    let mut ticker = interval(HEARTBEAT_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if let Err(error) = register_local_peer(&distributor, &address).await {
            tracing::warn!("Failed to refresh peer registration: {}", error);
        }
        if let Err(error) = distributor.refresh_peers().await {
            tracing::warn!("Failed to refresh peer map: {}", error);
        }
    }
}
