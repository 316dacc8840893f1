use super::Distributor;
use crate::error::{Result, TorusError};
use crate::protocol::ProtocolServer;
use crate::storage::BlockStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns the background tasks of a launched distributor.
pub struct DistributorHandle {
    distributor: Arc<Distributor>,
    server: ProtocolServer,
    shutdown: CancellationToken,
    watcher: JoinHandle<Result<()>>,
    rebalancer: Option<JoinHandle<()>>,
}

impl DistributorHandle {
    pub(super) fn new(
        distributor: Arc<Distributor>,
        server: ProtocolServer,
        shutdown: CancellationToken,
        watcher: JoinHandle<Result<()>>,
        rebalancer: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            distributor,
            server,
            shutdown,
            watcher,
            rebalancer,
        }
    }

    pub fn distributor(&self) -> &Arc<Distributor> {
        &self.distributor
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// Cancelled on shutdown or when the node hits a fatal error.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stops every task and closes the distributor. Returns the fatal error
    /// that brought the node down, if any.
    pub async fn shutdown(self) -> Result<()> {
        tracing::info!("Shutting down distributor {}", self.distributor.uuid());
        self.shutdown.cancel();
        self.server.shutdown().await;

        let watched = match self.watcher.await {
            Ok(result) => result,
            Err(error) => Err(TorusError::Internal(format!("ring watcher failed: {}", error))),
        };

        if let Some(rebalancer) = self.rebalancer {
            if let Err(error) = rebalancer.await {
                tracing::warn!("Rebalance loop failed: {}", error);
            }
        }

        if let Err(error) = self.distributor.close().await {
            tracing::warn!("Error closing distributor: {}", error);
        }
        watched
    }
}
