use super::codec::{
    encode_rebalance_check_response, read_block_ref, read_block_refs, read_exact_bytes,
};
use super::{
    OP_BLOCK, OP_KEEPALIVE, OP_PUT_BLOCK, OP_REBALANCE_CHECK, RequestHandler, STATUS_ERR,
    STATUS_OK,
};
use crate::error::{Result, TorusError};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

/// Accept loop plus one task per inbound connection. All connections are
/// closed together on shutdown.
pub struct ProtocolServer {
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: tokio::task::JoinHandle<()>,
}

impl ProtocolServer {
    pub fn start(
        listener: TcpListener,
        handler: Arc<dyn RequestHandler>,
        block_size: usize,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let local_addr = listener.local_addr()?;
        let token = shutdown.clone();
        let accept_task = tokio::spawn(async move {
            accept_loop(listener, handler, block_size, token).await;
        });

        tracing::info!("Peer protocol listening on {}", local_addr);
        Ok(Self {
            local_addr,
            shutdown,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(error) = self.accept_task.await {
            tracing::warn!("Peer protocol accept task failed: {}", error);
        }
    }
}

async fn accept_loop(
    listener: TcpListener,
    handler: Arc<dyn RequestHandler>,
    block_size: usize,
    shutdown: CancellationToken,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    if let Err(error) = stream.set_nodelay(true) {
                        tracing::debug!("Failed to set nodelay for {}: {}", remote, error);
                    }
                    let handler = Arc::clone(&handler);
                    connections.spawn(async move {
                        if let Err(error) = serve_connection(stream, handler, block_size).await {
                            tracing::debug!("Closing peer connection {}: {}", remote, error);
                        }
                    });
                }
                Err(error) => {
                    tracing::warn!("Failed to accept peer connection: {}", error);
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(error) = joined {
                    if error.is_panic() {
                        tracing::error!("Peer connection task panicked: {}", error);
                    }
                }
            }
        }
    }

    tracing::info!(
        "Peer protocol shutting down, closing {} connections",
        connections.len()
    );
    connections.shutdown().await;
}

async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn RequestHandler>,
    block_size: usize,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = BufWriter::new(write_half);

    loop {
        let opcode = match reader.read_u8().await {
            Ok(opcode) => opcode,
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(error) => return Err(error.into()),
        };

        match opcode {
            OP_KEEPALIVE => continue,
            OP_BLOCK => {
                let block_ref = read_block_ref(&mut reader).await?;
                match handler.block(block_ref).await {
                    Ok(data) if data.len() == block_size => {
                        writer.write_u8(STATUS_OK).await?;
                        writer.write_all(&data).await?;
                    }
                    Ok(data) => {
                        tracing::warn!(
                            "Refusing to serve block {} with size {} (expected {})",
                            block_ref,
                            data.len(),
                            block_size
                        );
                        writer.write_u8(STATUS_ERR).await?;
                    }
                    Err(error) => {
                        tracing::debug!("Block request for {} failed: {}", block_ref, error);
                        writer.write_u8(STATUS_ERR).await?;
                    }
                }
            }
            OP_PUT_BLOCK => {
                let block_ref = read_block_ref(&mut reader).await?;
                let data = read_exact_bytes(&mut reader, block_size).await?;
                match handler.put_block(block_ref, data).await {
                    Ok(()) => writer.write_u8(STATUS_OK).await?,
                    Err(error) => {
                        tracing::debug!("Put request for {} failed: {}", block_ref, error);
                        writer.write_u8(STATUS_ERR).await?;
                    }
                }
            }
            OP_REBALANCE_CHECK => {
                let count = reader.read_u8().await? as usize;
                let refs = read_block_refs(&mut reader, count).await?;
                match handler.rebalance_check(&refs).await {
                    Ok(flags) if flags.len() == refs.len() => {
                        writer
                            .write_all(&encode_rebalance_check_response(&flags))
                            .await?;
                    }
                    Ok(_) | Err(_) => writer.write_u8(STATUS_ERR).await?,
                }
            }
            other => {
                return Err(TorusError::Protocol(format!(
                    "unknown opcode {:#04x}",
                    other
                )));
            }
        }

        writer.flush().await?;
    }
}
