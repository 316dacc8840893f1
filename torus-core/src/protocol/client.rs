use super::codec::{
    bitset_len, decode_bitset, encode_block_request, encode_put_block_request,
    encode_rebalance_check_request, read_exact_bytes, read_status,
};
use super::OP_KEEPALIVE;
use crate::block::BlockRef;
use crate::error::{Result, TorusError};
use bytes::Bytes;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufStream};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

struct Connection {
    stream: Mutex<Option<BufStream<TcpStream>>>,
    broken: AtomicBool,
}

/// Marks the connection broken unless the request it guards completed. A
/// request abandoned mid-flight (timeout, cancellation) leaves unread bytes
/// on the socket, so the connection can never be reused after that.
struct InFlight<'a> {
    broken: &'a AtomicBool,
    completed: bool,
}

impl<'a> InFlight<'a> {
    fn new(broken: &'a AtomicBool) -> Self {
        Self {
            broken,
            completed: false,
        }
    }

    fn complete(mut self) {
        self.completed = true;
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if !self.completed {
            self.broken.store(true, Ordering::Release);
        }
    }
}

/// One persistent connection to a peer. Calls are serialized.
pub struct ProtocolClient {
    address: String,
    block_size: usize,
    conn: Arc<Connection>,
    keepalive: JoinHandle<()>,
}

impl ProtocolClient {
    pub async fn connect(
        address: &str,
        block_size: usize,
        connect_timeout: Duration,
        keepalive_interval: Duration,
    ) -> Result<Self> {
        let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TorusError::Timeout(format!("connect to {}", address)))??;
        stream.set_nodelay(true)?;

        let conn = Arc::new(Connection {
            stream: Mutex::new(Some(BufStream::new(stream))),
            broken: AtomicBool::new(false),
        });
        let keepalive = tokio::spawn(keepalive_loop(
            Arc::downgrade(&conn),
            keepalive_interval,
            address.to_string(),
        ));

        tracing::debug!("Connected to peer at {}", address);
        Ok(Self {
            address: address.to_string(),
            block_size,
            conn,
            keepalive,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_open(&self) -> bool {
        !self.conn.broken.load(Ordering::Acquire)
    }

    /// `Ok(None)` when the peer answered with an error status.
    pub async fn block(&self, block_ref: BlockRef) -> Result<Option<Bytes>> {
        let request = encode_block_request(block_ref);
        let block_size = self.block_size;
        self.call(request, |stream| {
            Box::pin(async move {
                if !read_status(&mut *stream).await? {
                    return Ok(None);
                }
                Ok(Some(read_exact_bytes(&mut *stream, block_size).await?))
            })
        })
        .await
    }

    /// `Ok(false)` when the peer refused the block.
    pub async fn put_block(&self, block_ref: BlockRef, data: &[u8]) -> Result<bool> {
        if data.len() != self.block_size {
            return Err(TorusError::InvalidBlockSize {
                expected: self.block_size,
                actual: data.len(),
            });
        }

        let request = encode_put_block_request(block_ref, data);
        self.call(request, |stream| Box::pin(read_status(stream)))
            .await
    }

    /// `Ok(None)` when the peer answered with an error status.
    pub async fn rebalance_check(&self, refs: &[BlockRef]) -> Result<Option<Vec<bool>>> {
        let request = encode_rebalance_check_request(refs)?;
        let count = refs.len();
        self.call(request, |stream| {
            Box::pin(async move {
                if !read_status(&mut *stream).await? {
                    return Ok(None);
                }
                let bits = read_exact_bytes(&mut *stream, bitset_len(count)).await?;
                Ok(Some(decode_bitset(&bits, count)?))
            })
        })
        .await
    }

    pub async fn close(&self) {
        self.keepalive.abort();
        self.conn.broken.store(true, Ordering::Release);
        let mut stream = self.conn.stream.lock().await;
        if let Some(mut stream) = stream.take() {
            if let Err(error) = stream.shutdown().await {
                tracing::debug!("Error closing connection to {}: {}", self.address, error);
            }
        }
    }

    async fn call<T, F>(&self, request: Bytes, read_response: F) -> Result<T>
    where
        F: for<'s> FnOnce(
            &'s mut BufStream<TcpStream>,
        ) -> std::pin::Pin<
            Box<dyn std::future::Future<Output = Result<T>> + Send + 's>,
        >,
    {
        let mut guard = self.conn.stream.lock().await;
        if !self.is_open() {
            return Err(TorusError::Closed);
        }
        let stream = guard.as_mut().ok_or(TorusError::Closed)?;

        let flight = InFlight::new(&self.conn.broken);
        stream.write_all(&request).await?;
        stream.flush().await?;
        let response = read_response(stream).await?;
        flight.complete();

        Ok(response)
    }
}

impl Drop for ProtocolClient {
    fn drop(&mut self) {
        self.keepalive.abort();
    }
}

async fn keepalive_loop(weak: std::sync::Weak<Connection>, interval: Duration, address: String) {
    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let Some(conn) = weak.upgrade() else {
            return;
        };
        if conn.broken.load(Ordering::Acquire) {
            return;
        }

        let mut guard = conn.stream.lock().await;
        let Some(stream) = guard.as_mut() else {
            return;
        };

        let sent = async {
            stream.write_u8(OP_KEEPALIVE).await?;
            stream.flush().await
        }
        .await;

        if let Err(error) = sent {
            tracing::debug!("Keepalive to {} failed: {}", address, error);
            conn.broken.store(true, Ordering::Release);
            return;
        }
    }
}
