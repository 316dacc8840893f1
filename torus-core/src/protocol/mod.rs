//! Peer-to-peer block protocol.
//!
//! One request in flight per TCP connection, answered in order; there are
//! no request ids. Every request starts with a one-byte opcode:
//!
//! | opcode | request body                  | response                     |
//! |--------|-------------------------------|------------------------------|
//! | 0x01   | keepalive, nothing            | none                         |
//! | 0x02   | block ref (24)                | status, block (block size)   |
//! | 0x03   | block ref (24), block         | status                       |
//! | 0x04   | count (1), count x ref (24)   | status, bitset ceil(count/8) |
//!
//! Status is `0x01` for ok and `0x02` for error; error responses carry no
//! payload. Block size is agreed through cluster metadata beforehand.

pub mod client;
pub mod codec;
pub mod server;

use crate::block::BlockRef;
use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;

pub use client::ProtocolClient;
pub use server::ProtocolServer;

pub const OP_KEEPALIVE: u8 = 0x01;
pub const OP_BLOCK: u8 = 0x02;
pub const OP_PUT_BLOCK: u8 = 0x03;
pub const OP_REBALANCE_CHECK: u8 = 0x04;

pub const STATUS_OK: u8 = 0x01;
pub const STATUS_ERR: u8 = 0x02;

/// Count is carried in a single byte.
pub const MAX_REBALANCE_CHECK_REFS: usize = 255;

/// Serves requests arriving from other peers.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn block(&self, block_ref: BlockRef) -> Result<Bytes>;

    async fn put_block(&self, block_ref: BlockRef, data: Bytes) -> Result<()>;

    async fn rebalance_check(&self, refs: &[BlockRef]) -> Result<Vec<bool>>;
}
