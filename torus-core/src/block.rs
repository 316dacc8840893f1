//! Block references.
//!
//! A `BlockRef` names one fixed-size block anywhere in the cluster. On the
//! wire and on disk it is 24 bytes, little-endian:
//!
//! ```text
//! [0..8)   volume id (low 48 bits) | block type (high 16 bits)
//! [8..16)  inode id
//! [16..24) index within the inode
//! ```

use crate::error::{Result, TorusError};
use serde::{Deserialize, Serialize};
use std::fmt;

pub const BLOCK_REF_BYTE_SIZE: usize = 24;

/// Largest volume id that fits next to the packed block type.
pub const VOLUME_ID_MAX: u64 = 0x0000_FFFF_FFFF_FFFF;

const BLOCK_TYPE_SHIFT: u32 = 48;

pub type VolumeId = u64;
pub type INodeId = u64;
pub type IndexId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockType {
    Data,
    INode,
}

impl BlockType {
    fn as_u16(self) -> u16 {
        match self {
            BlockType::Data => 0,
            BlockType::INode => 1,
        }
    }

    fn from_u16(value: u16) -> Result<Self> {
        match value {
            0 => Ok(BlockType::Data),
            1 => Ok(BlockType::INode),
            other => Err(TorusError::Protocol(format!("unknown block type {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BlockRef {
    volume: VolumeId,
    inode: INodeId,
    index: IndexId,
    block_type: BlockType,
}

impl BlockRef {
    /// Data block reference. Volume ids are truncated to `VOLUME_ID_MAX`.
    pub fn new(volume: VolumeId, inode: INodeId, index: IndexId) -> Self {
        Self::with_type(volume, inode, index, BlockType::Data)
    }

    pub fn with_type(
        volume: VolumeId,
        inode: INodeId,
        index: IndexId,
        block_type: BlockType,
    ) -> Self {
        Self {
            volume: volume & VOLUME_ID_MAX,
            inode,
            index,
            block_type,
        }
    }

    pub fn volume(&self) -> VolumeId {
        self.volume
    }

    pub fn inode(&self) -> INodeId {
        self.inode
    }

    pub fn index(&self) -> IndexId {
        self.index
    }

    pub fn block_type(&self) -> BlockType {
        self.block_type
    }

    pub fn to_bytes(&self) -> [u8; BLOCK_REF_BYTE_SIZE] {
        let packed = self.volume | (u64::from(self.block_type.as_u16()) << BLOCK_TYPE_SHIFT);
        let mut buf = [0u8; BLOCK_REF_BYTE_SIZE];
        buf[0..8].copy_from_slice(&packed.to_le_bytes());
        buf[8..16].copy_from_slice(&self.inode.to_le_bytes());
        buf[16..24].copy_from_slice(&self.index.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() != BLOCK_REF_BYTE_SIZE {
            return Err(TorusError::Protocol(format!(
                "block ref must be {} bytes, got {}",
                BLOCK_REF_BYTE_SIZE,
                buf.len()
            )));
        }

        let packed = read_u64_le(&buf[0..8]);
        let block_type = BlockType::from_u16((packed >> BLOCK_TYPE_SHIFT) as u16)?;

        Ok(Self {
            volume: packed & VOLUME_ID_MAX,
            inode: read_u64_le(&buf[8..16]),
            index: read_u64_le(&buf[16..24]),
            block_type,
        })
    }
}

impl fmt::Display for BlockRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.block_type {
            BlockType::Data => "data",
            BlockType::INode => "inode",
        };
        write!(
            f,
            "vol({}):inode({}):index({}):{}",
            self.volume, self.inode, self.index, kind
        )
    }
}

fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(bytes);
    u64::from_le_bytes(word)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_ref_layout_is_little_endian() {
        let block_ref = BlockRef::with_type(1, 2, 3, BlockType::INode);
        let bytes = block_ref.to_bytes();

        assert_eq!(&bytes[0..6], &[1, 0, 0, 0, 0, 0]);
        assert_eq!(&bytes[6..8], &[1, 0]);
        assert_eq!(&bytes[8..16], &2u64.to_le_bytes());
        assert_eq!(&bytes[16..24], &3u64.to_le_bytes());

        let decoded = BlockRef::from_bytes(&bytes).unwrap();
        assert_eq!(decoded, block_ref);
        assert_eq!(decoded.block_type(), BlockType::INode);
    }

    #[test]
    fn test_block_ref_volume_is_masked() {
        let block_ref = BlockRef::new(u64::MAX, 0, 0);
        assert_eq!(block_ref.volume(), VOLUME_ID_MAX);
        assert_eq!(block_ref.block_type(), BlockType::Data);
    }

    #[test]
    fn test_block_ref_rejects_bad_input() {
        assert!(BlockRef::from_bytes(&[0u8; 23]).is_err());

        let mut bytes = BlockRef::new(7, 7, 7).to_bytes();
        bytes[7] = 0xff;
        assert!(matches!(
            BlockRef::from_bytes(&bytes),
            Err(TorusError::Protocol(_))
        ));
    }
}
