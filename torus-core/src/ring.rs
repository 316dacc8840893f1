//! Placement rings.
//!
//! A ring is an immutable, versioned snapshot mapping a block to an ordered
//! list of peers. Rings are never mutated; a new version replaces the old
//! one wholesale.

use crate::block::BlockRef;
use crate::error::{Result, TorusError};
use sha2::{Digest, Sha256};
use std::fmt;

/// Ordered peers for one block. The first `replication` entries are the
/// desired replica set; the rest are fallbacks.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PeerPermutation {
    pub peers: Vec<String>,
    pub replication: usize,
}

impl PeerPermutation {
    pub fn new(peers: Vec<String>, replication: usize) -> Self {
        Self { peers, replication }
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn desired(&self) -> &[String] {
        &self.peers[..self.replication.min(self.peers.len())]
    }

    pub fn index_of(&self, uuid: &str) -> Option<usize> {
        self.peers.iter().position(|peer| peer == uuid)
    }

    pub fn is_desired(&self, uuid: &str) -> bool {
        self.desired().iter().any(|peer| peer == uuid)
    }
}

pub trait Ring: Send + Sync + fmt::Debug {
    fn get_peers(&self, block_ref: BlockRef) -> Result<PeerPermutation>;

    fn members(&self) -> Vec<String>;

    fn version(&self) -> u64;

    fn describe(&self) -> String;
}

#[derive(Debug, Clone, Default)]
pub struct EmptyRing {
    version: u64,
}

impl EmptyRing {
    pub fn new(version: u64) -> Self {
        Self { version }
    }
}

impl Ring for EmptyRing {
    fn get_peers(&self, _block_ref: BlockRef) -> Result<PeerPermutation> {
        Ok(PeerPermutation::default())
    }

    fn members(&self) -> Vec<String> {
        Vec::new()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn describe(&self) -> String {
        format!("Ring: Empty\nVersion: {}", self.version)
    }
}

/// Every block lives on exactly one peer.
#[derive(Debug, Clone)]
pub struct SingleRing {
    version: u64,
    peer: String,
}

impl SingleRing {
    pub fn new(version: u64, peer: impl Into<String>) -> Self {
        Self {
            version,
            peer: peer.into(),
        }
    }
}

impl Ring for SingleRing {
    fn get_peers(&self, _block_ref: BlockRef) -> Result<PeerPermutation> {
        Ok(PeerPermutation::new(vec![self.peer.clone()], 1))
    }

    fn members(&self) -> Vec<String> {
        vec![self.peer.clone()]
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn describe(&self) -> String {
        format!(
            "Ring: Single\nVersion: {}\nPeer: {}",
            self.version, self.peer
        )
    }
}

/// Members sorted by uuid; each block's permutation is the member list
/// rotated by a digest of its ref.
#[derive(Debug, Clone)]
pub struct ModRing {
    version: u64,
    members: Vec<String>,
    replication: usize,
}

impl ModRing {
    pub fn new(version: u64, mut members: Vec<String>, replication: usize) -> Result<Self> {
        if replication == 0 {
            return Err(TorusError::Config(
                "ring replication must be at least 1".to_string(),
            ));
        }

        members.sort();
        members.dedup();

        Ok(Self {
            version,
            members,
            replication,
        })
    }

    pub fn replication(&self) -> usize {
        self.replication
    }
}

impl Ring for ModRing {
    fn get_peers(&self, block_ref: BlockRef) -> Result<PeerPermutation> {
        if self.members.is_empty() {
            return Ok(PeerPermutation::default());
        }

        let count = self.members.len();
        let start = (placement_hash(block_ref) % count as u64) as usize;
        let peers = (0..count)
            .map(|offset| self.members[(start + offset) % count].clone())
            .collect();

        Ok(PeerPermutation::new(peers, self.replication.min(count)))
    }

    fn members(&self) -> Vec<String> {
        self.members.clone()
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn describe(&self) -> String {
        let mut out = format!(
            "Ring: Mod\nVersion: {}\nReplication: {}\nPeers:",
            self.version, self.replication
        );
        for member in &self.members {
            out.push_str("\n\t");
            out.push_str(member);
        }
        out
    }
}

// Digest of the wire encoding so placement agrees across builds.
fn placement_hash(block_ref: BlockRef) -> u64 {
    let digest = Sha256::digest(block_ref.to_bytes());
    let mut word = [0u8; 8];
    word.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(word)
}
