use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Rebalancer progress, reported through heartbeats. Informational only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RebalanceInfo {
    /// Set while a pass reconciles a ring this peer has not converged on.
    pub rebalancing: bool,
    pub last_rebalance_blocks: u64,
    #[serde(default)]
    pub last_rebalance_bytes: u64,
    pub last_rebalance_finish: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub uuid: String,
    pub address: String,
    #[serde(default)]
    pub timed_out: bool,
    #[serde(default)]
    pub total_blocks: u64,
    #[serde(default)]
    pub used_blocks: u64,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub rebalance_info: RebalanceInfo,
}

impl PeerInfo {
    pub fn new(uuid: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            uuid: uuid.into(),
            address: address.into(),
            timed_out: false,
            total_blocks: 0,
            used_blocks: 0,
            last_seen: None,
            rebalance_info: RebalanceInfo::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerInfoList(pub Vec<PeerInfo>);

impl PeerInfoList {
    pub fn get(&self, uuid: &str) -> Option<&PeerInfo> {
        self.0.iter().find(|peer| peer.uuid == uuid)
    }

    pub fn uuids(&self) -> Vec<String> {
        self.0.iter().map(|peer| peer.uuid.clone()).collect()
    }

    /// Replaces the entry with the same uuid, or appends.
    pub fn upsert(&mut self, info: PeerInfo) {
        match self.0.iter_mut().find(|peer| peer.uuid == info.uuid) {
            Some(existing) => *existing = info,
            None => self.0.push(info),
        }
    }
}
