use thiserror::Error;

pub type Result<T> = std::result::Result<T, TorusError>;

#[derive(Error, Debug)]
pub enum TorusError {
    #[error("no peer available")]
    NoPeer,

    #[error("no peers for block")]
    NoPeersBlock,

    #[error("block unavailable")]
    BlockUnavailable,

    #[error("block not found")]
    BlockNotFound,

    #[error("out of space")]
    OutOfSpace,

    #[error("closed")]
    Closed,

    #[error("ring version regression: current {current}, proposed {proposed}")]
    RingVersionRegression { current: u64, proposed: u64 },

    #[error("invalid block size: expected {expected}, got {actual}")]
    InvalidBlockSize { expected: usize, actual: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TorusError {
    /// Errors after which the node must stop serving.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TorusError::RingVersionRegression { .. })
    }

    /// Per-peer failures that a read pass skips over instead of aborting.
    pub fn is_peer_miss(&self) -> bool {
        matches!(self, TorusError::BlockUnavailable | TorusError::NoPeer)
    }
}
