use crate::error::TorusError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Fan-out strategy for reads that cannot be served locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadLevel {
    /// Walk the permutation repeatedly, doubling the timeout each attempt.
    Block,
    /// Walk the permutation once with a fixed per-peer timeout.
    #[default]
    Sequential,
    /// Ask every desired replica at once, first answer wins.
    Spread,
}

/// How many replicas must accept a write before it is reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteLevel {
    #[default]
    All,
    One,
    Local,
}

impl FromStr for ReadLevel {
    type Err = TorusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(ReadLevel::Block),
            "sequential" => Ok(ReadLevel::Sequential),
            "spread" => Ok(ReadLevel::Spread),
            other => Err(TorusError::Config(format!(
                "invalid read level '{}': expected block, sequential or spread",
                other
            ))),
        }
    }
}

impl FromStr for WriteLevel {
    type Err = TorusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "all" => Ok(WriteLevel::All),
            "one" => Ok(WriteLevel::One),
            "local" => Ok(WriteLevel::Local),
            other => Err(TorusError::Config(format!(
                "invalid write level '{}': expected all, one or local",
                other
            ))),
        }
    }
}

impl fmt::Display for ReadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ReadLevel::Block => "block",
            ReadLevel::Sequential => "sequential",
            ReadLevel::Spread => "spread",
        };
        f.write_str(name)
    }
}

impl fmt::Display for WriteLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WriteLevel::All => "all",
            WriteLevel::One => "one",
            WriteLevel::Local => "local",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_rebalance_timeout_ms")]
    pub rebalance_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
    /// A peer whose last heartbeat is older than this is timed out. Zero
    /// disables the check.
    #[serde(default = "default_peer_timeout_ms")]
    pub peer_timeout_ms: u64,
}

fn default_op_timeout_ms() -> u64 {
    100
}

fn default_connect_timeout_ms() -> u64 {
    2_000
}

fn default_rebalance_timeout_ms() -> u64 {
    2_000
}

fn default_write_timeout_ms() -> u64 {
    2_000
}

fn default_keepalive_interval_ms() -> u64 {
    5_000
}

fn default_peer_timeout_ms() -> u64 {
    15_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            op_timeout_ms: default_op_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
            rebalance_timeout_ms: default_rebalance_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            peer_timeout_ms: default_peer_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn op(&self) -> Duration {
        Duration::from_millis(self.op_timeout_ms)
    }

    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rebalance(&self) -> Duration {
        Duration::from_millis(self.rebalance_timeout_ms)
    }

    pub fn write(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn peer_timeout(&self) -> Option<Duration> {
        (self.peer_timeout_ms > 0).then(|| Duration::from_millis(self.peer_timeout_ms))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DistributorOptions {
    #[serde(default)]
    pub read_level: ReadLevel,
    #[serde(default)]
    pub write_level: WriteLevel,
    /// Read cache budget in bytes.
    #[serde(default)]
    pub read_cache_size: u64,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RebalanceOptions {
    #[serde(default = "default_rebalance_enabled")]
    pub enabled: bool,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Delay between ticks when the last tick moved nothing.
    #[serde(default = "default_idle_tick_delay_ms")]
    pub idle_tick_delay_ms: u64,
    /// Lower bound on the delay between ticks.
    #[serde(default = "default_min_tick_delay_ms")]
    pub min_tick_delay_ms: u64,
    /// Delay removed per migrated block.
    #[serde(default = "default_tick_delay_step_ms")]
    pub tick_delay_step_ms: u64,
    #[serde(default = "default_pass_cooldown_ms")]
    pub pass_cooldown_ms: u64,
    #[serde(default = "default_pass_jitter_ms")]
    pub pass_jitter_ms: u64,
}

fn default_rebalance_enabled() -> bool {
    true
}

fn default_batch_size() -> usize {
    50
}

fn default_idle_tick_delay_ms() -> u64 {
    1_000
}

fn default_min_tick_delay_ms() -> u64 {
    10
}

fn default_tick_delay_step_ms() -> u64 {
    20
}

fn default_pass_cooldown_ms() -> u64 {
    30_000
}

fn default_pass_jitter_ms() -> u64 {
    10_000
}

impl Default for RebalanceOptions {
    fn default() -> Self {
        Self {
            enabled: default_rebalance_enabled(),
            batch_size: default_batch_size(),
            idle_tick_delay_ms: default_idle_tick_delay_ms(),
            min_tick_delay_ms: default_min_tick_delay_ms(),
            tick_delay_step_ms: default_tick_delay_step_ms(),
            pass_cooldown_ms: default_pass_cooldown_ms(),
            pass_jitter_ms: default_pass_jitter_ms(),
        }
    }
}

impl RebalanceOptions {
    /// Inter-tick delay: the idle delay shrinks linearly with the number of
    /// blocks the last tick migrated, never going below the minimum.
    pub fn tick_delay(&self, migrated: usize) -> Duration {
        let step = self.tick_delay_step_ms.saturating_mul(migrated as u64);
        let delay = self
            .idle_tick_delay_ms
            .saturating_sub(step)
            .max(self.min_tick_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Per-call overrides of the configured consistency levels.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockOptions {
    pub read_level: Option<ReadLevel>,
    pub write_level: Option<WriteLevel>,
}

impl BlockOptions {
    pub fn read_level(mut self, level: ReadLevel) -> Self {
        self.read_level = Some(level);
        self
    }

    pub fn write_level(mut self, level: WriteLevel) -> Self {
        self.write_level = Some(level);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_parse_case_insensitive() {
        assert_eq!("Spread".parse::<ReadLevel>().unwrap(), ReadLevel::Spread);
        assert_eq!(" local ".parse::<WriteLevel>().unwrap(), WriteLevel::Local);
        assert!("quorum".parse::<WriteLevel>().is_err());
    }

    #[test]
    fn test_tick_delay_shrinks_when_busy() {
        let options = RebalanceOptions::default();
        assert_eq!(options.tick_delay(0), Duration::from_millis(1_000));
        assert_eq!(options.tick_delay(10), Duration::from_millis(800));
        assert_eq!(options.tick_delay(1_000), Duration::from_millis(10));
    }
}
