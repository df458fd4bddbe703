//! Node configuration.
//!
//! Persisted as `config.json` in the data directory, created from the
//! CLI-provided ip/port and defaults on first launch; later launches read
//! the file as-is.

use crate::types::{
    Address, DEFAULT_BLOCK_TIME, DEFAULT_BUFFER_LIMIT, DEFAULT_MAX_ROLLBACKS, DEFAULT_PORT,
    GENESIS_BALANCE, PROTOCOL_VERSION, TRUST_DEFAULT, TRUST_MAX, TRUST_MIN,
};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Address holding the genesis reserve.
pub const GENESIS_ADDRESS: &str = "ndo18c3afa286439e7ebcb284710dbd4ae42bdaf21b80137b";

/// Declared producer of the genesis block.
pub const GENESIS_IP: &str = "78.102.98.72";

/// Fixed genesis timestamp (2022-12-01 00:00:00 UTC).
pub const GENESIS_TIMESTAMP: u64 = 1_669_852_800;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub ip: IpAddr,
    pub port: u16,
    pub protocol: u32,

    /// Seconds per block window.
    pub block_time: u64,
    /// Maximum entries per pool or buffer.
    pub buffer_limit: usize,
    /// Rollback budget per emergency episode.
    pub max_rollbacks: u32,

    pub trust_default: i64,
    pub trust_min: i64,
    pub trust_max: i64,

    /// Producers at or above this penalty count are skipped by election.
    pub penalty_limit: u64,
    /// Raw units deducted from the reward per penalty point.
    pub penalty_unit: u64,

    /// Reward of block 1, halved every `reward_halving_blocks`.
    pub initial_reward: u64,
    pub reward_halving_blocks: u64,

    pub genesis_address: Address,
    pub genesis_balance: u64,
    pub genesis_ip: IpAddr,
    pub genesis_timestamp: u64,

    /// Admin key for `/force_sync` and `/terminate` from non-loopback.
    pub server_key: String,

    #[serde(skip)]
    pub data_dir: PathBuf,
}

impl Config {
    pub fn with_defaults(ip: IpAddr, port: u16, data_dir: PathBuf) -> Self {
        let mut key = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut key);

        Self {
            ip,
            port,
            protocol: PROTOCOL_VERSION,
            block_time: DEFAULT_BLOCK_TIME,
            buffer_limit: DEFAULT_BUFFER_LIMIT,
            max_rollbacks: DEFAULT_MAX_ROLLBACKS,
            trust_default: TRUST_DEFAULT,
            trust_min: TRUST_MIN,
            trust_max: TRUST_MAX,
            penalty_limit: 10,
            penalty_unit: crate::types::RAW_PER_UNIT / 10,
            initial_reward: 5 * crate::types::RAW_PER_UNIT,
            reward_halving_blocks: 1_000_000,
            genesis_address: GENESIS_ADDRESS.to_string(),
            genesis_balance: GENESIS_BALANCE,
            genesis_ip: GENESIS_IP.parse().expect("fixed genesis ip"),
            genesis_timestamp: GENESIS_TIMESTAMP,
            server_key: hex::encode(key),
            data_dir,
        }
    }

    /// Load `config.json` from the data directory, creating it with
    /// defaults when missing.
    pub fn load_or_create(data_dir: &Path, ip: IpAddr, port: u16) -> Result<Self, ConfigError> {
        let path = data_dir.join("config.json");

        if path.exists() {
            let raw = std::fs::read_to_string(&path)?;
            let mut config: Config = serde_json::from_str(&raw)?;
            config.data_dir = data_dir.to_path_buf();
            return Ok(config);
        }

        std::fs::create_dir_all(data_dir)?;
        let config = Self::with_defaults(ip, port, data_dir.to_path_buf());
        std::fs::write(&path, serde_json::to_string_pretty(&config)?)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_or_create_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();

        let created = Config::load_or_create(dir.path(), ip, DEFAULT_PORT).unwrap();
        assert_eq!(created.block_time, DEFAULT_BLOCK_TIME);
        assert!(dir.path().join("config.json").exists());

        let loaded = Config::load_or_create(dir.path(), ip, DEFAULT_PORT).unwrap();
        assert_eq!(loaded.server_key, created.server_key);
        assert_eq!(loaded.genesis_address, GENESIS_ADDRESS);
    }
}
