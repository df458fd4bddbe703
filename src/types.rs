//! Core data model: transactions, blocks, accounts, peer records, status.
//!
//! Amounts are integers in raw units; 10⁹ raw units = 1 readable unit.
//! Hashes are hex-encoded BLAKE2b-256 digests of canonical JSON; addresses
//! are `ndo` plus the hex BLAKE2b-192 digest of the public key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

// =============================================================================
// PROTOCOL CONSTANTS
// =============================================================================

/// Protocol version number. Peers with a lower version are not adopted.
pub const PROTOCOL_VERSION: u32 = 3;

/// Default TCP port for the HTTP gossip surface.
pub const DEFAULT_PORT: u16 = 9173;

/// Raw units per readable unit.
pub const RAW_PER_UNIT: u64 = 1_000_000_000;

/// Initial balance minted to the genesis account, in raw units.
pub const GENESIS_BALANCE: u64 = 1_000_000_000_000_000_000;

/// Seconds in one block window.
pub const DEFAULT_BLOCK_TIME: u64 = 60;

/// Maximum entries per transaction pool or buffer.
pub const DEFAULT_BUFFER_LIMIT: usize = 250;

/// Rollback budget per emergency-mode episode.
pub const DEFAULT_MAX_ROLLBACKS: u32 = 3;

/// Blocks fetched per sync batch in emergency mode.
pub const SYNC_BATCH: u64 = 50;

/// Upper bound on blocks served by `get_blocks_after` / `get_blocks_before`.
pub const MAX_BLOCK_WALK: u64 = 100;

// =============================================================================
// TRUST
// =============================================================================

/// Trust assigned to our own peer record on first launch.
pub const TRUST_SELF: i64 = 10_000;

/// Trust assigned to newly discovered peers.
pub const TRUST_DEFAULT: i64 = 0;

/// Saturation bounds for trust scores.
pub const TRUST_MIN: i64 = -1_000_000;
pub const TRUST_MAX: i64 = 1_000_000;

// =============================================================================
// ALIASES
// =============================================================================

/// `ndo` + 48 hex characters.
pub type Address = String;

/// Hex-encoded BLAKE2b-256 digest, 64 characters.
pub type BlockHash = String;

pub type Txid = String;

// =============================================================================
// TRANSACTION
// =============================================================================

/// A signed transfer.
///
/// `txid` is the hash of the canonical JSON without `txid` and `signature`;
/// `signature` covers the canonical JSON without `signature`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub sender: Address,
    pub recipient: Address,
    pub amount: u64,
    pub timestamp: u64,
    pub data: serde_json::Value,
    pub nonce: String,
    pub fee: u64,
    pub public_key: String,
    pub txid: Txid,
    pub signature: String,
}

// =============================================================================
// BLOCK
// =============================================================================

/// A chain block.
///
/// `block_hash` covers the canonical JSON without `block_hash` and
/// `child_hash`; `child_hash` is written once the successor applies and is
/// the only mutable field of a stored block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    pub block_number: u64,
    pub block_timestamp: u64,
    pub parent_hash: BlockHash,
    pub child_hash: Option<BlockHash>,
    pub block_ip: IpAddr,
    pub block_creator: Address,
    pub block_transactions: Vec<Transaction>,
    pub block_hash: BlockHash,
    pub block_producers_hash: String,
    pub block_reward: u64,
    pub block_penalty: u64,
}

// =============================================================================
// ACCOUNT
// =============================================================================

/// Ledger account, created lazily on first reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub address: Address,
    pub balance: u64,
    /// Lifetime block rewards credited to this address.
    pub produced: u64,
    /// Lifetime fees burned by this address.
    pub burned: u64,
}

impl Account {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            balance: 0,
            produced: 0,
            burned: 0,
        }
    }
}

// =============================================================================
// PEERS AND STATUS
// =============================================================================

/// Persistent record of a known peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub ip: IpAddr,
    pub address: Address,
    pub trust: i64,
}

/// The opinion set a node reports on `/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub reported_uptime: u64,
    pub address: Address,
    pub transaction_pool_hash: String,
    pub block_producers_hash: String,
    pub latest_block_hash: BlockHash,
    pub earliest_block_hash: BlockHash,
    pub protocol: u32,
    pub version: String,
}

/// Penalty counters keyed by producer address.
pub type PenaltyList = BTreeMap<Address, u64>;

// =============================================================================
// AMOUNTS
// =============================================================================

/// Format a raw amount as a readable decimal string.
pub fn to_readable_amount(raw: u64) -> String {
    let whole = raw / RAW_PER_UNIT;
    let frac = raw % RAW_PER_UNIT;
    format!("{whole}.{frac:09}")
}

/// Convert readable units to raw units. Saturates on overflow.
pub fn to_raw_amount(readable: u64) -> u64 {
    readable.saturating_mul(RAW_PER_UNIT)
}

/// Current unix time in seconds.
pub fn timestamp_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readable_amount() {
        assert_eq!(to_readable_amount(0), "0.000000000");
        assert_eq!(to_readable_amount(RAW_PER_UNIT), "1.000000000");
        assert_eq!(to_readable_amount(100 * RAW_PER_UNIT + 5), "100.000000005");
    }

    #[test]
    fn test_raw_amount_round_trip() {
        assert_eq!(to_raw_amount(1), RAW_PER_UNIT);
        assert_eq!(to_raw_amount(0), 0);
        assert_eq!(to_raw_amount(u64::MAX), u64::MAX);
    }
}
