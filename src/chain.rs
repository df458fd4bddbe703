//! Block construction, validation helpers, and leader election.
//!
//! The leader for the next block is the producer whose address minimizes
//! `blake2b(address ‖ parent_hash)` among producers whose penalty count
//! stays under the configured limit. The digest comparison is byte-wise
//! with the address itself as the final tie-break, so every node derives
//! the same leader from the same producer set and parent.

use crate::config::Config;
use crate::crypto::{self, CryptoError};
use crate::db::{DbError, Storage};
use crate::types::{Address, Block, BlockHash, PenaltyList, Transaction};
use std::collections::BTreeSet;
use std::net::IpAddr;
use thiserror::Error;

/// Blocks inspected for the recommended fee.
const FEE_WINDOW: u64 = 10;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error(transparent)]
    Db(#[from] DbError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

// =============================================================================
// CONSTRUCTION
// =============================================================================

/// Build a block with its canonical hash. Transactions are sorted into
/// canonical pool order; `child_hash` stays unset until a successor applies.
#[allow(clippy::too_many_arguments)]
pub fn construct_block(
    block_number: u64,
    block_timestamp: u64,
    parent_hash: BlockHash,
    block_ip: IpAddr,
    block_creator: Address,
    mut block_transactions: Vec<Transaction>,
    block_producers_hash: String,
    block_reward: u64,
    block_penalty: u64,
) -> Block {
    block_transactions.sort_by(|a, b| a.txid.cmp(&b.txid));

    let mut block = Block {
        block_number,
        block_timestamp,
        parent_hash,
        child_hash: None,
        block_ip,
        block_creator,
        block_transactions,
        block_hash: String::new(),
        block_producers_hash,
        block_reward,
        block_penalty,
    };
    block.block_hash = block_hash(&block);
    block
}

/// Canonical hash of a block: every field except `block_hash` and
/// `child_hash`.
pub fn block_hash(block: &Block) -> BlockHash {
    crypto::hash_record(block, &["block_hash", "child_hash"]).expect("block serializes")
}

/// True iff the new block keeps the configured distance from its parent.
pub fn valid_block_gap(new_block: &Block, previous: &Block, gap: u64) -> bool {
    new_block.block_timestamp >= previous.block_timestamp.saturating_add(gap)
}

/// Seconds since the latest block's timestamp.
pub fn since_last_block(latest: &Block, now: u64) -> u64 {
    now.saturating_sub(latest.block_timestamp)
}

// =============================================================================
// HASH POOL CANONICALS
// =============================================================================

/// Canonical hash of a producer set: sorted textual ips.
pub fn producer_set_hash(producers: &BTreeSet<IpAddr>) -> String {
    let mut listed: Vec<String> = producers.iter().map(|ip| ip.to_string()).collect();
    listed.sort();
    crypto::hash_record(&listed, &[]).expect("ip list serializes")
}

/// Canonical hash of a transaction pool: sorted txids.
pub fn transaction_pool_hash(transactions: &[Transaction]) -> String {
    let mut txids: Vec<&str> = transactions.iter().map(|tx| tx.txid.as_str()).collect();
    txids.sort_unstable();
    crypto::hash_record(&txids, &[]).expect("txid list serializes")
}

// =============================================================================
// REWARDS AND PENALTIES
// =============================================================================

/// Reward schedule: the initial reward halves every
/// `reward_halving_blocks` blocks.
pub fn schedule_reward(config: &Config, block_number: u64) -> u64 {
    if config.reward_halving_blocks == 0 {
        return config.initial_reward;
    }
    let halvings = block_number / config.reward_halving_blocks;
    if halvings >= 64 {
        0
    } else {
        config.initial_reward >> halvings
    }
}

pub fn get_penalty(penalties: &PenaltyList, address: &str) -> u64 {
    penalties.get(address).copied().unwrap_or(0)
}

/// Raw units deducted from a producer's reward, capped at the reward.
pub fn penalty_deduction(config: &Config, penalties: &PenaltyList, address: &str, reward: u64) -> u64 {
    get_penalty(penalties, address)
        .saturating_mul(config.penalty_unit)
        .min(reward)
}

/// Average fee over the last `FEE_WINDOW` blocks.
pub fn fee_over_blocks(storage: &Storage, latest: &Block) -> Result<u64, ChainError> {
    let mut fees: u64 = 0;
    let mut count: u64 = 0;
    let mut cursor = latest.clone();

    for _ in 0..FEE_WINDOW {
        for tx in &cursor.block_transactions {
            fees = fees.saturating_add(tx.fee);
            count += 1;
        }
        if cursor.block_number == 0 {
            break;
        }
        match storage.get_block(&cursor.parent_hash)? {
            Some(parent) => cursor = parent,
            None => break,
        }
    }

    Ok(if count == 0 { 0 } else { fees / count })
}

// =============================================================================
// LEADER ELECTION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockCandidate {
    pub ip: IpAddr,
    pub address: Address,
}

/// Lottery distance of a producer for the given parent.
fn lottery_digest(address: &str, parent_hash: &str) -> [u8; 32] {
    crypto::blake2b_digest(format!("{address}{parent_hash}").as_bytes())
}

/// Deterministic leader: minimal `blake2b(address ‖ parent_hash)` among
/// producers under the penalty limit; exact digest ties fall back to the
/// lexicographically smaller address.
pub fn elect_leader(
    candidates: &[BlockCandidate],
    parent_hash: &str,
    penalties: &PenaltyList,
    penalty_limit: u64,
) -> Option<BlockCandidate> {
    candidates
        .iter()
        .filter(|c| get_penalty(penalties, &c.address) < penalty_limit)
        .min_by(|a, b| {
            lottery_digest(&a.address, parent_hash)
                .cmp(&lottery_digest(&b.address, parent_hash))
                .then_with(|| a.address.cmp(&b.address))
        })
        .cloned()
}

/// Resolve producer ips to addresses through the peer records. Producers
/// without a stored record cannot be elected.
pub fn resolve_candidates(
    storage: &Storage,
    producers: &BTreeSet<IpAddr>,
) -> Result<Vec<BlockCandidate>, ChainError> {
    let mut candidates = Vec::with_capacity(producers.len());
    for ip in producers {
        if let Some(record) = storage.get_peer(*ip)? {
            candidates.push(BlockCandidate {
                ip: *ip,
                address: record.address,
            });
        }
    }
    Ok(candidates)
}

/// Construct the next block candidate: elect the leader over the current
/// producer set and assemble the block from the frozen transaction pool.
#[allow(clippy::too_many_arguments)]
pub fn get_block_candidate(
    storage: &Storage,
    config: &Config,
    producers: &BTreeSet<IpAddr>,
    producers_hash: &str,
    transaction_pool: Vec<Transaction>,
    latest_block: &Block,
    penalties: &PenaltyList,
    timestamp: u64,
) -> Result<Option<Block>, ChainError> {
    let candidates = resolve_candidates(storage, producers)?;
    let Some(leader) = elect_leader(
        &candidates,
        &latest_block.block_hash,
        penalties,
        config.penalty_limit,
    ) else {
        return Ok(None);
    };

    let block_number = latest_block.block_number + 1;
    let schedule = schedule_reward(config, block_number);
    let penalty = penalty_deduction(config, penalties, &leader.address, schedule);

    Ok(Some(construct_block(
        block_number,
        timestamp,
        latest_block.block_hash.clone(),
        leader.ip,
        leader.address,
        transaction_pool,
        producers_hash.to_string(),
        schedule - penalty,
        penalty,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn test_config() -> Config {
        Config::with_defaults("127.0.0.1".parse().unwrap(), 9173, PathBuf::from("/tmp"))
    }

    fn block_at(number: u64, timestamp: u64) -> Block {
        construct_block(
            number,
            timestamp,
            "0".repeat(64),
            "127.0.0.1".parse().unwrap(),
            "ndo_creator".into(),
            Vec::new(),
            "producers".into(),
            0,
            0,
        )
    }

    #[test]
    fn test_block_hash_ignores_child() {
        let mut block = block_at(1, 100);
        let original = block.block_hash.clone();
        block.child_hash = Some("abc".into());
        assert_eq!(block_hash(&block), original);
    }

    #[test]
    fn test_valid_block_gap_boundary() {
        let previous = block_at(1, 100);
        assert!(valid_block_gap(&block_at(2, 160), &previous, 60));
        assert!(!valid_block_gap(&block_at(2, 159), &previous, 60));
    }

    #[test]
    fn test_schedule_reward_halves() {
        let mut config = test_config();
        config.initial_reward = 8;
        config.reward_halving_blocks = 10;
        assert_eq!(schedule_reward(&config, 5), 8);
        assert_eq!(schedule_reward(&config, 10), 4);
        assert_eq!(schedule_reward(&config, 25), 2);
        assert_eq!(schedule_reward(&config, 10 * 70), 0);
    }

    #[test]
    fn test_elect_leader_deterministic_and_penalty_gated() {
        let candidates = vec![
            BlockCandidate {
                ip: "10.0.0.1".parse().unwrap(),
                address: "ndo_a".into(),
            },
            BlockCandidate {
                ip: "10.0.0.2".parse().unwrap(),
                address: "ndo_b".into(),
            },
        ];

        let no_penalties = PenaltyList::new();
        let first = elect_leader(&candidates, "parent", &no_penalties, 10).unwrap();
        let second = elect_leader(&candidates, "parent", &no_penalties, 10).unwrap();
        assert_eq!(first, second);

        // the winner changes once it is penalty-gated out
        let mut penalties = PenaltyList::new();
        penalties.insert(first.address.clone(), 10);
        let replacement = elect_leader(&candidates, "parent", &penalties, 10).unwrap();
        assert_ne!(replacement.address, first.address);

        penalties.insert(replacement.address.clone(), 10);
        assert!(elect_leader(&candidates, "parent", &penalties, 10).is_none());
    }

    #[test]
    fn test_producer_set_hash_tracks_membership() {
        let mut producers: BTreeSet<IpAddr> = BTreeSet::new();
        producers.insert("10.0.0.1".parse().unwrap());
        let one = producer_set_hash(&producers);

        producers.insert("10.0.0.2".parse().unwrap());
        let two = producer_set_hash(&producers);
        assert_ne!(one, two);
        assert_eq!(two, producer_set_hash(&producers));
    }
}
