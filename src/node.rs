//! Shared node state.
//!
//! `Node` owns every mutable in-memory structure the loops and the HTTP
//! surface read: the chain tip, the three transaction pools, the peer
//! sets, and the consensus opinion pools. Pool mutation happens under the
//! `pools` write lock; HTTP readers take momentary snapshots without
//! coordination, which is acceptable for diagnostic endpoints.

use crate::bus::EventBus;
use crate::chain;
use crate::config::Config;
use crate::crypto::Keypair;
use crate::db::{DbError, Storage};
use crate::peers::TrustBook;
use crate::pool::TxPool;
use crate::transactions;
use crate::types::{
    Address, Block, NodeStatus, PenaltyList, Transaction, PROTOCOL_VERSION,
};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Outcome of a transaction submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitResult {
    pub result: bool,
    pub reason: String,
}

impl SubmitResult {
    pub fn accepted() -> Self {
        Self {
            result: true,
            reason: "Transaction accepted".to_string(),
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            result: false,
            reason: reason.into(),
        }
    }
}

// =============================================================================
// STATE GROUPS
// =============================================================================

/// Everything guarded by the buffer lock: pools, chain tip, producers,
/// cached hashes, timing fields.
pub struct Pools {
    pub transaction_pool: TxPool,
    pub tx_buffer: TxPool,
    pub user_tx_buffer: TxPool,
    pub transaction_pool_hash: String,

    pub block_producers: BTreeSet<IpAddr>,
    pub block_producers_hash: String,

    pub latest_block: Block,
    pub earliest_block: Block,
    pub penalties: PenaltyList,

    pub since_last_block: u64,
    pub period: u8,
}

/// Peer bookkeeping shared between the peer loop and the HTTP surface.
#[derive(Default)]
pub struct PeerState {
    pub peers: BTreeSet<IpAddr>,
    pub peer_buffer: BTreeSet<IpAddr>,
    pub unreachable: BTreeMap<IpAddr, u32>,
    pub purge_list: Vec<IpAddr>,
    pub force_sync_ip: Option<IpAddr>,
}

/// Opinion pools produced by the consensus loop.
pub struct ConsensusState {
    pub status_pool: BTreeMap<IpAddr, NodeStatus>,
    pub block_hash_pool: BTreeMap<IpAddr, String>,
    pub transaction_hash_pool: BTreeMap<IpAddr, String>,
    pub block_producers_hash_pool: BTreeMap<IpAddr, String>,
    pub majority_block_hash: Option<String>,
    pub majority_transaction_pool_hash: Option<String>,
    pub majority_block_producers_hash: Option<String>,
    pub average_trust: i64,
    pub trust: TrustBook,
}

// =============================================================================
// NODE
// =============================================================================

pub struct Node {
    pub config: Config,
    pub storage: Arc<Storage>,
    pub keypair: Keypair,
    pub address: Address,
    started: Instant,

    pub pools: RwLock<Pools>,
    pub peer_state: RwLock<PeerState>,
    pub consensus: RwLock<ConsensusState>,
    pub bus: EventBus,

    pub terminate: AtomicBool,
    pub emergency: AtomicBool,
    pub rollbacks: AtomicU32,
}

impl Node {
    pub fn new(config: Config, storage: Arc<Storage>, keypair: Keypair) -> Result<Self, DbError> {
        let latest_block = storage.latest_block()?;
        let earliest_block = storage.earliest_block()?;

        let block_producers = storage
            .get_producer_set(&latest_block.block_producers_hash)?
            .unwrap_or_else(|| [config.ip].into_iter().collect());
        let block_producers_hash = chain::producer_set_hash(&block_producers);

        let mut trust = TrustBook::new(config.trust_default, config.trust_min, config.trust_max);
        trust.load(&storage);

        let address = keypair.address();
        Ok(Self {
            pools: RwLock::new(Pools {
                transaction_pool: TxPool::new(),
                tx_buffer: TxPool::new(),
                user_tx_buffer: TxPool::new(),
                transaction_pool_hash: chain::transaction_pool_hash(&[]),
                block_producers,
                block_producers_hash,
                latest_block,
                earliest_block,
                penalties: PenaltyList::new(),
                since_last_block: 0,
                period: 0,
            }),
            peer_state: RwLock::new(PeerState::default()),
            consensus: RwLock::new(ConsensusState {
                status_pool: BTreeMap::new(),
                block_hash_pool: BTreeMap::new(),
                transaction_hash_pool: BTreeMap::new(),
                block_producers_hash_pool: BTreeMap::new(),
                majority_block_hash: None,
                majority_transaction_pool_hash: None,
                majority_block_producers_hash: None,
                average_trust: 0,
                trust,
            }),
            bus: EventBus::new(),
            terminate: AtomicBool::new(false),
            emergency: AtomicBool::new(false),
            rollbacks: AtomicU32::new(0),
            config,
            storage,
            address,
            keypair,
            started: Instant::now(),
        })
    }

    pub fn uptime(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    pub fn terminating(&self) -> bool {
        self.terminate.load(Ordering::Relaxed)
    }

    pub fn request_terminate(&self) {
        self.terminate.store(true, Ordering::Relaxed);
    }

    /// The opinion set served on `/status`.
    pub async fn status(&self) -> NodeStatus {
        let pools = self.pools.read().await;
        NodeStatus {
            reported_uptime: self.uptime(),
            address: self.address.clone(),
            transaction_pool_hash: pools.transaction_pool_hash.clone(),
            block_producers_hash: pools.block_producers_hash.clone(),
            latest_block_hash: pools.latest_block.block_hash.clone(),
            earliest_block_hash: pools.earliest_block.block_hash.clone(),
            protocol: self.config.protocol,
            version: VERSION.to_string(),
        }
    }

    /// Recompute the cached pool hashes after any pool or producer change.
    pub fn refresh_pool_hashes(pools: &mut Pools) {
        pools.transaction_pool_hash =
            chain::transaction_pool_hash(&pools.transaction_pool.to_vec());
        pools.block_producers_hash = chain::producer_set_hash(&pools.block_producers);
    }

    /// Validate and buffer a submitted transaction. User submissions land
    /// in `user_tx_buffer`; node-originated ones go straight to
    /// `tx_buffer`.
    pub async fn merge_transaction(&self, transaction: Transaction, user_origin: bool) -> SubmitResult {
        let mut pools = self.pools.write().await;

        if let Err(error) = transactions::validate_transaction(&self.storage, &transaction) {
            return SubmitResult::rejected(format!("{error}"));
        }

        let mut combined: Vec<Transaction> = pools.transaction_pool.to_vec();
        combined.extend(pools.tx_buffer.to_vec());
        combined.extend(pools.user_tx_buffer.to_vec());

        if combined.iter().any(|tx| tx.txid == transaction.txid) {
            return SubmitResult::rejected(format!(
                "Transaction {} already in the pool",
                transaction.txid
            ));
        }

        if let Err(error) =
            transactions::validate_single_spending(&self.storage, &combined, &transaction)
        {
            return SubmitResult::rejected(format!("{error}"));
        }

        let target = if user_origin {
            &mut pools.user_tx_buffer
        } else {
            &mut pools.tx_buffer
        };
        if target.len() >= self.config.buffer_limit {
            return SubmitResult::rejected("Transaction buffer is full");
        }
        target.insert(transaction);
        SubmitResult::accepted()
    }
}

// =============================================================================
// PERIODS
// =============================================================================

/// Period table keyed on seconds since the latest block.
pub fn period_for(since_last_block: u64, block_time: u64) -> u8 {
    match since_last_block {
        s if s < 20 => 0,
        s if s < 40 => 1,
        s if s < block_time => 2,
        _ => 3,
    }
}

/// Protocol gate applied to discovered peers.
pub fn protocol_acceptable(remote: u32) -> bool {
    remote >= PROTOCOL_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_period_boundaries() {
        let block_time = 60;
        assert_eq!(period_for(0, block_time), 0);
        assert_eq!(period_for(19, block_time), 0);
        assert_eq!(period_for(20, block_time), 1);
        assert_eq!(period_for(39, block_time), 1);
        assert_eq!(period_for(40, block_time), 2);
        assert_eq!(period_for(59, block_time), 2);
        assert_eq!(period_for(60, block_time), 3);
        assert_eq!(period_for(600, block_time), 3);
    }
}
