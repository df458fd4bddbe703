//! Core loop: period state machine, block production, emergency recovery.
//!
//! Ticks once per second. Each tick re-evaluates the consensus mode
//! first; in normal mode it runs the action of the current period, in
//! emergency mode it syncs missing blocks from a trusted peer or rolls
//! the chain back until it rejoins the majority.

use crate::chain::{self, ChainError};
use crate::client::GossipClient;
use crate::db::DbError;
use crate::loops::consensus_loop::{refresh_hashes, sort_occurrence};
use crate::node::{period_for, Node, Pools};
use crate::peers::{
    DELTA_BAD_GAP, DELTA_BAD_SUGGESTION, DELTA_BAD_TRANSACTION, DELTA_NO_SUCCESSOR,
    DELTA_OVERSPEND, DELTA_PRODUCERS_OMIT_SELF, DELTA_ROLLBACK_DISAGREE,
};
use crate::pool::{merge_buffer, TxPool};
use crate::rollback::{rollback_one_block, RollbackError};
use crate::transactions::{self, TxError};
use crate::types::{
    timestamp_now, to_readable_amount, Block, Transaction, SYNC_BATCH,
};
use rand::seq::SliceRandom;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{error, info, warn};

#[derive(Error, Debug)]
pub enum CoreError {
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Rollback(#[from] RollbackError),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// True when our own opinion differs from a defined majority.
fn minority_consensus(majority_hash: Option<&String>, sample_hash: &str) -> bool {
    match majority_hash {
        None => false,
        Some(majority) => sample_hash != majority,
    }
}

pub struct CoreLoop {
    node: Arc<Node>,
    client: GossipClient,
    penalty_events: broadcast::Receiver<Value>,
}

impl CoreLoop {
    pub fn new(node: Arc<Node>, client: GossipClient) -> Self {
        info!("Starting Core");
        let penalty_events = node.bus.add_listener(crate::bus::PENALTY_LIST_UPDATE);
        Self {
            node,
            client,
            penalty_events,
        }
    }

    pub async fn run(mut self) {
        refresh_hashes(&self.node).await;

        let mut ticker = interval(Duration::from_secs(1));
        while !self.node.terminating() {
            ticker.tick().await;
            self.drain_penalty_events().await;
            self.check_mode().await;

            let outcome = if self.node.emergency.load(Ordering::Relaxed) {
                self.emergency_mode().await
            } else {
                self.normal_mode().await
            };
            if let Err(e) = outcome {
                error!("Error in core loop: {e}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        info!("Termination code reached, bye");
    }

    async fn drain_penalty_events(&mut self) {
        while let Ok(payload) = self.penalty_events.try_recv() {
            if let Ok(penalties) = serde_json::from_value(payload) {
                self.node.pools.write().await.penalties = penalties;
            }
        }
    }

    // =========================================================================
    // MODE CONTROL
    // =========================================================================

    async fn check_mode(&self) {
        let out_of_consensus = self.minority_block_consensus().await;
        let was_emergency = self.node.emergency.swap(out_of_consensus, Ordering::Relaxed);
        if out_of_consensus && !was_emergency {
            warn!("We are out of consensus");
        }
    }

    /// Out of consensus iff the majority names a block we neither hold
    /// nor head.
    async fn minority_block_consensus(&self) -> bool {
        let majority = {
            let consensus = self.node.consensus.read().await;
            consensus.majority_block_hash.clone()
        };
        let Some(majority) = majority else {
            return false;
        };

        let have_peers = !self.node.peer_state.read().await.peers.is_empty();
        let majority_known = matches!(self.node.storage.get_block(&majority), Ok(Some(_)));
        if majority_known && have_peers {
            return false;
        }

        let latest_hash = self.node.pools.read().await.latest_block.block_hash.clone();
        latest_hash != majority
    }

    // =========================================================================
    // NORMAL MODE
    // =========================================================================

    async fn normal_mode(&self) -> Result<(), CoreError> {
        let period = self.update_periods().await;

        match period {
            0 => {
                let mut pools = self.node.pools.write().await;
                if !pools.user_tx_buffer.is_empty() {
                    let limit = self.node.config.buffer_limit;
                    let Pools {
                        user_tx_buffer,
                        tx_buffer,
                        ..
                    } = &mut *pools;
                    merge_buffer(user_tx_buffer, tx_buffer, limit);
                }
            }
            1 => {
                let mut pools = self.node.pools.write().await;
                if !pools.tx_buffer.is_empty() {
                    let limit = self.node.config.buffer_limit;
                    let Pools {
                        tx_buffer,
                        transaction_pool,
                        ..
                    } = &mut *pools;
                    merge_buffer(tx_buffer, transaction_pool, limit);
                    Node::refresh_pool_hashes(&mut pools);
                }
            }
            2 => {
                let (tx_divergent, producers_divergent) = {
                    let consensus = self.node.consensus.read().await;
                    let pools = self.node.pools.read().await;
                    (
                        minority_consensus(
                            consensus.majority_transaction_pool_hash.as_ref(),
                            &pools.transaction_pool_hash,
                        ),
                        minority_consensus(
                            consensus.majority_block_producers_hash.as_ref(),
                            &pools.block_producers_hash,
                        ),
                    )
                };
                if tx_divergent {
                    self.replace_transaction_pool().await?;
                }
                if producers_divergent {
                    self.replace_block_producers().await?;
                }
            }
            _ => {
                let (have_peers, have_producers) = {
                    let peer_state = self.node.peer_state.read().await;
                    let pools = self.node.pools.read().await;
                    (!peer_state.peers.is_empty(), !pools.block_producers.is_empty())
                };
                if have_peers && have_producers {
                    self.production_turn().await?;
                } else {
                    warn!("Criteria for block production not met");
                }
            }
        }
        Ok(())
    }

    async fn update_periods(&self) -> u8 {
        let mut pools = self.node.pools.write().await;
        let old_period = pools.period;
        pools.since_last_block = chain::since_last_block(&pools.latest_block, timestamp_now());
        pools.period = period_for(pools.since_last_block, self.node.config.block_time);
        if old_period != pools.period {
            info!("Switched to period {}", pools.period);
        }
        pools.period
    }

    /// Period 3: build the deterministic candidate; only the elected
    /// leader applies it locally, everyone else receives it through sync.
    async fn production_turn(&self) -> Result<(), CoreError> {
        let candidate = {
            let pools = self.node.pools.read().await;
            chain::get_block_candidate(
                &self.node.storage,
                &self.node.config,
                &pools.block_producers,
                &pools.block_producers_hash,
                pools.transaction_pool.to_vec(),
                &pools.latest_block,
                &pools.penalties,
                pools.latest_block.block_timestamp + self.node.config.block_time,
            )?
        };

        let Some(candidate) = candidate else {
            warn!("No producer eligible for the next block");
            return Ok(());
        };

        if candidate.block_ip == self.node.config.ip && candidate.block_creator == self.node.address
        {
            if let Err(e) = self.produce_block(candidate, false, None).await {
                warn!("Block production skipped due to {e}");
            }
        }
        Ok(())
    }

    // =========================================================================
    // POOL REPLACEMENT (PERIOD 2)
    // =========================================================================

    async fn replace_transaction_pool(&self) -> Result<(), CoreError> {
        let hash_pool = self.node.consensus.read().await.transaction_hash_pool.clone();
        let Some(sync_from) = self.get_peer_to_sync_from(&hash_pool).await else {
            return Ok(());
        };

        if let Some(suggested) = self
            .replace_pool::<Vec<Transaction>>(sync_from, "transaction_pool")
            .await
        {
            let mut pools = self.node.pools.write().await;
            pools.transaction_pool = TxPool::from_entries(suggested);
            Node::refresh_pool_hashes(&mut pools);
        }
        Ok(())
    }

    async fn replace_block_producers(&self) -> Result<(), CoreError> {
        let hash_pool = self
            .node
            .consensus
            .read()
            .await
            .block_producers_hash_pool
            .clone();
        let Some(sync_from) = self.get_peer_to_sync_from(&hash_pool).await else {
            return Ok(());
        };

        let Some(suggested) = self
            .replace_pool::<Vec<IpAddr>>(sync_from, "block_producers")
            .await
        else {
            return Ok(());
        };

        if !suggested.contains(&self.node.config.ip) {
            self.adjust_trust(sync_from, DELTA_PRODUCERS_OMIT_SELF).await;
        }

        let mut replacements: BTreeSet<IpAddr> = BTreeSet::new();
        for producer in suggested {
            if self.node.storage.ip_stored(producer)? {
                replacements.insert(producer);
            }
        }

        let mut pools = self.node.pools.write().await;
        pools.block_producers = replacements;
        Node::refresh_pool_hashes(&mut pools);
        self.node
            .storage
            .save_producer_set(&pools.block_producers_hash, &pools.block_producers)?;
        Ok(())
    }

    /// Fetch a replacement pool from one trusted peer. An unusable
    /// suggestion costs the peer trust.
    async fn replace_pool<T: serde::de::DeserializeOwned>(
        &self,
        peer: IpAddr,
        key: &str,
    ) -> Option<T> {
        info!("{key} out of sync with majority at critical time, replacing from trusted peer");
        let suggested = self.client.get_from_single_target::<T>(key, peer).await;
        if suggested.is_none() {
            self.adjust_trust(peer, DELTA_BAD_SUGGESTION).await;
        }
        suggested
    }

    // =========================================================================
    // TRUSTED-PEER PICKER
    // =========================================================================

    /// Pick a peer to sync a pool from: prefer a trusted holder of the
    /// most common opinion, fall back to any holder when no one passes
    /// the trust gate.
    async fn get_peer_to_sync_from(&self, hash_pool: &BTreeMap<IpAddr, String>) -> Option<IpAddr> {
        let mut pool = hash_pool.clone();
        pool.remove(&self.node.config.ip);

        let sorted_hashes = sort_occurrence(pool.values().cloned());
        let mut entries: Vec<(IpAddr, String)> = pool.into_iter().collect();
        entries.shuffle(&mut rand::thread_rng());
        let participants = entries.len();

        let chosen = {
            let consensus = self.node.consensus.read().await;
            let mut chosen = None;
            'candidates: for hash_candidate in &sorted_hashes {
                for (peer, opinion) in &entries {
                    if opinion != hash_candidate {
                        continue;
                    }
                    let peer_trust = consensus.trust.get(*peer);
                    let peer_protocol = consensus
                        .status_pool
                        .get(peer)
                        .map(|status| status.protocol)
                        .unwrap_or(0);
                    if consensus.average_trust <= peer_trust
                        && participants > 2
                        && peer_protocol >= self.node.config.protocol
                    {
                        chosen = Some(*peer);
                        break 'candidates;
                    }
                }
                // no trusted holder; any holder of this opinion will do
                if let Some((peer, _)) = entries.iter().find(|(_, opinion)| opinion == hash_candidate)
                {
                    chosen = Some(*peer);
                    break 'candidates;
                }
            }
            chosen
        };

        if chosen.is_none() {
            info!("Ran out of options when picking trusted hash");
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        chosen
    }

    // =========================================================================
    // EMERGENCY MODE
    // =========================================================================

    async fn emergency_mode(&self) -> Result<(), CoreError> {
        warn!("Entering emergency mode");

        while self.node.emergency.load(Ordering::Relaxed) && !self.node.terminating() {
            let hash_pool = self.node.consensus.read().await.block_hash_pool.clone();
            match self.get_peer_to_sync_from(&hash_pool).await {
                None => {
                    info!("Could not find suitably trusted peer");
                }
                Some(peer) => {
                    let block_hash = self.node.pools.read().await.latest_block.block_hash.clone();

                    if self.client.knows_block(peer, &block_hash).await {
                        info!("{peer} knows block {block_hash}");
                        if !self.apply_blocks_from(peer, &block_hash).await {
                            break;
                        }
                    } else if self.node.rollbacks.load(Ordering::Relaxed)
                        <= self.node.config.max_rollbacks
                    {
                        let latest = self.node.pools.read().await.latest_block.clone();
                        match rollback_one_block(&self.node.storage, &latest) {
                            Ok(parent) => {
                                self.node.pools.write().await.latest_block = parent;
                                self.node.rollbacks.fetch_add(1, Ordering::Relaxed);
                                self.adjust_trust(peer, DELTA_ROLLBACK_DISAGREE).await;
                            }
                            Err(e) => {
                                error!("Rollback failed: {e}");
                                break;
                            }
                        }
                    } else {
                        error!("Rollbacks exhausted");
                        self.node.rollbacks.store(0, Ordering::Relaxed);
                        self.node.peer_state.write().await.purge_list.push(peer);
                        break;
                    }
                }
            }

            refresh_hashes(&self.node).await;
            self.check_mode().await;
        }
        Ok(())
    }

    /// Fetch and apply successors of our latest block from the peer.
    /// Returns false when the emergency episode should stop.
    async fn apply_blocks_from(&self, peer: IpAddr, from_hash: &str) -> bool {
        match self.client.get_blocks_after(peer, from_hash, SYNC_BATCH).await {
            Some(new_blocks) if !new_blocks.is_empty() => {
                for block in new_blocks {
                    if self.node.terminating() {
                        return false;
                    }
                    if let Err(e) = self.produce_block(block, true, Some(peer)).await {
                        error!("Failed to apply block from {peer}: {e}");
                        return false;
                    }
                }
                true
            }
            Some(_) => {
                info!("No newer blocks found from {peer}");
                false
            }
            None => {
                self.adjust_trust(peer, DELTA_NO_SUCCESSOR).await;
                error!("Failed to get blocks after {from_hash} from {peer}");
                false
            }
        }
    }

    // =========================================================================
    // BLOCK APPLICATION
    // =========================================================================

    /// Rebuild a synced block on top of our own chain tip so its canonical
    /// hash ties to our latest block.
    fn restructure_remote_block(latest: &Block, remote: Block) -> Block {
        chain::construct_block(
            latest.block_number + 1,
            remote.block_timestamp,
            latest.block_hash.clone(),
            remote.block_ip,
            remote.block_creator,
            remote.block_transactions,
            remote.block_producers_hash,
            remote.block_reward,
            remote.block_penalty,
        )
    }

    /// Validate and apply a block under the buffer lock. Trust penalties
    /// for a misbehaving remote peer are applied after the lock drops.
    pub async fn produce_block(
        &self,
        block: Block,
        remote: bool,
        remote_peer: Option<IpAddr>,
    ) -> Result<Block, CoreError> {
        let mut trust_deltas: Vec<(IpAddr, i64)> = Vec::new();
        let production = self
            .produce_block_locked(block, remote, remote_peer, &mut trust_deltas)
            .await;

        for (peer, delta) in trust_deltas {
            self.adjust_trust(peer, delta).await;
        }
        refresh_hashes(&self.node).await;
        production
    }

    async fn produce_block_locked(
        &self,
        block: Block,
        remote: bool,
        remote_peer: Option<IpAddr>,
        trust_deltas: &mut Vec<(IpAddr, i64)>,
    ) -> Result<Block, CoreError> {
        let mut pools = self.node.pools.write().await;
        let production_start = timestamp_now();
        warn!("Producing block");

        let block = if remote {
            Self::restructure_remote_block(&pools.latest_block, block)
        } else {
            block
        };

        self.validate_transactions_in_block(&mut pools, &block, remote, remote_peer, trust_deltas)?;

        if !chain::valid_block_gap(&block, &pools.latest_block, self.node.config.block_time) {
            info!("Block gap too tight");
            if remote {
                if let Some(peer) = remote_peer {
                    trust_deltas.push((peer, DELTA_BAD_GAP));
                }
            }
        }

        self.incorporate_block(&mut pools, &block)?;

        if self.node.config.ip == block.block_ip
            && self.node.address == block.block_creator
            && block.block_reward > 0
        {
            warn!("$$$ Congratulations! You won! $$$");
        }
        warn!("Block hash: {}", block.block_hash);
        warn!("Block number: {}", block.block_number);
        warn!("Winner IP: {}", block.block_ip);
        warn!("Winner address: {}", block.block_creator);
        warn!("Block reward: {}", to_readable_amount(block.block_reward));
        warn!("Transactions in block: {}", block.block_transactions.len());
        warn!("Remote block: {remote}");
        warn!("Production time: {}", timestamp_now() - production_start);

        Ok(block)
    }

    /// Spending and per-transaction validity over the block's contents.
    /// Included transactions leave every local pool regardless of the
    /// outcome.
    fn validate_transactions_in_block(
        &self,
        pools: &mut Pools,
        block: &Block,
        remote: bool,
        remote_peer: Option<IpAddr>,
        trust_deltas: &mut Vec<(IpAddr, i64)>,
    ) -> Result<(), CoreError> {
        let transactions = &block.block_transactions;

        if let Err(e) = transactions::validate_all_spending(&self.node.storage, transactions) {
            error!("Failed to validate spending during block production: {e}");
            if remote {
                if let Some(peer) = remote_peer {
                    trust_deltas.push((peer, DELTA_OVERSPEND));
                }
            }
            return Err(e.into());
        }

        for transaction in transactions {
            pools.transaction_pool.remove(&transaction.txid);
            pools.user_tx_buffer.remove(&transaction.txid);
            pools.tx_buffer.remove(&transaction.txid);

            if let Err(e) = transactions::validate_transaction(&self.node.storage, transaction) {
                error!("Failed to validate transaction during block production: {e}");
                if remote {
                    if let Some(peer) = remote_peer {
                        trust_deltas.push((peer, DELTA_BAD_TRANSACTION));
                    }
                }
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Apply the block: move value, index transactions, credit the
    /// reward, link the chain, and advance the tip.
    fn incorporate_block(&self, pools: &mut Pools, block: &Block) -> Result<(), CoreError> {
        let storage = &self.node.storage;

        for transaction in &block.block_transactions {
            transactions::incorporate_transaction(
                storage,
                transaction,
                &block.block_hash,
                block.block_number,
            )?;
        }

        storage.update_child(&block.parent_hash, Some(block.block_hash.clone()))?;
        storage.save_block(block)?;

        storage.change_balance(&block.block_creator, block.block_reward as i128)?;
        storage.change_produced(&block.block_creator, block.block_reward as i128)?;
        storage.add_totals(block.block_reward as i128, 0, block.block_penalty as i128)?;

        storage.set_latest_hash(&block.block_hash)?;
        pools.latest_block = block.clone();
        Ok(())
    }

    async fn adjust_trust(&self, peer: IpAddr, delta: i64) {
        self.node.consensus.write().await.trust.adjust(peer, delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minority_consensus() {
        assert!(!minority_consensus(None, "a"));
        assert!(!minority_consensus(Some(&"a".to_string()), "a"));
        assert!(minority_consensus(Some(&"b".to_string()), "a"));
    }
}
