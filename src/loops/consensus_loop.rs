//! Consensus sampling: status pool, opinion pools, weighted majorities.
//!
//! Every sweep samples `/status` from the whole peer set, rebuilds the
//! three hash pools, and recomputes the majority opinion for each,
//! weighted by `max(1, trust)`. Ties break to the lexicographically
//! lowest hash; with fewer than two contributors the majority is
//! undefined.

use crate::client::GossipClient;
use crate::node::Node;
use crate::peers::TrustBook;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info};

/// Seconds between consensus sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(2);

/// Occurrence-weighted mode of an opinion pool. `None` with fewer than
/// two contributors.
pub fn weighted_majority(pool: &BTreeMap<IpAddr, String>, trust: &TrustBook) -> Option<String> {
    if pool.len() < 2 {
        return None;
    }
    let mut tally: BTreeMap<&String, i64> = BTreeMap::new();
    for (ip, opinion) in pool {
        let weight = trust.get(*ip).max(1);
        *tally.entry(opinion).or_insert(0) += weight;
    }
    tally
        .into_iter()
        .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
        .map(|(opinion, _)| opinion.clone())
}

/// Distinct opinion values ordered by descending occurrence count.
pub fn sort_occurrence(values: impl Iterator<Item = String>) -> Vec<String> {
    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    for value in values {
        *counts.entry(value).or_insert(0) += 1;
    }
    let mut ordered: Vec<(String, usize)> = counts.into_iter().collect();
    ordered.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ordered.into_iter().map(|(value, _)| value).collect()
}

pub struct ConsensusLoop {
    node: Arc<Node>,
    client: GossipClient,
}

impl ConsensusLoop {
    pub fn new(node: Arc<Node>, client: GossipClient) -> Self {
        info!("Starting Consensus");
        Self { node, client }
    }

    pub async fn run(self) {
        let mut ticker = interval(SWEEP_INTERVAL);
        while !self.node.terminating() {
            ticker.tick().await;
            if let Err(error) = self.sweep().await {
                error!("Error in consensus loop: {error}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        info!("Consensus loop terminated");
    }

    async fn sweep(&self) -> Result<(), crate::db::DbError> {
        let peers: Vec<IpAddr> = {
            let peer_state = self.node.peer_state.read().await;
            peer_state.peers.iter().copied().collect()
        };

        // own hashes stay fresh even while isolated
        refresh_hashes(&self.node).await;

        if peers.is_empty() {
            return Ok(());
        }

        let (status_pool, fails) = self.client.compound_get_status_pool(&peers).await;
        debug!(
            "Status sweep: {} answered, {} failed",
            status_pool.len(),
            fails.len()
        );

        {
            let mut consensus = self.node.consensus.write().await;
            consensus.block_hash_pool = status_pool
                .iter()
                .map(|(ip, s)| (*ip, s.latest_block_hash.clone()))
                .collect();
            consensus.transaction_hash_pool = status_pool
                .iter()
                .map(|(ip, s)| (*ip, s.transaction_pool_hash.clone()))
                .collect();
            consensus.block_producers_hash_pool = status_pool
                .iter()
                .map(|(ip, s)| (*ip, s.block_producers_hash.clone()))
                .collect();

            consensus.majority_block_hash =
                weighted_majority(&consensus.block_hash_pool, &consensus.trust);
            consensus.majority_transaction_pool_hash =
                weighted_majority(&consensus.transaction_hash_pool, &consensus.trust);
            consensus.majority_block_producers_hash =
                weighted_majority(&consensus.block_producers_hash_pool, &consensus.trust);

            consensus.average_trust = consensus.trust.average_over(status_pool.keys());
            consensus.status_pool = status_pool;
        }

        // unanswered peers are candidates for pruning by the peer loop
        if !fails.is_empty() {
            let mut peer_state = self.node.peer_state.write().await;
            for peer in fails {
                *peer_state.unreachable.entry(peer).or_insert(0) += 1;
            }
        }
        Ok(())
    }
}

/// Recompute the node's own cached pool hashes. The next sweep folds the
/// change into the opinion pools.
pub async fn refresh_hashes(node: &Node) {
    let mut pools = node.pools.write().await;
    Node::refresh_pool_hashes(&mut pools);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TRUST_MAX, TRUST_MIN};

    fn ip(last: u8) -> IpAddr {
        format!("10.0.0.{last}").parse().unwrap()
    }

    fn book() -> TrustBook {
        TrustBook::new(0, TRUST_MIN, TRUST_MAX)
    }

    #[test]
    fn test_majority_undefined_below_two() {
        let mut pool = BTreeMap::new();
        assert_eq!(weighted_majority(&pool, &book()), None);
        pool.insert(ip(1), "a".to_string());
        assert_eq!(weighted_majority(&pool, &book()), None);
    }

    #[test]
    fn test_majority_counts_occurrences() {
        let mut pool = BTreeMap::new();
        pool.insert(ip(1), "a".to_string());
        pool.insert(ip(2), "b".to_string());
        pool.insert(ip(3), "b".to_string());
        assert_eq!(weighted_majority(&pool, &book()), Some("b".to_string()));
    }

    #[test]
    fn test_majority_weighted_by_trust() {
        let mut trust = book();
        trust.set(ip(1), 1_000);

        let mut pool = BTreeMap::new();
        pool.insert(ip(1), "a".to_string());
        pool.insert(ip(2), "b".to_string());
        pool.insert(ip(3), "b".to_string());
        assert_eq!(weighted_majority(&pool, &trust), Some("a".to_string()));
    }

    #[test]
    fn test_majority_tie_breaks_to_lowest_hash() {
        let mut pool = BTreeMap::new();
        pool.insert(ip(1), "bbb".to_string());
        pool.insert(ip(2), "aaa".to_string());
        assert_eq!(weighted_majority(&pool, &book()), Some("aaa".to_string()));
    }

    #[test]
    fn test_sort_occurrence_orders_by_count() {
        let values = ["x", "y", "y", "z", "y", "z"]
            .iter()
            .map(|s| s.to_string());
        assert_eq!(sort_occurrence(values), vec!["y", "z", "x"]);
    }
}
