//! Peer loop: announcement, transitive discovery, pruning.
//!
//! Every sweep announces the node to its peers, pulls their peer lists
//! for transitive discovery, probes buffered candidates before adopting
//! them, prunes peers that stay unreachable, honours the purge list
//! filled by emergency mode, and persists peer records and trust scores.

use crate::chain;
use crate::client::GossipClient;
use crate::db::DbError;
use crate::node::{protocol_acceptable, Node};
use crate::peers::{save_new_peer, UNREACHABLE_LIMIT};
use crate::types::TRUST_SELF;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::interval;
use tracing::{error, info};

/// Seconds between peer sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct PeerLoop {
    node: Arc<Node>,
    client: GossipClient,
}

impl PeerLoop {
    pub fn new(node: Arc<Node>, client: GossipClient) -> Self {
        info!("Starting Peers");
        Self { node, client }
    }

    pub async fn run(self) {
        self.update_local_address();

        let mut ticker = interval(SWEEP_INTERVAL);
        while !self.node.terminating() {
            ticker.tick().await;
            if let Err(error) = self.sweep().await {
                error!("Error in peer loop: {error}");
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
        }
        info!("Peer loop terminated");
    }

    /// Keep our own peer record current so other nodes can resolve our
    /// address from gossip.
    fn update_local_address(&self) {
        let _ = save_new_peer(
            &self.node.storage,
            self.node.config.ip,
            self.node.address.clone(),
            TRUST_SELF,
            true,
        );
    }

    async fn sweep(&self) -> Result<(), DbError> {
        self.seed_from_records().await?;
        self.process_purge_list().await;

        let peers: Vec<IpAddr> = {
            let peer_state = self.node.peer_state.read().await;
            peer_state
                .peers
                .iter()
                .copied()
                .filter(|ip| *ip != self.node.config.ip)
                .collect()
        };

        if !peers.is_empty() {
            let announce_fails = self
                .client
                .compound_announce_self(&peers, self.node.config.ip)
                .await;
            self.record_failures(announce_fails).await;

            let (discovered, list_fails) = self
                .client
                .compound_get_list_of::<IpAddr>("peers", &peers)
                .await;
            self.record_failures(list_fails).await;
            self.buffer_candidates(discovered).await;
        }

        self.probe_buffered().await?;
        self.prune_unreachable().await;
        self.promote_block_producers().await?;

        let consensus = self.node.consensus.read().await;
        consensus.trust.persist(&self.node.storage);
        Ok(())
    }

    /// First sweep after a restart: resume from the persisted peer set.
    async fn seed_from_records(&self) -> Result<(), DbError> {
        let known_empty = {
            let peer_state = self.node.peer_state.read().await;
            peer_state.peers.is_empty() && peer_state.peer_buffer.is_empty()
        };
        if !known_empty {
            return Ok(());
        }

        let records = self.node.storage.all_peers()?;
        let mut peer_state = self.node.peer_state.write().await;
        for record in records {
            if record.ip != self.node.config.ip {
                peer_state.peer_buffer.insert(record.ip);
            }
        }
        Ok(())
    }

    async fn process_purge_list(&self) {
        let purged: Vec<IpAddr> = {
            let mut peer_state = self.node.peer_state.write().await;
            let purged = std::mem::take(&mut peer_state.purge_list);
            for ip in &purged {
                peer_state.peers.remove(ip);
                peer_state.unreachable.insert(*ip, UNREACHABLE_LIMIT);
            }
            purged
        };
        for ip in purged {
            info!("Purged peer {ip}");
            self.node.consensus.write().await.trust.remove(ip);
        }
    }

    /// Queue unseen gossip candidates for probing.
    async fn buffer_candidates(&self, candidates: Vec<IpAddr>) {
        let mut peer_state = self.node.peer_state.write().await;
        for ip in candidates {
            if ip == self.node.config.ip
                || peer_state.peers.contains(&ip)
                || peer_state.unreachable.contains_key(&ip)
            {
                continue;
            }
            peer_state.peer_buffer.insert(ip);
        }
    }

    /// Probe every buffered candidate; adopters must answer `/status`
    /// with an acceptable protocol.
    async fn probe_buffered(&self) -> Result<(), DbError> {
        let buffered: Vec<IpAddr> = {
            let peer_state = self.node.peer_state.read().await;
            peer_state.peer_buffer.iter().copied().collect()
        };
        if buffered.is_empty() {
            return Ok(());
        }

        let mut probes = JoinSet::new();
        for ip in buffered {
            let client = self.client.clone();
            probes.spawn(async move { (ip, client.get_remote_status(ip).await) });
        }

        while let Some(joined) = probes.join_next().await {
            let Ok((ip, status)) = joined else { continue };
            match status {
                Some(status) if protocol_acceptable(status.protocol) => {
                    save_new_peer(
                        &self.node.storage,
                        ip,
                        status.address,
                        self.node.config.trust_default,
                        false,
                    )?;
                    let mut peer_state = self.node.peer_state.write().await;
                    peer_state.peer_buffer.remove(&ip);
                    peer_state.unreachable.remove(&ip);
                    if peer_state.peers.insert(ip) {
                        info!("Adopted peer {ip}");
                    }
                }
                Some(status) => {
                    info!("Protocol of {ip} is too low: {}", status.protocol);
                    let mut peer_state = self.node.peer_state.write().await;
                    peer_state.peer_buffer.remove(&ip);
                }
                None => {
                    let mut peer_state = self.node.peer_state.write().await;
                    peer_state.peer_buffer.remove(&ip);
                    *peer_state.unreachable.entry(ip).or_insert(0) += 1;
                }
            }
        }
        Ok(())
    }

    async fn record_failures(&self, fails: Vec<IpAddr>) {
        if fails.is_empty() {
            return;
        }
        let mut peer_state = self.node.peer_state.write().await;
        for ip in fails {
            *peer_state.unreachable.entry(ip).or_insert(0) += 1;
        }
    }

    /// Drop peers that stayed unreachable past the limit; their stale
    /// opinions leave the pools on the next consensus sweep.
    async fn prune_unreachable(&self) {
        let pruned: Vec<IpAddr> = {
            let mut peer_state = self.node.peer_state.write().await;
            let over_limit: Vec<IpAddr> = peer_state
                .unreachable
                .iter()
                .filter(|(_, count)| **count >= UNREACHABLE_LIMIT)
                .map(|(ip, _)| *ip)
                .collect();
            for ip in &over_limit {
                peer_state.peers.remove(ip);
            }
            over_limit
        };

        if pruned.is_empty() {
            return;
        }
        let mut consensus = self.node.consensus.write().await;
        for ip in pruned {
            info!("Pruned unreachable peer {ip}");
            consensus.status_pool.remove(&ip);
            consensus.block_hash_pool.remove(&ip);
            consensus.transaction_hash_pool.remove(&ip);
            consensus.block_producers_hash_pool.remove(&ip);
        }
    }

    /// Reachable peers with stored records are eligible producers;
    /// ourselves included.
    async fn promote_block_producers(&self) -> Result<(), DbError> {
        let mut producers: BTreeSet<IpAddr> = {
            let consensus = self.node.consensus.read().await;
            consensus.status_pool.keys().copied().collect()
        };
        producers.insert(self.node.config.ip);

        let mut eligible: BTreeSet<IpAddr> = BTreeSet::new();
        for ip in producers {
            if self.node.storage.ip_stored(ip)? {
                eligible.insert(ip);
            }
        }

        let mut pools = self.node.pools.write().await;
        if eligible != pools.block_producers {
            pools.block_producers = eligible;
            pools.block_producers_hash = chain::producer_set_hash(&pools.block_producers);
            self.node
                .storage
                .save_producer_set(&pools.block_producers_hash, &pools.block_producers)?;
            info!(
                "Block producer set now has {} members",
                pools.block_producers.len()
            );
        }
        Ok(())
    }
}
