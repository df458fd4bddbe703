//! Outbound HTTP gossip client.
//!
//! Wraps every remote call the loops make: status sampling, list
//! fetching, self-announcement, block probing, and block batch download.
//! Each call class has its own timeout and retry budget; failures land in
//! a fail list the caller folds into the unreachable map.

use crate::types::{Block, NodeStatus};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::info;

/// Timeout and retry budget for `/status` and `/announce_peer`.
const STATUS_TIMEOUT: Duration = Duration::from_secs(10);
const STATUS_RETRIES: u32 = 10;

/// Timeout and retry budget for list endpoints.
const LIST_TIMEOUT: Duration = Duration::from_secs(3);
const LIST_RETRIES: u32 = 3;

/// Pause between retries.
const RETRY_SLEEP: Duration = Duration::from_millis(300);

#[derive(Clone)]
pub struct GossipClient {
    http: reqwest::Client,
    port: u16,
}

impl GossipClient {
    pub fn new(port: u16) -> Self {
        Self {
            http: reqwest::Client::new(),
            port,
        }
    }

    fn url(&self, peer: IpAddr, path: &str) -> String {
        format!("http://{peer}:{}/{path}", self.port)
    }

    async fn get_json(&self, url: &str, timeout: Duration, retries: u32) -> Option<Value> {
        let mut remaining = retries;
        while remaining > 0 {
            let attempt = self
                .http
                .get(url)
                .timeout(timeout)
                .send()
                .await
                .and_then(|response| response.error_for_status());

            match attempt {
                Ok(response) => match response.json::<Value>().await {
                    Ok(value) => return Some(value),
                    Err(_) => remaining -= 1,
                },
                Err(_) => remaining -= 1,
            }
            if remaining > 0 {
                tokio::time::sleep(RETRY_SLEEP).await;
            }
        }
        None
    }

    // =========================================================================
    // SINGLE-TARGET CALLS
    // =========================================================================

    pub async fn get_remote_status(&self, peer: IpAddr) -> Option<NodeStatus> {
        let value = self
            .get_json(&self.url(peer, "status"), STATUS_TIMEOUT, STATUS_RETRIES)
            .await?;
        serde_json::from_value(value).ok()
    }

    /// Fetch a named list endpoint (`peers`, `transaction_pool`,
    /// `block_producers`, ...) and unwrap the `{key: value}` envelope.
    pub async fn get_list_of<T: DeserializeOwned>(&self, key: &str, peer: IpAddr) -> Option<T> {
        let value = self
            .get_json(&self.url(peer, key), LIST_TIMEOUT, LIST_RETRIES)
            .await?;
        serde_json::from_value(value.get(key)?.clone()).ok()
    }

    /// Same as `get_list_of`, used when replacing a pool from one trusted
    /// peer.
    pub async fn get_from_single_target<T: DeserializeOwned>(
        &self,
        key: &str,
        peer: IpAddr,
    ) -> Option<T> {
        self.get_list_of(key, peer).await
    }

    pub async fn announce_self(&self, peer: IpAddr, own_ip: IpAddr) -> Option<String> {
        let url = format!("{}?ip={own_ip}", self.url(peer, "announce_peer"));
        let value = self.get_json(&url, STATUS_TIMEOUT, STATUS_RETRIES).await?;
        Some(value.to_string())
    }

    /// Whether the peer stores the given block.
    pub async fn knows_block(&self, peer: IpAddr, hash: &str) -> bool {
        let url = format!("{}?hash={hash}", self.url(peer, "get_block"));
        self.get_json(&url, LIST_TIMEOUT, LIST_RETRIES).await.is_some()
    }

    /// Fetch up to `count` successors of `from_hash` by child traversal.
    pub async fn get_blocks_after(
        &self,
        peer: IpAddr,
        from_hash: &str,
        count: u64,
    ) -> Option<Vec<Block>> {
        let url = format!(
            "{}?hash={from_hash}&count={count}",
            self.url(peer, "get_blocks_after")
        );
        let value = self.get_json(&url, STATUS_TIMEOUT, LIST_RETRIES).await?;
        serde_json::from_value(value.get("blocks_after")?.clone()).ok()
    }

    // =========================================================================
    // COMPOUND FAN-OUT
    // =========================================================================

    /// Sample `/status` from every peer at once. Returns the status pool
    /// and the peers that never answered.
    pub async fn compound_get_status_pool(
        &self,
        peers: &[IpAddr],
    ) -> (BTreeMap<IpAddr, NodeStatus>, Vec<IpAddr>) {
        let mut tasks = JoinSet::new();
        for peer in peers.iter().copied() {
            let client = self.clone();
            tasks.spawn(async move { (peer, client.get_remote_status(peer).await) });
        }

        let mut pool = BTreeMap::new();
        let mut fails = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((peer, result)) = joined {
                match result {
                    Some(status) => {
                        pool.insert(peer, status);
                    }
                    None => {
                        info!("Failed to get status from {peer}");
                        fails.push(peer);
                    }
                }
            }
        }
        (pool, fails)
    }

    /// Fetch a list endpoint from every peer, flattening and deduplicating
    /// the results.
    pub async fn compound_get_list_of<T>(
        &self,
        key: &'static str,
        peers: &[IpAddr],
    ) -> (Vec<T>, Vec<IpAddr>)
    where
        T: DeserializeOwned + PartialEq + Send + 'static,
    {
        let mut tasks = JoinSet::new();
        for peer in peers.iter().copied() {
            let client = self.clone();
            tasks.spawn(async move { (peer, client.get_list_of::<Vec<T>>(key, peer).await) });
        }

        let mut merged: Vec<T> = Vec::new();
        let mut fails = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((peer, result)) = joined {
                match result {
                    Some(entries) => {
                        for entry in entries {
                            if !merged.contains(&entry) {
                                merged.push(entry);
                            }
                        }
                    }
                    None => {
                        info!("Failed to get {key} of {peer}");
                        fails.push(peer);
                    }
                }
            }
        }
        (merged, fails)
    }

    /// Announce ourselves to every peer. Returns the peers that never
    /// answered.
    pub async fn compound_announce_self(&self, peers: &[IpAddr], own_ip: IpAddr) -> Vec<IpAddr> {
        let mut tasks = JoinSet::new();
        for peer in peers.iter().copied() {
            let client = self.clone();
            tasks.spawn(async move { (peer, client.announce_self(peer, own_ip).await) });
        }

        let mut fails = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            if let Ok((peer, result)) = joined {
                if result.is_none() {
                    info!("Failed to announce self to {peer}");
                    fails.push(peer);
                }
            }
        }
        fails
    }
}
