//! Message loop: asynchronous notifications between components.
//!
//! Recomputes the producer penalty list from the recent chain and
//! broadcasts it on the event bus; the core loop installs the update on
//! its next tick. A producer accrues one penalty point for every elected
//! turn it failed to produce since its last produced block.

use crate::bus::PENALTY_LIST_UPDATE;
use crate::chain;
use crate::db::Storage;
use crate::node::Node;
use crate::types::{Block, PenaltyList};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{debug, error, info};

/// Blocks inspected per penalty recomputation.
const PENALTY_WINDOW: u64 = 30;

pub struct MessageLoop {
    node: Arc<Node>,
}

impl MessageLoop {
    pub fn new(node: Arc<Node>) -> Self {
        info!("Starting Messages");
        Self { node }
    }

    pub async fn run(self) {
        let mut ticker = interval(Duration::from_secs(self.node.config.block_time));
        while !self.node.terminating() {
            ticker.tick().await;

            let latest = self.node.pools.read().await.latest_block.clone();
            match compute_penalties(&self.node.storage, &latest, PENALTY_WINDOW) {
                Ok(penalties) => {
                    debug!("Penalty list rebuilt: {} producers penalised", penalties.len());
                    self.node
                        .bus
                        .emit(PENALTY_LIST_UPDATE, serde_json::json!(penalties));
                }
                Err(error) => error!("Error in message loop: {error}"),
            }
        }
        info!("Message loop terminated");
    }
}

/// Walk the last `window` blocks oldest-first. A block produced by
/// someone other than the elected leader penalises that leader; a
/// producer's counter resets when it produces.
pub fn compute_penalties(
    storage: &Storage,
    latest: &Block,
    window: u64,
) -> Result<PenaltyList, crate::chain::ChainError> {
    let mut recent: Vec<Block> = Vec::new();
    let mut cursor = latest.clone();
    for _ in 0..window {
        if cursor.block_number == 0 {
            break;
        }
        let parent_hash = cursor.parent_hash.clone();
        recent.push(cursor);
        match storage.get_block(&parent_hash)? {
            Some(parent) => cursor = parent,
            None => break,
        }
    }
    recent.reverse();

    let mut penalties = PenaltyList::new();
    let no_penalties = PenaltyList::new();

    for block in &recent {
        let Some(producers) = storage.get_producer_set(&block.block_producers_hash)? else {
            continue;
        };
        let candidates = chain::resolve_candidates(storage, &producers)?;
        let Some(elected) =
            chain::elect_leader(&candidates, &block.parent_hash, &no_penalties, u64::MAX)
        else {
            continue;
        };

        if elected.address != block.block_creator {
            *penalties.entry(elected.address).or_insert(0) += 1;
        }
        penalties.remove(&block.block_creator);
    }

    Ok(penalties)
}
