//! Rollback: reverse the latest applied block and point the chain at its
//! parent.
//!
//! After a successful rollback the ledger state is identical to the state
//! immediately before the block was applied: transactions reverted in
//! reverse application order, the creator's reward and produced counter
//! reversed, the transaction index cleared, the block record deleted, and
//! the parent's `child_hash` unset.

use crate::chain::ChainError;
use crate::db::Storage;
use crate::transactions::{reflect_transaction, TxError};
use crate::types::Block;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum RollbackError {
    #[error("cannot roll back the genesis block")]
    GenesisBlock,
    #[error(transparent)]
    Tx(#[from] TxError),
    #[error(transparent)]
    Chain(#[from] ChainError),
    #[error(transparent)]
    Db(#[from] crate::db::DbError),
}

/// Revert the given latest block; returns the restored parent as the new
/// latest block.
pub fn rollback_one_block(storage: &Storage, block: &Block) -> Result<Block, RollbackError> {
    if block.block_number == 0 {
        return Err(RollbackError::GenesisBlock);
    }
    warn!(
        "Rolling back block {} ({})",
        block.block_number, block.block_hash
    );

    for transaction in block.block_transactions.iter().rev() {
        reflect_transaction(storage, transaction, true)?;
        storage.unindex_transaction(transaction)?;
    }

    storage.change_balance(&block.block_creator, -(block.block_reward as i128))?;
    storage.change_produced(&block.block_creator, -(block.block_reward as i128))?;
    storage.add_totals(
        -(block.block_reward as i128),
        0,
        -(block.block_penalty as i128),
    )?;

    storage.delete_block(block)?;

    let parent = storage.require_block(&block.parent_hash)?;
    storage.update_child(&parent.block_hash, None)?;
    storage.set_latest_hash(&parent.block_hash)?;
    let parent = storage.require_block(&parent.block_hash)?;

    info!(
        "Chain restored to block {} ({})",
        parent.block_number, parent.block_hash
    );
    Ok(parent)
}
