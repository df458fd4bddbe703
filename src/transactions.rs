//! Transaction validation, spending checks, and ledger application.
//!
//! A transaction is valid iff its addresses pass structural checks, the
//! sender address derives from the attached public key, the signature
//! verifies the canonical JSON minus `signature`, the txid equals the hash
//! of the canonical JSON minus `txid` and `signature`, and no stored
//! transaction already carries that txid.

use crate::crypto::{self, CryptoError};
use crate::db::{DbError, Storage};
use crate::types::{timestamp_now, Address, Transaction};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TxError {
    #[error("invalid sender {0}")]
    InvalidSender(Address),
    #[error("invalid recipient {0}")]
    InvalidRecipient(Address),
    #[error("sender does not match public key")]
    SenderProof,
    #[error("txid does not match transaction content")]
    TxidMismatch,
    #[error("transaction {0} already exists")]
    Duplicate(String),
    #[error("{0} spending more than owned")]
    Overspend(Address),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Db(#[from] DbError),
}

// =============================================================================
// CONSTRUCTION
// =============================================================================

/// Construct a signed transaction: txid over the pre-signed fields first,
/// signature over everything but itself last.
pub fn create_transaction(
    keypair: &crypto::Keypair,
    recipient: Address,
    amount: u64,
    fee: u64,
    data: serde_json::Value,
) -> Result<Transaction, CryptoError> {
    let mut transaction = Transaction {
        sender: keypair.address(),
        recipient,
        amount,
        timestamp: timestamp_now(),
        data,
        nonce: crypto::create_nonce(),
        fee,
        public_key: keypair.public_hex(),
        txid: String::new(),
        signature: String::new(),
    };

    transaction.txid = crypto::hash_record(&transaction, &["txid", "signature"])?;
    let message = crypto::canonical_without(&transaction, &["signature"])?;
    transaction.signature = keypair.sign(message.as_bytes());
    Ok(transaction)
}

// =============================================================================
// VALIDATION
// =============================================================================

/// Signature and sender-proof check, independent of chain state.
pub fn validate_origin(transaction: &Transaction) -> Result<(), TxError> {
    if !crypto::proof_sender(&transaction.sender, &transaction.public_key) {
        return Err(TxError::SenderProof);
    }
    let message = crypto::canonical_without(transaction, &["signature"])?;
    crypto::verify_signature(&transaction.public_key, message.as_bytes(), &transaction.signature)?;
    Ok(())
}

/// Full validity check for a transaction entering a pool or a block.
pub fn validate_transaction(storage: &Storage, transaction: &Transaction) -> Result<(), TxError> {
    if !crypto::validate_address(&transaction.sender) {
        return Err(TxError::InvalidSender(transaction.sender.clone()));
    }
    if !crypto::validate_address(&transaction.recipient) {
        return Err(TxError::InvalidRecipient(transaction.recipient.clone()));
    }
    validate_origin(transaction)?;

    let expected = crypto::hash_record(transaction, &["txid", "signature"])?;
    if expected != transaction.txid {
        return Err(TxError::TxidMismatch);
    }
    if storage.tx_block_hash(&transaction.txid)?.is_some() {
        return Err(TxError::Duplicate(transaction.txid.clone()));
    }
    Ok(())
}

// =============================================================================
// SPENDING
// =============================================================================

fn sender_balance(storage: &Storage, sender: &str) -> Result<u64, TxError> {
    Ok(storage
        .get_account(sender, false)?
        .map(|account| account.balance)
        .unwrap_or(0))
}

/// Running-sum spending check for one sender over the given entries.
fn check_sender_spending(
    storage: &Storage,
    sender: &str,
    entries: &[Transaction],
) -> Result<(), TxError> {
    let standing_balance = sender_balance(storage, sender)?;
    let mut spending: u128 = 0;

    for tx in entries.iter().filter(|tx| tx.sender == sender) {
        spending += tx.amount as u128 + tx.fee as u128;
        if spending > standing_balance as u128 {
            return Err(TxError::Overspend(sender.to_string()));
        }
    }
    Ok(())
}

/// Validate a candidate against the pool it would join: simulate the pool
/// with the candidate appended and re-run the sender's running sum.
pub fn validate_single_spending(
    storage: &Storage,
    pool: &[Transaction],
    candidate: &Transaction,
) -> Result<(), TxError> {
    let mut future_pool: Vec<Transaction> = pool.to_vec();
    future_pool.push(candidate.clone());
    check_sender_spending(storage, &candidate.sender, &future_pool)
}

/// Validate every sender's running sum over a whole pool, in the pool's
/// current order.
pub fn validate_all_spending(storage: &Storage, pool: &[Transaction]) -> Result<(), TxError> {
    let mut seen: Vec<&str> = Vec::new();
    for tx in pool {
        if seen.contains(&tx.sender.as_str()) {
            continue;
        }
        seen.push(&tx.sender);
        check_sender_spending(storage, &tx.sender, pool)?;
    }
    Ok(())
}

// =============================================================================
// APPLICATION
// =============================================================================

/// Move value for a transaction: debit the sender by amount plus fee,
/// credit the recipient by amount, burn the fee. `revert` undoes the same
/// movement exactly.
pub fn reflect_transaction(
    storage: &Storage,
    transaction: &Transaction,
    revert: bool,
) -> Result<(), TxError> {
    let amount = transaction.amount as i128;
    let fee = transaction.fee as i128;

    if revert {
        storage.change_balance(&transaction.recipient, -amount)?;
        storage.change_balance(&transaction.sender, amount + fee)?;
        storage.change_burned(&transaction.sender, -fee)?;
        storage.add_totals(0, -fee, 0)?;
    } else {
        storage.change_balance(&transaction.sender, -(amount + fee))?;
        storage.change_balance(&transaction.recipient, amount)?;
        storage.change_burned(&transaction.sender, fee)?;
        storage.add_totals(0, fee, 0)?;
    }
    Ok(())
}

/// Apply and index a transaction under its block.
pub fn incorporate_transaction(
    storage: &Storage,
    transaction: &Transaction,
    block_hash: &str,
    block_number: u64,
) -> Result<(), TxError> {
    reflect_transaction(storage, transaction, false)?;
    storage.index_transaction(transaction, block_hash, block_number)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Keypair;
    use serde_json::json;

    fn open_storage() -> (tempfile::TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(dir.path()).unwrap();
        (dir, storage)
    }

    fn fund(storage: &Storage, address: &str, balance: u64) {
        storage.change_balance(address, balance as i128).unwrap();
    }

    #[test]
    fn test_create_transaction_is_valid() {
        let (_dir, storage) = open_storage();
        let keypair = Keypair::generate();
        let tx = create_transaction(&keypair, keypair.address(), 10, 1, json!("")).unwrap();
        validate_transaction(&storage, &tx).unwrap();
    }

    #[test]
    fn test_tampered_amount_fails_txid() {
        let (_dir, storage) = open_storage();
        let keypair = Keypair::generate();
        let mut tx = create_transaction(&keypair, keypair.address(), 10, 1, json!("")).unwrap();
        tx.amount = 11;
        assert!(matches!(
            validate_transaction(&storage, &tx),
            Err(TxError::Crypto(_)) | Err(TxError::TxidMismatch)
        ));
    }

    #[test]
    fn test_foreign_public_key_rejected() {
        let keypair = Keypair::generate();
        let other = Keypair::generate();
        let mut tx = create_transaction(&keypair, keypair.address(), 1, 0, json!("")).unwrap();
        tx.public_key = other.public_hex();
        assert!(matches!(validate_origin(&tx), Err(TxError::SenderProof)));
    }

    #[test]
    fn test_double_spend_rejected_pool_wide() {
        let (_dir, storage) = open_storage();
        let keypair = Keypair::generate();
        fund(&storage, &keypair.address(), 50);

        let first = create_transaction(&keypair, keypair.address(), 40, 0, json!("")).unwrap();
        let second = create_transaction(&keypair, keypair.address(), 20, 0, json!("")).unwrap();

        validate_all_spending(&storage, &[first.clone()]).unwrap();
        assert!(matches!(
            validate_all_spending(&storage, &[first, second]),
            Err(TxError::Overspend(_))
        ));
    }

    #[test]
    fn test_single_spending_counts_pool_state() {
        let (_dir, storage) = open_storage();
        let keypair = Keypair::generate();
        fund(&storage, &keypair.address(), 50);

        let pooled = create_transaction(&keypair, keypair.address(), 30, 0, json!("")).unwrap();
        let candidate = create_transaction(&keypair, keypair.address(), 30, 0, json!("")).unwrap();

        validate_single_spending(&storage, &[], &candidate).unwrap();
        assert!(validate_single_spending(&storage, &[pooled], &candidate).is_err());
    }

    #[test]
    fn test_reflect_revert_restores_balances() {
        let (_dir, storage) = open_storage();
        let keypair = Keypair::generate();
        let sender = keypair.address();
        fund(&storage, &sender, 100);

        let recipient_key = Keypair::generate();
        let tx = create_transaction(&recipient_key, sender.clone(), 0, 0, json!("")).unwrap();
        // hand-rolled transfer: sender -> recipient_key's address
        let tx = Transaction {
            sender: sender.clone(),
            recipient: recipient_key.address(),
            amount: 30,
            fee: 5,
            ..tx
        };

        reflect_transaction(&storage, &tx, false).unwrap();
        assert_eq!(storage.get_account(&sender, false).unwrap().unwrap().balance, 65);
        assert_eq!(
            storage
                .get_account(&recipient_key.address(), false)
                .unwrap()
                .unwrap()
                .balance,
            30
        );

        reflect_transaction(&storage, &tx, true).unwrap();
        let restored = storage.get_account(&sender, false).unwrap().unwrap();
        assert_eq!(restored.balance, 100);
        assert_eq!(restored.burned, 0);
        assert_eq!(storage.fetch_totals().unwrap().fees, 0);
    }
}
