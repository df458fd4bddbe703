//! Ledger and chain integration tests over tempdir-backed storage.

use nado::chain;
use nado::loops::CoreLoop;
use nado::node::Node;
use nado::transactions::{self, create_transaction};
use nado::types::{Account, PeerRecord, RAW_PER_UNIT, TRUST_SELF};
use nado::{Config, GossipClient, Keypair, Storage};
use serde_json::json;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::sync::Arc;

struct Fixture {
    _dir: tempfile::TempDir,
    node: Arc<Node>,
    core: CoreLoop,
    keypair: Keypair,
}

fn own_ip() -> IpAddr {
    "127.0.0.1".parse().unwrap()
}

/// Genesis ledger plus one funded wallet, with ourselves as the only
/// block producer.
async fn fixture(funding: u64) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_defaults(own_ip(), 9173, dir.path().to_path_buf());
    let storage = Arc::new(Storage::open(&dir.path().join("db")).unwrap());
    storage.init_genesis(&config).unwrap();

    let node_keys = Keypair::generate();
    storage
        .save_peer(
            &PeerRecord {
                ip: config.ip,
                address: node_keys.address(),
                trust: TRUST_SELF,
            },
            true,
        )
        .unwrap();

    let keypair = Keypair::generate();
    if funding > 0 {
        // moved out of the reserve so supply stays conserved
        storage
            .change_balance(&config.genesis_address, -(funding as i128))
            .unwrap();
        storage
            .change_balance(&keypair.address(), funding as i128)
            .unwrap();
    }

    let node = Arc::new(Node::new(config, storage, node_keys).unwrap());
    {
        let mut pools = node.pools.write().await;
        pools.block_producers = [own_ip()].into_iter().collect();
        Node::refresh_pool_hashes(&mut pools);
        let producers = pools.block_producers.clone();
        let hash = pools.block_producers_hash.clone();
        node.storage.save_producer_set(&hash, &producers).unwrap();
    }

    let core = CoreLoop::new(node.clone(), GossipClient::new(9173));
    Fixture {
        _dir: dir,
        node,
        core,
        keypair,
    }
}

async fn next_candidate(node: &Node) -> nado::types::Block {
    let pools = node.pools.read().await;
    chain::get_block_candidate(
        &node.storage,
        &node.config,
        &pools.block_producers,
        &pools.block_producers_hash,
        pools.transaction_pool.to_vec(),
        &pools.latest_block,
        &pools.penalties,
        pools.latest_block.block_timestamp + node.config.block_time,
    )
    .unwrap()
    .expect("a producer is eligible")
}

fn account(node: &Node, address: &str) -> Account {
    node.storage
        .get_account(address, false)
        .unwrap()
        .unwrap_or_else(|| Account::new(address.to_string()))
}

/// Sum of balance + burned - produced over all touched accounts must
/// track the reserve exactly.
fn conservation_sum(node: &Node, addresses: &[&str]) -> i128 {
    addresses
        .iter()
        .map(|address| {
            let account = account(node, address);
            account.balance as i128 + account.burned as i128 - account.produced as i128
        })
        .sum()
}

#[tokio::test]
async fn test_genesis_bootstrap() {
    let fixture = fixture(0).await;
    let pools = fixture.node.pools.read().await;

    assert_eq!(pools.latest_block.block_number, 0);
    assert_eq!(pools.latest_block.block_hash, pools.earliest_block.block_hash);

    let reserve = account(&fixture.node, &fixture.node.config.genesis_address);
    assert_eq!(reserve.balance, fixture.node.config.genesis_balance);
}

#[tokio::test]
async fn test_happy_path_block_applies_transaction() {
    let fixture = fixture(200 * RAW_PER_UNIT).await;
    let recipient = Keypair::generate().address();

    let tx = create_transaction(
        &fixture.keypair,
        recipient.clone(),
        100 * RAW_PER_UNIT,
        1,
        json!(""),
    )
    .unwrap();
    fixture
        .node
        .pools
        .write()
        .await
        .transaction_pool
        .insert(tx.clone());

    let candidate = next_candidate(&fixture.node).await;
    assert_eq!(candidate.block_ip, own_ip());
    let applied = fixture.core.produce_block(candidate, false, None).await.unwrap();

    // ledger moved
    assert_eq!(account(&fixture.node, &recipient).balance, 100 * RAW_PER_UNIT);
    let sender = account(&fixture.node, &fixture.keypair.address());
    assert_eq!(sender.balance, 100 * RAW_PER_UNIT - 1);
    assert_eq!(sender.burned, 1);

    // reward credited
    let creator = account(&fixture.node, &applied.block_creator);
    assert_eq!(creator.produced, applied.block_reward);

    // chain linked
    let genesis = fixture
        .node
        .storage
        .get_block(&applied.parent_hash)
        .unwrap()
        .unwrap();
    assert_eq!(genesis.child_hash.as_deref(), Some(applied.block_hash.as_str()));
    assert_eq!(applied.block_number, genesis.block_number + 1);

    // transaction indexed and retrievable
    let stored = fixture
        .node
        .storage
        .get_transaction(&tx.txid)
        .unwrap()
        .unwrap();
    assert_eq!(stored, tx);

    // pool is drained and the tip advanced
    let pools = fixture.node.pools.read().await;
    assert!(pools.transaction_pool.is_empty());
    assert_eq!(pools.latest_block.block_hash, applied.block_hash);
}

#[tokio::test]
async fn test_conservation_across_blocks() {
    let fixture = fixture(50 * RAW_PER_UNIT).await;
    let recipient = Keypair::generate().address();
    let genesis_address = fixture.node.config.genesis_address.clone();
    let sender = fixture.keypair.address();

    let tx = create_transaction(&fixture.keypair, recipient.clone(), 10 * RAW_PER_UNIT, 3, json!(""))
        .unwrap();
    fixture.node.pools.write().await.transaction_pool.insert(tx);

    let candidate = next_candidate(&fixture.node).await;
    let applied = fixture.core.produce_block(candidate, false, None).await.unwrap();

    let touched = [
        genesis_address.as_str(),
        sender.as_str(),
        recipient.as_str(),
        applied.block_creator.as_str(),
    ];
    // every unit outside the reserve is balance, burned fee, or reward
    assert_eq!(
        conservation_sum(&fixture.node, &touched),
        fixture.node.config.genesis_balance as i128
    );

    let totals = fixture.node.storage.fetch_totals().unwrap();
    assert_eq!(totals.fees, 3);
    assert_eq!(totals.produced, applied.block_reward);
}

#[tokio::test]
async fn test_rollback_restores_exact_state() {
    let fixture = fixture(30 * RAW_PER_UNIT).await;
    let recipient = Keypair::generate().address();
    let sender = fixture.keypair.address();
    let genesis_address = fixture.node.config.genesis_address.clone();

    let tx = create_transaction(&fixture.keypair, recipient.clone(), 5 * RAW_PER_UNIT, 2, json!(""))
        .unwrap();
    fixture
        .node
        .pools
        .write()
        .await
        .transaction_pool
        .insert(tx.clone());

    let before_accounts: Vec<Account> = [&genesis_address, &sender, &recipient]
        .iter()
        .map(|address| account(&fixture.node, address))
        .collect();
    let before_totals = fixture.node.storage.fetch_totals().unwrap();
    let before_tip = fixture.node.pools.read().await.latest_block.clone();

    let candidate = next_candidate(&fixture.node).await;
    let applied = fixture.core.produce_block(candidate, false, None).await.unwrap();
    assert_ne!(
        fixture.node.pools.read().await.latest_block.block_hash,
        before_tip.block_hash
    );

    let restored = nado::rollback::rollback_one_block(&fixture.node.storage, &applied).unwrap();
    assert_eq!(restored.block_hash, before_tip.block_hash);
    assert_eq!(restored.child_hash, None);

    let after_accounts: Vec<Account> = [&genesis_address, &sender, &recipient]
        .iter()
        .map(|address| account(&fixture.node, address))
        .collect();
    assert_eq!(before_accounts, after_accounts);
    assert_eq!(before_totals, fixture.node.storage.fetch_totals().unwrap());

    // the creator's reward is reversed and the block is gone
    assert!(fixture
        .node
        .storage
        .get_block(&applied.block_hash)
        .unwrap()
        .is_none());
    assert!(fixture
        .node
        .storage
        .get_transaction(&tx.txid)
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_double_spend_block_rejected() {
    let fixture = fixture(50).await;
    let recipient = Keypair::generate().address();

    // balance 50, spends of 40 and 20 cannot coexist
    let first = create_transaction(&fixture.keypair, recipient.clone(), 40, 0, json!("")).unwrap();
    let second = create_transaction(&fixture.keypair, recipient, 20, 0, json!("")).unwrap();
    {
        let mut pools = fixture.node.pools.write().await;
        pools.transaction_pool.insert(first);
        pools.transaction_pool.insert(second);
    }

    let candidate = next_candidate(&fixture.node).await;
    let before_tip = fixture.node.pools.read().await.latest_block.clone();
    assert!(fixture.core.produce_block(candidate, false, None).await.is_err());

    // nothing was applied
    let pools = fixture.node.pools.read().await;
    assert_eq!(pools.latest_block.block_hash, before_tip.block_hash);
    assert_eq!(account(&fixture.node, &fixture.keypair.address()).balance, 50);
}

#[tokio::test]
async fn test_blocks_link_through_child_traversal() {
    let fixture = fixture(10 * RAW_PER_UNIT).await;

    let first = next_candidate(&fixture.node).await;
    let first = fixture.core.produce_block(first, false, None).await.unwrap();
    let second = next_candidate(&fixture.node).await;
    let second = fixture.core.produce_block(second, false, None).await.unwrap();

    assert_ne!(first.block_hash, second.block_hash);
    assert_eq!(second.parent_hash, first.block_hash);

    let stored_first = fixture
        .node
        .storage
        .get_block(&first.block_hash)
        .unwrap()
        .unwrap();
    assert_eq!(
        stored_first.child_hash.as_deref(),
        Some(second.block_hash.as_str())
    );
    assert_eq!(
        fixture
            .node
            .storage
            .get_block_by_number(2)
            .unwrap()
            .unwrap()
            .block_hash,
        second.block_hash
    );
}

#[tokio::test]
async fn test_submitted_transaction_reaches_user_buffer() {
    let fixture = fixture(10 * RAW_PER_UNIT).await;
    let recipient = Keypair::generate().address();

    let tx = create_transaction(&fixture.keypair, recipient, RAW_PER_UNIT, 1, json!("")).unwrap();
    let outcome = fixture.node.merge_transaction(tx.clone(), true).await;
    assert!(outcome.result, "{}", outcome.reason);
    assert!(fixture.node.pools.read().await.user_tx_buffer.contains(&tx.txid));

    // resubmission is rejected
    let duplicate = fixture.node.merge_transaction(tx, true).await;
    assert!(!duplicate.result);
}

#[tokio::test]
async fn test_overspending_submission_rejected() {
    let fixture = fixture(10).await;
    let recipient = Keypair::generate().address();

    let tx = create_transaction(&fixture.keypair, recipient, 100, 0, json!("")).unwrap();
    let outcome = fixture.node.merge_transaction(tx, true).await;
    assert!(!outcome.result);
    assert!(outcome.reason.contains("spending"));
}

#[tokio::test]
async fn test_producer_sets_roundtrip() {
    let fixture = fixture(0).await;
    let producers: BTreeSet<IpAddr> = ["10.0.0.1".parse().unwrap(), "10.0.0.2".parse().unwrap()]
        .into_iter()
        .collect();
    let hash = chain::producer_set_hash(&producers);

    fixture
        .node
        .storage
        .save_producer_set(&hash, &producers)
        .unwrap();
    let loaded = fixture.node.storage.get_producer_set(&hash).unwrap().unwrap();
    assert_eq!(loaded, producers);
}
