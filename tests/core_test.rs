//! Consensus machinery tests: periods, majorities, election, penalties.

use nado::chain::{self, BlockCandidate};
use nado::loops::consensus_loop::{sort_occurrence, weighted_majority};
use nado::loops::message_loop::compute_penalties;
use nado::node::period_for;
use nado::peers::TrustBook;
use nado::pool::{merge_buffer, TxPool};
use nado::transactions::create_transaction;
use nado::types::{PeerRecord, PenaltyList, TRUST_MAX, TRUST_MIN};
use nado::{Config, Keypair, Storage};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

fn ip(last: u8) -> IpAddr {
    format!("10.0.0.{last}").parse().unwrap()
}

#[test]
fn test_period_table_covers_block_window() {
    // documented boundaries for a 60 second window
    for (since, expected) in [
        (0, 0),
        (19, 0),
        (20, 1),
        (39, 1),
        (40, 2),
        (59, 2),
        (60, 3),
        (300, 3),
    ] {
        assert_eq!(period_for(since, 60), expected, "since={since}");
    }
}

#[test]
fn test_merge_buffer_three_stage_flow() {
    let keypair = Keypair::generate();
    let make = |amount| {
        create_transaction(&keypair, keypair.address(), amount, 0, json!("")).unwrap()
    };

    let mut user_buffer = TxPool::from_entries(vec![make(1), make(2), make(3), make(4)]);
    let mut tx_buffer = TxPool::new();
    let mut pool = TxPool::new();

    // period 0 honours the buffer limit
    merge_buffer(&mut user_buffer, &mut tx_buffer, 3);
    assert_eq!(tx_buffer.len(), 3);
    assert_eq!(user_buffer.len(), 1);

    // period 1 moves the staged entries onward
    merge_buffer(&mut tx_buffer, &mut pool, 10);
    assert!(tx_buffer.is_empty());
    assert_eq!(pool.len(), 3);

    // the survivor catches the next window
    merge_buffer(&mut user_buffer, &mut tx_buffer, 3);
    assert_eq!(tx_buffer.len(), 1);
}

#[test]
fn test_majority_follows_trust_weight_and_ties() {
    let mut trust = TrustBook::new(0, TRUST_MIN, TRUST_MAX);
    let mut pool: BTreeMap<IpAddr, String> = BTreeMap::new();

    pool.insert(ip(1), "hash_a".into());
    pool.insert(ip(2), "hash_b".into());
    // tie at weight 1 each: lexicographically lowest wins
    assert_eq!(weighted_majority(&pool, &trust), Some("hash_a".into()));

    // trust outweighs occurrence
    pool.insert(ip(3), "hash_b".into());
    assert_eq!(weighted_majority(&pool, &trust), Some("hash_b".into()));
    trust.set(ip(1), 5_000);
    assert_eq!(weighted_majority(&pool, &trust), Some("hash_a".into()));

    // negative trust still counts as weight one
    trust.set(ip(1), -5_000);
    assert_eq!(weighted_majority(&pool, &trust), Some("hash_b".into()));
}

#[test]
fn test_sort_occurrence_most_common_first() {
    let opinions = ["b", "a", "a", "c", "a", "c"].iter().map(|s| s.to_string());
    assert_eq!(sort_occurrence(opinions), vec!["a", "c", "b"]);
}

#[test]
fn test_election_is_stable_across_parents() {
    let candidates = vec![
        BlockCandidate {
            ip: ip(1),
            address: "ndo_one".into(),
        },
        BlockCandidate {
            ip: ip(2),
            address: "ndo_two".into(),
        },
        BlockCandidate {
            ip: ip(3),
            address: "ndo_three".into(),
        },
    ];
    let penalties = PenaltyList::new();

    let for_parent_a = chain::elect_leader(&candidates, "parent_a", &penalties, 10).unwrap();
    assert_eq!(
        chain::elect_leader(&candidates, "parent_a", &penalties, 10).unwrap(),
        for_parent_a
    );

    // different parents eventually rotate the winner
    let rotated = (0..32).any(|n| {
        chain::elect_leader(&candidates, &format!("parent_{n}"), &penalties, 10).unwrap()
            != for_parent_a
    });
    assert!(rotated, "lottery never rotated the leader");
}

#[test]
fn test_trust_deltas_saturate_at_bounds() {
    let mut trust = TrustBook::new(0, TRUST_MIN, TRUST_MAX);
    for _ in 0..20 {
        trust.adjust(ip(1), nado::peers::DELTA_ROLLBACK_DISAGREE);
    }
    assert_eq!(trust.get(ip(1)), TRUST_MIN);
}

#[test]
fn test_compute_penalties_marks_skipped_leader() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::with_defaults("127.0.0.1".parse().unwrap(), 9173, dir.path().into());
    let storage = Arc::new(Storage::open(&dir.path().join("db")).unwrap());
    let genesis = storage.init_genesis(&config).unwrap();

    // two producers with stored records
    let producers: BTreeSet<IpAddr> = [ip(1), ip(2)].into_iter().collect();
    let (addr_one, addr_two) = (Keypair::generate().address(), Keypair::generate().address());
    storage
        .save_peer(
            &PeerRecord {
                ip: ip(1),
                address: addr_one.clone(),
                trust: 0,
            },
            true,
        )
        .unwrap();
    storage
        .save_peer(
            &PeerRecord {
                ip: ip(2),
                address: addr_two.clone(),
                trust: 0,
            },
            true,
        )
        .unwrap();
    let producers_hash = chain::producer_set_hash(&producers);
    storage.save_producer_set(&producers_hash, &producers).unwrap();

    let candidates = chain::resolve_candidates(&storage, &producers).unwrap();
    let elected = chain::elect_leader(
        &candidates,
        &genesis.block_hash,
        &PenaltyList::new(),
        u64::MAX,
    )
    .unwrap();
    let outsider = candidates
        .iter()
        .find(|c| c.address != elected.address)
        .unwrap()
        .clone();

    // the elected leader was skipped; the outsider produced instead
    let block = chain::construct_block(
        1,
        genesis.block_timestamp + config.block_time,
        genesis.block_hash.clone(),
        outsider.ip,
        outsider.address.clone(),
        Vec::new(),
        producers_hash,
        0,
        0,
    );
    storage.save_block(&block).unwrap();
    storage.set_latest_hash(&block.block_hash).unwrap();

    let penalties = compute_penalties(&storage, &block, 30).unwrap();
    assert_eq!(penalties.get(&elected.address), Some(&1));
    assert_eq!(penalties.get(&outsider.address), None);
}

#[test]
fn test_block_gap_boundaries() {
    let genesis = chain::construct_block(
        0,
        1_000,
        "0".repeat(64),
        ip(1),
        "ndo_creator".into(),
        Vec::new(),
        "producers".into(),
        0,
        0,
    );
    let at = |ts| {
        chain::construct_block(
            1,
            ts,
            genesis.block_hash.clone(),
            ip(1),
            "ndo_creator".into(),
            Vec::new(),
            "producers".into(),
            0,
            0,
        )
    };

    assert!(!chain::valid_block_gap(&at(1_059), &genesis, 60));
    assert!(chain::valid_block_gap(&at(1_060), &genesis, 60));
    assert!(chain::valid_block_gap(&at(2_000), &genesis, 60));
}
