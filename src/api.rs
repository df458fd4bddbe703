//! HTTP request surface.
//!
//! Read endpoints expose in-memory structures without taking the pool
//! lock for longer than a snapshot; no intensive operation may be invoked
//! from here. Every endpoint accepts `compress=msgpack|none`. JSON
//! responses follow the gossip convention: objects are returned bare,
//! other values are wrapped as `{name: value}`.

use crate::chain;
use crate::client::GossipClient;
use crate::node::{protocol_acceptable, Node};
use crate::peers::save_new_peer;
use crate::types::{to_readable_amount, Transaction, MAX_BLOCK_WALK};
use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::info;

#[derive(Clone)]
pub struct ApiState {
    pub node: Arc<Node>,
    pub client: GossipClient,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/status_pool", get(status_pool))
        .route("/peers", get(peers))
        .route("/peer_buffer", get(peer_buffer))
        .route("/unreachable", get(unreachable))
        .route("/penalties", get(penalties))
        .route("/transaction_pool", get(transaction_pool))
        .route("/transaction_buffer", get(transaction_buffer))
        .route("/user_transaction_buffer", get(user_transaction_buffer))
        .route("/trust_pool", get(trust_pool))
        .route("/block_producers", get(block_producers))
        .route("/block_hash_pool", get(block_hash_pool))
        .route("/transaction_hash_pool", get(transaction_hash_pool))
        .route("/block_producers_hash_pool", get(block_producers_hash_pool))
        .route("/get_block", get(get_block))
        .route("/get_block_number", get(get_block_number))
        .route("/get_blocks_after", get(get_blocks_after))
        .route("/get_blocks_before", get(get_blocks_before))
        .route("/get_latest_block", get(get_latest_block))
        .route("/get_transaction", get(get_transaction))
        .route(
            "/get_transactions_of_account",
            get(get_transactions_of_account),
        )
        .route("/get_account", get(get_account))
        .route("/get_producer_set_from_hash", get(get_producer_set))
        .route("/get_supply", get(get_supply))
        .route("/get_recommended_fee", get(get_recommended_fee))
        .route("/submit_transaction", get(submit_transaction))
        .route("/announce_peer", get(announce_peer))
        .route("/force_sync", get(force_sync))
        .route("/terminate", get(terminate))
        .route("/whats_my_ip", get(whats_my_ip))
        .with_state(state)
}

// =============================================================================
// RESPONSE SHAPING
// =============================================================================

#[derive(Deserialize, Default)]
struct CommonQuery {
    #[serde(default)]
    compress: Option<String>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    number: Option<u64>,
    #[serde(default)]
    count: Option<u64>,
    #[serde(default)]
    txid: Option<String>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    min_block: Option<u64>,
    #[serde(default)]
    readable: Option<String>,
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    ip: Option<String>,
    #[serde(default)]
    key: Option<String>,
}

impl CommonQuery {
    fn msgpack(&self) -> bool {
        self.compress.as_deref() == Some("msgpack")
    }

    fn readable_flag(&self) -> bool {
        self.readable.as_deref() == Some("true")
    }
}

/// Wrap a value the way the gossip protocol expects: MessagePack bytes
/// when requested, bare JSON for objects, `{name: value}` otherwise.
fn respond(name: &str, value: Value, query: &CommonQuery) -> Response {
    respond_with_status(StatusCode::OK, name, value, query)
}

fn respond_with_status(
    status: StatusCode,
    name: &str,
    value: Value,
    query: &CommonQuery,
) -> Response {
    if query.msgpack() {
        match rmp_serde::to_vec(&value) {
            Ok(bytes) => (
                status,
                [(header::CONTENT_TYPE, "application/x-msgpack")],
                bytes,
            )
                .into_response(),
            Err(error) => error_response(format!("{error}")),
        }
    } else if value.is_object() {
        (status, Json(value)).into_response()
    } else {
        (status, Json(json!({ name: value }))).into_response()
    }
}

fn error_response(message: impl std::fmt::Display) -> Response {
    (StatusCode::FORBIDDEN, format!("Error: {message}")).into_response()
}

fn not_found(name: &str, query: &CommonQuery) -> Response {
    respond_with_status(StatusCode::NOT_FOUND, name, json!("Not found"), query)
}

// =============================================================================
// STATE SNAPSHOTS
// =============================================================================

async fn status(State(state): State<ApiState>, Query(query): Query<CommonQuery>) -> Response {
    let status = state.node.status().await;
    respond("status", json!(status), &query)
}

async fn status_pool(State(state): State<ApiState>, Query(query): Query<CommonQuery>) -> Response {
    let consensus = state.node.consensus.read().await;
    respond("status_pool", json!(consensus.status_pool), &query)
}

async fn peers(State(state): State<ApiState>, Query(query): Query<CommonQuery>) -> Response {
    let peer_state = state.node.peer_state.read().await;
    respond("peers", json!(peer_state.peers), &query)
}

async fn peer_buffer(State(state): State<ApiState>, Query(query): Query<CommonQuery>) -> Response {
    let peer_state = state.node.peer_state.read().await;
    respond("peer_buffer", json!(peer_state.peer_buffer), &query)
}

async fn unreachable(State(state): State<ApiState>, Query(query): Query<CommonQuery>) -> Response {
    let peer_state = state.node.peer_state.read().await;
    respond("unreachable", json!(peer_state.unreachable), &query)
}

async fn penalties(State(state): State<ApiState>, Query(query): Query<CommonQuery>) -> Response {
    let pools = state.node.pools.read().await;
    respond("penalties", json!({ "penalties": pools.penalties }), &query)
}

async fn transaction_pool(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let pools = state.node.pools.read().await;
    respond(
        "transaction_pool",
        json!(pools.transaction_pool.to_vec()),
        &query,
    )
}

async fn transaction_buffer(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let pools = state.node.pools.read().await;
    respond("transaction_buffer", json!(pools.tx_buffer.to_vec()), &query)
}

async fn user_transaction_buffer(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let pools = state.node.pools.read().await;
    respond(
        "user_transaction_buffer",
        json!(pools.user_tx_buffer.to_vec()),
        &query,
    )
}

async fn trust_pool(State(state): State<ApiState>, Query(query): Query<CommonQuery>) -> Response {
    let consensus = state.node.consensus.read().await;
    respond("trust_pool", json!(consensus.trust.snapshot()), &query)
}

async fn block_producers(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let pools = state.node.pools.read().await;
    respond("block_producers", json!(pools.block_producers), &query)
}

// =============================================================================
// OPINION POOLS
// =============================================================================

async fn block_hash_pool(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let consensus = state.node.consensus.read().await;
    respond(
        "block_hash_pool",
        json!({
            "block_opinions": consensus.block_hash_pool,
            "majority_block_opinion": consensus.majority_block_hash,
        }),
        &query,
    )
}

async fn transaction_hash_pool(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let consensus = state.node.consensus.read().await;
    respond(
        "transactions_hash_pool",
        json!({
            "transactions_hash_pool": consensus.transaction_hash_pool,
            "majority_transactions_hash_pool": consensus.majority_transaction_pool_hash,
        }),
        &query,
    )
}

async fn block_producers_hash_pool(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let consensus = state.node.consensus.read().await;
    respond(
        "block_producers_hash_pool",
        json!({
            "block_producers_hash_pool": consensus.block_producers_hash_pool,
            "majority_block_producers_hash_pool": consensus.majority_block_producers_hash,
        }),
        &query,
    )
}

// =============================================================================
// CHAIN LOOKUPS
// =============================================================================

async fn get_block(State(state): State<ApiState>, Query(query): Query<CommonQuery>) -> Response {
    let Some(hash) = query.hash.clone() else {
        return error_response("hash parameter missing");
    };
    match state.node.storage.get_block(&hash) {
        Ok(Some(block)) => respond("block", json!(block), &query),
        Ok(None) => not_found("block", &query),
        Err(error) => error_response(error),
    }
}

async fn get_block_number(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let Some(number) = query.number else {
        return error_response("number parameter missing");
    };
    match state.node.storage.get_block_by_number(number) {
        Ok(Some(block)) => respond("block_number", json!(block), &query),
        Ok(None) => error_response("Not found"),
        Err(error) => error_response(error),
    }
}

async fn get_latest_block(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let pools = state.node.pools.read().await;
    respond("latest_block", json!(pools.latest_block), &query)
}

/// Walk forward through `child_hash` pointers.
async fn get_blocks_after(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let Some(hash) = query.hash.clone() else {
        return error_response("hash parameter missing");
    };
    let count = query.count.unwrap_or(1).min(MAX_BLOCK_WALK);

    let base = match state.node.storage.get_block(&hash) {
        Ok(Some(block)) => block,
        Ok(None) => return not_found("blocks_after", &query),
        Err(error) => return error_response(error),
    };

    let mut collected = Vec::new();
    let mut cursor = base.child_hash;
    for _ in 0..count {
        let Some(next_hash) = cursor else { break };
        match state.node.storage.get_block(&next_hash) {
            Ok(Some(block)) => {
                cursor = block.child_hash.clone();
                collected.push(block);
            }
            _ => break,
        }
    }
    respond("blocks_after", json!({ "blocks_after": collected }), &query)
}

/// Walk backward through `parent_hash` pointers, oldest first.
async fn get_blocks_before(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let Some(hash) = query.hash.clone() else {
        return error_response("hash parameter missing");
    };
    let count = query.count.unwrap_or(1).min(MAX_BLOCK_WALK);

    let base = match state.node.storage.get_block(&hash) {
        Ok(Some(block)) => block,
        Ok(None) => return not_found("blocks_before", &query),
        Err(error) => return error_response(error),
    };

    let mut collected = Vec::new();
    let mut cursor = base.parent_hash;
    for _ in 0..count {
        match state.node.storage.get_block(&cursor) {
            Ok(Some(block)) => {
                cursor = block.parent_hash.clone();
                let genesis = block.block_number == 0;
                collected.push(block);
                if genesis {
                    break;
                }
            }
            _ => break,
        }
    }
    collected.reverse();
    respond(
        "blocks_before",
        json!({ "blocks_before": collected }),
        &query,
    )
}

// =============================================================================
// TRANSACTIONS AND ACCOUNTS
// =============================================================================

async fn get_transaction(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let Some(txid) = query.txid.clone() else {
        return error_response("txid parameter missing");
    };
    match state.node.storage.get_transaction(&txid) {
        Ok(Some(transaction)) => respond("txid", json!(transaction), &query),
        Ok(None) => error_response("Not found"),
        Err(error) => error_response(error),
    }
}

async fn get_transactions_of_account(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let address = query
        .address
        .clone()
        .unwrap_or_else(|| state.node.address.clone());
    let min_block = query.min_block.unwrap_or(0);

    match state.node.storage.transactions_of_account(&address, min_block) {
        Ok(tx_list) if tx_list.is_empty() => error_response("Not found"),
        Ok(tx_list) => respond(
            "account_transactions",
            json!({ "tx_list": tx_list }),
            &query,
        ),
        Err(error) => error_response(error),
    }
}

async fn get_account(State(state): State<ApiState>, Query(query): Query<CommonQuery>) -> Response {
    let address = query
        .address
        .clone()
        .unwrap_or_else(|| state.node.address.clone());

    let account = match state.node.storage.get_account(&address, false) {
        Ok(Some(account)) => account,
        Ok(None) => return error_response("Not found"),
        Err(error) => return error_response(error),
    };

    let penalty = {
        let pools = state.node.pools.read().await;
        chain::get_penalty(&pools.penalties, &address)
    };

    let mut output = json!(account);
    output["penalty"] = json!(penalty);
    if query.readable_flag() {
        output["balance"] = json!(to_readable_amount(account.balance));
        output["produced"] = json!(to_readable_amount(account.produced));
        output["burned"] = json!(to_readable_amount(account.burned));
    }
    respond("address", output, &query)
}

async fn get_producer_set(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let Some(hash) = query.hash.clone() else {
        return error_response("hash parameter missing");
    };
    match state.node.storage.get_producer_set(&hash) {
        Ok(Some(producers)) => respond("producer_set", json!(producers), &query),
        Ok(None) => error_response("Not found"),
        Err(error) => error_response(error),
    }
}

async fn get_supply(State(state): State<ApiState>, Query(query): Query<CommonQuery>) -> Response {
    let totals = match state.node.storage.fetch_totals() {
        Ok(totals) => totals,
        Err(error) => return error_response(error),
    };
    let reserve = state
        .node
        .storage
        .get_account(&state.node.config.genesis_address, false)
        .ok()
        .flatten()
        .map(|account| account.balance)
        .unwrap_or(0);

    let block_number = state.node.pools.read().await.latest_block.block_number;
    let genesis_balance = state.node.config.genesis_balance;
    let reserve_spent = genesis_balance.saturating_sub(reserve);
    let sunk = (totals.burned as i128 + totals.fees as i128) as u64;
    let circulating = (reserve_spent + totals.produced).saturating_sub(sunk);
    let total_supply = (genesis_balance + totals.produced).saturating_sub(sunk);

    let output = if query.readable_flag() {
        json!({
            "block_number": block_number,
            "produced": to_readable_amount(totals.produced),
            "fees": to_readable_amount(totals.fees),
            "burned": to_readable_amount(totals.burned),
            "reserve": to_readable_amount(reserve),
            "reserve_spent": to_readable_amount(reserve_spent),
            "circulating": to_readable_amount(circulating),
            "total_supply": to_readable_amount(total_supply),
        })
    } else {
        json!({
            "block_number": block_number,
            "produced": totals.produced,
            "fees": totals.fees,
            "burned": totals.burned,
            "reserve": reserve,
            "reserve_spent": reserve_spent,
            "circulating": circulating,
            "total_supply": total_supply,
        })
    };
    respond("supply", output, &query)
}

async fn get_recommended_fee(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let latest = state.node.pools.read().await.latest_block.clone();
    match chain::fee_over_blocks(&state.node.storage, &latest) {
        Ok(fee) => respond("fee", json!({ "fee": fee + 1 }), &query),
        Err(error) => error_response(error),
    }
}

async fn submit_transaction(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let Some(raw) = query.data.clone() else {
        return error_response("data parameter missing");
    };
    let transaction: Transaction = match serde_json::from_str(&raw) {
        Ok(transaction) => transaction,
        Err(error) => return error_response(error),
    };

    let outcome = state.node.merge_transaction(transaction, true).await;
    let status = if outcome.result {
        StatusCode::OK
    } else {
        StatusCode::FORBIDDEN
    };
    (status, Json(json!(outcome))).into_response()
}

// =============================================================================
// PEER MANAGEMENT AND ADMIN
// =============================================================================

async fn announce_peer(
    State(state): State<ApiState>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let Some(raw_ip) = query.ip.clone() else {
        return error_response("ip parameter missing");
    };
    let peer_ip: IpAddr = match raw_ip.parse() {
        Ok(ip) => ip,
        Err(_) => return (StatusCode::OK, "Invalid IP address").into_response(),
    };

    let (known, buffered) = {
        let peer_state = state.node.peer_state.read().await;
        (
            peer_state.peers.contains(&peer_ip) || peer_state.unreachable.contains_key(&peer_ip),
            peer_state.peer_buffer.contains(&peer_ip),
        )
    };
    if known {
        return (StatusCode::OK, format!("Peer {peer_ip} is known or invalid")).into_response();
    }

    let Some(status) = state.client.get_remote_status(peer_ip).await else {
        return error_response(format!("{peer_ip} unreachable"));
    };
    if status.address.is_empty() {
        return error_response("No address detected");
    }
    if !protocol_acceptable(status.protocol) {
        return error_response(format!("Protocol of {peer_ip} is too low"));
    }

    if let Err(error) = save_new_peer(
        &state.node.storage,
        peer_ip,
        status.address,
        state.node.config.trust_default,
        true,
    ) {
        return error_response(error);
    }

    let message = if buffered {
        format!("{peer_ip} already waiting in peer buffer")
    } else {
        let mut peer_state = state.node.peer_state.write().await;
        peer_state.peer_buffer.insert(peer_ip);
        format!("Peer {peer_ip} added to peer buffer")
    };
    (StatusCode::OK, message).into_response()
}

fn admin_allowed(state: &ApiState, client_ip: IpAddr, key: Option<&str>) -> bool {
    client_ip.is_loopback() || key == Some(state.node.config.server_key.as_str())
}

async fn force_sync(
    State(state): State<ApiState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<CommonQuery>,
) -> Response {
    let Some(raw_ip) = query.ip.clone() else {
        return error_response("ip parameter missing");
    };
    let forced_ip: IpAddr = match raw_ip.parse() {
        Ok(ip) => ip,
        Err(error) => return error_response(error),
    };

    if !admin_allowed(&state, remote.ip(), query.key.as_deref()) {
        return (
            StatusCode::OK,
            format!("Wrong server key {}", query.key.unwrap_or_default()),
        )
            .into_response();
    }

    let mut peer_state = state.node.peer_state.write().await;
    peer_state.force_sync_ip = Some(forced_ip);
    peer_state.peers = [forced_ip].into_iter().collect();
    info!("Forced synchronization from {forced_ip}");
    (
        StatusCode::OK,
        format!("Synchronization is now forced only from {forced_ip} until majority consensus is reached"),
    )
        .into_response()
}

async fn terminate(
    State(state): State<ApiState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<CommonQuery>,
) -> Response {
    if !admin_allowed(&state, remote.ip(), query.key.as_deref()) {
        return (StatusCode::OK, "Wrong or missing key for a remote node").into_response();
    }
    state.node.request_terminate();
    (
        StatusCode::OK,
        "Termination signal sent, node is shutting down...",
    )
        .into_response()
}

async fn whats_my_ip(
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Query(query): Query<CommonQuery>,
) -> Response {
    respond("ip", json!(remote.ip().to_string()), &query)
}
