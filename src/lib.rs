pub mod api;
pub mod bus;
pub mod chain;
pub mod client;
pub mod config;
pub mod crypto;
pub mod db;
pub mod loops;
pub mod node;
pub mod peers;
pub mod pool;
pub mod rollback;
pub mod transactions;
pub mod types;

pub use bus::EventBus;
pub use client::GossipClient;
pub use config::Config;
pub use crypto::Keypair;
pub use db::Storage;
pub use node::{Node, SubmitResult};
pub use pool::TxPool;
pub use types::*;
