//! Full node integration.
//!
//! The explorer relies on the node for consensus validity: it submits transactions to it and asks
//! it for its sync status, nothing more.

/// JSON-RPC client for the node
mod client;
/// Error and response types for node calls
mod types;

pub use client::RpcNodeClient;
pub use types::{BlockchainInfo, NodeError, RpcError};

use bitcoin::{Transaction, Txid};

/// Operations the explorer needs from a full node.
#[async_trait::async_trait]
pub trait NodeClient: Send + Sync {
	/// Submit a transaction to the node's mempool.
	async fn send_raw_transaction(&self, transaction: &Transaction) -> Result<Txid, NodeError>;

	async fn blockchain_info(&self) -> Result<BlockchainInfo, NodeError>;
}
