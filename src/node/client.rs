//! JSON-RPC client for a Bitcoin Core compatible node.
//!
//! Only the calls the explorer core needs are implemented: transaction submission and chain
//! status. Transport failures map to [`NodeError::Unavailable`]; RPC error objects map to
//! [`NodeError::Rejected`].

use super::types::*;
use super::NodeClient;
use crate::config::RpcConfig;

use bitcoin::consensus::encode::serialize;
use bitcoin::{Transaction, Txid};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde_json::json;
use std::str::FromStr;
use tracing::debug;

/// Node JSON-RPC client
#[derive(Clone)]
pub struct RpcNodeClient {
	/// The underlying HTTP client.
	http_client: Client,
	/// The node's RPC endpoint.
	url: String,
	/// Basic-auth credentials, if configured.
	auth: Option<(String, String)>,
}

impl RpcNodeClient {
	/// Create a new node client from its configuration.
	///
	/// # Errors
	/// Returns [`NodeError::Unavailable`] if the HTTP client cannot be built.
	pub fn new(config: &RpcConfig) -> Result<Self, NodeError> {
		let http_client = Client::builder()
			.timeout(config.timeout)
			.build()
			.map_err(|e| NodeError::Unavailable(format!("Failed to create HTTP client: {}", e)))?;

		let auth = match (&config.user, &config.password) {
			(Some(user), Some(password)) => Some((user.clone(), password.clone())),
			_ => None,
		};

		Ok(Self {
			http_client,
			url: config.url.clone(),
			auth,
		})
	}

	/// Execute a JSON-RPC call.
	///
	/// # Arguments
	/// * `method` - The RPC method name.
	/// * `params` - Positional parameters.
	async fn call<T: DeserializeOwned>(
		&self,
		method: &str,
		params: serde_json::Value,
	) -> Result<T, NodeError> {
		let body = json!({
			"jsonrpc": "1.0",
			"id": "utxo-sync",
			"method": method,
			"params": params,
		});

		let mut request = self.http_client.post(&self.url).json(&body);
		if let Some((user, password)) = &self.auth {
			request = request.basic_auth(user, Some(password));
		}

		let response = request
			.send()
			.await
			.map_err(|e| NodeError::Unavailable(e.to_string()))?;

		// Bitcoin Core answers RPC errors with HTTP 500 and a regular envelope, so the body is
		// parsed regardless of status.
		let status = response.status();
		debug!("RPC {} answered with HTTP {}", method, status);
		let envelope: RpcResponse<T> = response.json().await.map_err(|e| {
			NodeError::InvalidResponse(format!("HTTP {} with unreadable body: {}", status, e))
		})?;

		envelope.into_result()
	}
}

#[async_trait::async_trait]
impl NodeClient for RpcNodeClient {
	async fn send_raw_transaction(&self, transaction: &Transaction) -> Result<Txid, NodeError> {
		let txid: String = self
			.call("sendrawtransaction", json!([hex::encode(serialize(transaction))]))
			.await?;
		Txid::from_str(&txid)
			.map_err(|e| NodeError::InvalidResponse(format!("Invalid txid {}: {}", txid, e)))
	}

	async fn blockchain_info(&self) -> Result<BlockchainInfo, NodeError> {
		self.call("getblockchaininfo", json!([])).await
	}
}
