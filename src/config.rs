//! Explorer configuration.
//!
//! Every section has defaults matching a local mainnet node; [`ExplorerConfig::from_env`] layers
//! `UTXO_SYNC_*` environment variables on top. The structs also deserialize (durations as whole
//! seconds) so a host can embed them in its own configuration file.

use crate::wallet::ExplorerError;

use bitcoin::Network;
use serde::{Deserialize, Deserializer};
use std::str::FromStr;
use std::time::Duration;

fn duration_secs<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
	u64::deserialize(deserializer).map(Duration::from_secs)
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ExplorerConfig {
	pub network: Network,
	pub rpc: RpcConfig,
	pub sync: SyncConfig,
	pub broadcast: BroadcastConfig,
}

impl Default for ExplorerConfig {
	fn default() -> Self {
		Self {
			network: Network::Bitcoin,
			rpc: RpcConfig::default(),
			sync: SyncConfig::default(),
			broadcast: BroadcastConfig::default(),
		}
	}
}

/// Node RPC endpoint
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RpcConfig {
	pub url: String,
	pub user: Option<String>,
	pub password: Option<String>,
	#[serde(rename = "timeoutSecs", deserialize_with = "duration_secs")]
	pub timeout: Duration,
}

impl Default for RpcConfig {
	fn default() -> Self {
		Self {
			url: "http://127.0.0.1:8332".to_string(),
			user: None,
			password: None,
			timeout: Duration::from_secs(30),
		}
	}
}

/// Configuration for the long-poll sync
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SyncConfig {
	/// How long one sync request waits for a matching transaction before answering
	#[serde(rename = "longPollTimeoutSecs", deserialize_with = "duration_secs")]
	pub long_poll_timeout: Duration,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			long_poll_timeout: Duration::from_secs(10),
		}
	}
}

/// Configuration for broadcast recovery
#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BroadcastConfig {
	/// Case-insensitive fragments of node error messages that mean "missing inputs"
	pub missing_inputs_patterns: Vec<String>,
}

impl Default for BroadcastConfig {
	fn default() -> Self {
		Self {
			missing_inputs_patterns: vec![
				"missing inputs".to_string(),
				"missing-inputs".to_string(),
				"bad-txns-inputs-missingorspent".to_string(),
			],
		}
	}
}

impl ExplorerConfig {
	/// Defaults overridden by `UTXO_SYNC_*` environment variables.
	pub fn from_env() -> Result<Self, ExplorerError> {
		Self::from_lookup(|key| std::env::var(key).ok())
	}

	fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ExplorerError> {
		let mut config = Self::default();

		if let Some(network) = lookup("UTXO_SYNC_NETWORK") {
			config.network = Network::from_str(&network).map_err(|e| {
				ExplorerError::InvalidConfig(format!("UTXO_SYNC_NETWORK={}: {}", network, e))
			})?;
		}
		if let Some(url) = lookup("UTXO_SYNC_RPC_URL") {
			config.rpc.url = url;
		}
		if let Some(user) = lookup("UTXO_SYNC_RPC_USER") {
			config.rpc.user = Some(user);
		}
		if let Some(password) = lookup("UTXO_SYNC_RPC_PASSWORD") {
			config.rpc.password = Some(password);
		}
		if let Some(secs) = lookup("UTXO_SYNC_LONG_POLL_SECS") {
			let secs = secs.parse::<u64>().map_err(|e| {
				ExplorerError::InvalidConfig(format!("UTXO_SYNC_LONG_POLL_SECS={}: {}", secs, e))
			})?;
			config.sync.long_poll_timeout = Duration::from_secs(secs);
		}

		Ok(config)
	}
}
