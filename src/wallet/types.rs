use crate::node::{NodeError, RpcError};
use crate::repository::RepositoryError;

use bitcoin::bip32::DerivationPath;
use bitcoin::{ScriptBuf, Txid};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Opaque wallet identity.
///
/// The core never looks inside a strategy: two strategies name the same wallet iff their
/// canonical string forms are equal.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct DerivationStrategy(String);

impl DerivationStrategy {
	pub fn new(strategy: impl Into<String>) -> Self {
		Self(strategy.into().trim().to_string())
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for DerivationStrategy {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<String> for DerivationStrategy {
	fn from(strategy: String) -> Self {
		Self::new(strategy)
	}
}

impl From<DerivationStrategy> for String {
	fn from(strategy: DerivationStrategy) -> Self {
		strategy.0
	}
}

impl FromStr for DerivationStrategy {
	type Err = Infallible;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		Ok(Self::new(s))
	}
}

/// Which branch of a strategy an address is derived from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DerivationFeature {
	#[default]
	Deposit,
	Change,
	Direct,
}

impl fmt::Display for DerivationFeature {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			DerivationFeature::Deposit => "Deposit",
			DerivationFeature::Change => "Change",
			DerivationFeature::Direct => "Direct",
		};
		f.write_str(name)
	}
}

/// Ownership record for one script: which strategy derives it, and at which key path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyPathInformation {
	pub strategy: DerivationStrategy,
	pub feature: DerivationFeature,
	pub key_path: DerivationPath,
	pub script_pubkey: ScriptBuf,
}

/// Errors surfaced by the explorer core.
#[derive(Debug, thiserror::Error)]
pub enum ExplorerError {
	#[error("Strategy not found: {0} is not tracked, or too many unused addresses were skipped")]
	StrategyNotFound(DerivationStrategy),

	#[error("Transaction not found: {0}")]
	TransactionNotFound(Txid),

	#[error("The derivation feature {0} is not supported")]
	DerivationNotSupported(String),

	#[error("The RPC interface is currently not available: {0}")]
	Unavailable(String),

	#[error("Node rejected the request: {0}")]
	NodeRejected(RpcError),

	#[error("Repository error: {0}")]
	Repository(#[from] RepositoryError),

	#[error("Invalid configuration: {0}")]
	InvalidConfig(String),
}

impl ExplorerError {
	/// Stable machine-readable error code.
	pub fn code(&self) -> &'static str {
		match self {
			ExplorerError::StrategyNotFound(_) => "strategy-not-found",
			ExplorerError::TransactionNotFound(_) => "transaction-not-found",
			ExplorerError::DerivationNotSupported(_) => "derivation-not-supported",
			ExplorerError::Unavailable(_) => "rpc-unavailable",
			ExplorerError::NodeRejected(_) => "rpc-rejected",
			ExplorerError::Repository(_) => "repository-error",
			ExplorerError::InvalidConfig(_) => "invalid-config",
		}
	}

	/// HTTP-like status for hosts that expose the core over a request/response transport.
	pub fn status(&self) -> u16 {
		match self {
			ExplorerError::StrategyNotFound(_) | ExplorerError::TransactionNotFound(_) => 404,
			ExplorerError::DerivationNotSupported(_)
			| ExplorerError::Unavailable(_)
			| ExplorerError::NodeRejected(_) => 400,
			ExplorerError::Repository(_) | ExplorerError::InvalidConfig(_) => 500,
		}
	}
}

impl From<NodeError> for ExplorerError {
	fn from(error: NodeError) -> Self {
		match error {
			NodeError::Rejected(rpc) => ExplorerError::NodeRejected(rpc),
			NodeError::Unavailable(message) | NodeError::InvalidResponse(message) => {
				ExplorerError::Unavailable(message)
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn strategies_compare_by_canonical_string() {
		let a = DerivationStrategy::new(" xpub6CUGRUo-[legacy] ");
		let b: DerivationStrategy = "xpub6CUGRUo-[legacy]".parse().unwrap();
		assert_eq!(a, b);
		assert_ne!(a, DerivationStrategy::new("xpub6CUGRUo"));
	}

	#[test]
	fn deserialized_strategies_are_trimmed() {
		let parsed: DerivationStrategy = serde_json::from_str("\" xpub6CUGRUo \"").unwrap();
		assert_eq!(parsed, DerivationStrategy::new("xpub6CUGRUo"));
		assert_eq!(serde_json::to_string(&parsed).unwrap(), "\"xpub6CUGRUo\"");
	}

	#[test]
	fn errors_map_to_codes_and_statuses() {
		let not_found = ExplorerError::StrategyNotFound(DerivationStrategy::new("xpub"));
		assert_eq!(not_found.code(), "strategy-not-found");
		assert_eq!(not_found.status(), 404);

		let unavailable: ExplorerError = NodeError::Unavailable("connection refused".into()).into();
		assert_eq!(unavailable.code(), "rpc-unavailable");
		assert_eq!(unavailable.status(), 400);

		let rejected: ExplorerError = NodeError::Rejected(RpcError::new(-26, "dust")).into();
		assert!(matches!(rejected, ExplorerError::NodeRejected(ref e) if e.code == -26));
	}
}
