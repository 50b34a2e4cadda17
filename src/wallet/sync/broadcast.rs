use crate::config::BroadcastConfig;
use crate::node::{NodeClient, NodeError, RpcError};
use crate::wallet::sync::transactions::TransactionClassifier;
use crate::wallet::{DerivationStrategy, ExplorerError};

use bitcoin::Transaction;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Outcome of a broadcast
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastResult {
	pub success: bool,
	pub rpc_code: Option<i32>,
	pub rpc_code_message: Option<String>,
	pub rpc_message: Option<String>,
}

impl BroadcastResult {
	pub fn succeeded() -> Self {
		Self {
			success: true,
			..Self::default()
		}
	}

	pub fn failed(error: &RpcError) -> Self {
		Self {
			success: false,
			rpc_code: Some(error.code),
			rpc_code_message: Some(error.code_name().to_string()),
			rpc_message: Some(error.message.clone()),
		}
	}
}

/// Recognizes node rejections caused by inputs the node does not know about.
///
/// Node versions word this differently, so the fragments are configurable. Matching is a
/// case-insensitive substring test on the error message.
#[derive(Debug, Clone)]
pub struct MissingInputsMatcher {
	patterns: Vec<String>,
}

impl MissingInputsMatcher {
	pub fn new<I, S>(patterns: I) -> Self
	where
		I: IntoIterator<Item = S>,
		S: AsRef<str>,
	{
		Self {
			patterns: patterns
				.into_iter()
				.map(|pattern| pattern.as_ref().to_lowercase())
				.filter(|pattern| !pattern.is_empty())
				.collect(),
		}
	}

	pub fn from_config(config: &BroadcastConfig) -> Self {
		Self::new(&config.missing_inputs_patterns)
	}

	pub fn matches(&self, error: &RpcError) -> bool {
		let message = error.message.to_lowercase();
		self.patterns.iter().any(|pattern| message.contains(pattern.as_str()))
	}
}

impl Default for MissingInputsMatcher {
	fn default() -> Self {
		Self::from_config(&BroadcastConfig::default())
	}
}

/// Submits transactions and recovers from ancestors the node has forgotten.
#[derive(Clone)]
pub struct BroadcastOrchestrator {
	node: Arc<dyn NodeClient>,
	classifier: TransactionClassifier,
	missing_inputs: MissingInputsMatcher,
}

impl BroadcastOrchestrator {
	pub fn new(
		node: Arc<dyn NodeClient>,
		classifier: TransactionClassifier,
		missing_inputs: MissingInputsMatcher,
	) -> Self {
		Self {
			node,
			classifier,
			missing_inputs,
		}
	}

	/// Submit `transaction` to the node.
	///
	/// If the node reports missing inputs and `strategy` is given, every unconfirmed transaction of
	/// the strategy is resubmitted (parents first, failures ignored) and `transaction` is retried
	/// once. A failed retry reports the first rejection.
	///
	/// # Errors
	/// [`ExplorerError::Unavailable`] if the node cannot be reached for the first submission.
	pub async fn broadcast(
		&self,
		transaction: &Transaction,
		strategy: Option<&DerivationStrategy>,
	) -> Result<BroadcastResult, ExplorerError> {
		let txid = transaction.compute_txid();
		let original = match self.node.send_raw_transaction(transaction).await {
			Ok(_) => {
				info!("Broadcasted {}", txid);
				return Ok(BroadcastResult::succeeded());
			}
			Err(NodeError::Rejected(error)) => error,
			Err(e) => return Err(e.into()),
		};
		info!(
			"Broadcast of {} rejected: {} ({}) {}",
			txid,
			original.code,
			original.code_name(),
			original.message
		);

		let Some(strategy) = strategy.filter(|_| self.missing_inputs.matches(&original)) else {
			return Ok(BroadcastResult::failed(&original));
		};

		info!("Missing inputs for {}, resubmitting unconfirmed transactions of {}", txid, strategy);
		let transactions = self.classifier.annotate(strategy).await?;
		for tx in transactions.unconfirmed().iter().filter(|tx| tx.txid != txid) {
			match self.node.send_raw_transaction(tx.transaction()).await {
				Ok(_) => debug!("Resubmitted {}", tx.txid),
				Err(e) => debug!("Resubmission of {} failed: {}", tx.txid, e),
			}
		}

		match self.node.send_raw_transaction(transaction).await {
			Ok(_) => {
				info!("Broadcasted {} after resubmitting its ancestors", txid);
				Ok(BroadcastResult::succeeded())
			}
			Err(e) => {
				debug!("Retry of {} failed: {}", txid, e);
				Ok(BroadcastResult::failed(&original))
			}
		}
	}
}
