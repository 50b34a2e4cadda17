//! Repository boundary.
//!
//! The repository persists the transactions seen for each tracked strategy and the index mapping
//! scripts back to the strategies (and key paths) that derive them. The core only consumes it
//! through the [`Repository`] trait; [`InMemoryRepository`] is the bundled implementation used by
//! the binary and the tests.

mod memory;

pub use memory::InMemoryRepository;

use crate::wallet::{DerivationFeature, DerivationStrategy, KeyPathInformation};

use bitcoin::bip32::DerivationPath;
use bitcoin::{BlockHash, ScriptBuf, Transaction, Txid};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A transaction as saved for a strategy.
///
/// The same transaction may be saved several times (for example once when seen in the mempool and
/// again when seen in a block), so several records can share one txid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionRecord {
	pub transaction: Transaction,
	pub inserted: DateTime<Utc>,
	pub block_hash: Option<BlockHash>,
}

impl TransactionRecord {
	pub fn new(transaction: Transaction, inserted: DateTime<Utc>, block_hash: Option<BlockHash>) -> Self {
		Self {
			transaction,
			inserted,
			block_hash,
		}
	}

	pub fn txid(&self) -> Txid {
		self.transaction.compute_txid()
	}
}

/// Errors reported by a repository backend
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
	#[error("Storage error: {0}")]
	Storage(String),

	#[error("Derivation feature {0} is not supported by this strategy")]
	FeatureNotSupported(DerivationFeature),
}

/// Persisted transactions and key indices, per strategy.
#[async_trait::async_trait]
pub trait Repository: Send + Sync {
	/// All saved records for a strategy, in no particular order.
	async fn get_transactions(
		&self,
		strategy: &DerivationStrategy,
	) -> Result<Vec<TransactionRecord>, RepositoryError>;

	/// All saved records for a txid, across strategies.
	async fn get_saved_transactions(&self, txid: &Txid) -> Result<Vec<TransactionRecord>, RepositoryError>;

	/// For each script, every known owner. The result is parallel to `scripts`.
	async fn get_key_informations(
		&self,
		scripts: &[ScriptBuf],
	) -> Result<Vec<Vec<KeyPathInformation>>, RepositoryError>;

	async fn track(&self, strategy: &DerivationStrategy) -> Result<(), RepositoryError>;

	async fn cancel_reservation(
		&self,
		strategy: &DerivationStrategy,
		key_paths: &[DerivationPath],
	) -> Result<(), RepositoryError>;

	/// Delete the given records of a strategy.
	async fn clean_transactions(
		&self,
		strategy: &DerivationStrategy,
		records: &[TransactionRecord],
	) -> Result<(), RepositoryError>;

	/// The `skip`-th unused address of `feature`, optionally reserving it.
	///
	/// Returns `None` when the strategy is not tracked or the pool is exhausted.
	async fn get_unused(
		&self,
		strategy: &DerivationStrategy,
		feature: DerivationFeature,
		skip: usize,
		reserve: bool,
	) -> Result<Option<KeyPathInformation>, RepositoryError>;

	/// Block locator of the last block the indexer processed, if any.
	async fn get_index_progress(&self) -> Result<Option<Vec<BlockHash>>, RepositoryError>;

	async fn ping(&self) -> Result<(), RepositoryError>;
}
