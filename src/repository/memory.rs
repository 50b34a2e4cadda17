use super::{Repository, RepositoryError, TransactionRecord};
use crate::wallet::{DerivationFeature, DerivationStrategy, KeyPathInformation};

use bitcoin::bip32::DerivationPath;
use bitcoin::{BlockHash, ScriptBuf, Txid};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use tracing::debug;

#[derive(Default)]
struct TrackedWallet {
	/// Derived keys in derivation order
	keys: Vec<KeyPathInformation>,
	reserved: HashSet<DerivationPath>,
}

#[derive(Default)]
struct Inner {
	wallets: HashMap<DerivationStrategy, TrackedWallet>,
	transactions: HashMap<DerivationStrategy, Vec<TransactionRecord>>,
	owners: HashMap<ScriptBuf, Vec<KeyPathInformation>>,
	index_progress: Option<Vec<BlockHash>>,
}

/// Repository kept entirely in memory.
///
/// Keys are registered up front with [`InMemoryRepository::add_key`] (derivation itself is the
/// caller's concern) and transactions are saved by whatever watches the chain.
#[derive(Default)]
pub struct InMemoryRepository {
	inner: RwLock<Inner>,
}

impl InMemoryRepository {
	pub fn new() -> Self {
		Self::default()
	}

	/// Register a derived key. Tracks the owning strategy if it was not tracked yet.
	pub fn add_key(&self, info: KeyPathInformation) {
		let mut inner = self.inner.write();
		inner
			.owners
			.entry(info.script_pubkey.clone())
			.or_default()
			.push(info.clone());
		inner.wallets.entry(info.strategy.clone()).or_default().keys.push(info);
	}

	pub fn save_transaction(&self, strategy: &DerivationStrategy, record: TransactionRecord) {
		debug!("Saving transaction {} for {}", record.txid(), strategy);
		self.inner
			.write()
			.transactions
			.entry(strategy.clone())
			.or_default()
			.push(record);
	}

	pub fn set_index_progress(&self, locator: Vec<BlockHash>) {
		self.inner.write().index_progress = Some(locator);
	}

	fn is_used(inner: &Inner, strategy: &DerivationStrategy, script: &ScriptBuf) -> bool {
		inner
			.transactions
			.get(strategy)
			.map(|records| {
				records
					.iter()
					.any(|r| r.transaction.output.iter().any(|o| &o.script_pubkey == script))
			})
			.unwrap_or(false)
	}
}

#[async_trait::async_trait]
impl Repository for InMemoryRepository {
	async fn get_transactions(
		&self,
		strategy: &DerivationStrategy,
	) -> Result<Vec<TransactionRecord>, RepositoryError> {
		Ok(self
			.inner
			.read()
			.transactions
			.get(strategy)
			.cloned()
			.unwrap_or_default())
	}

	async fn get_saved_transactions(&self, txid: &Txid) -> Result<Vec<TransactionRecord>, RepositoryError> {
		let inner = self.inner.read();
		Ok(inner
			.transactions
			.values()
			.flatten()
			.filter(|r| &r.txid() == txid)
			.cloned()
			.collect())
	}

	async fn get_key_informations(
		&self,
		scripts: &[ScriptBuf],
	) -> Result<Vec<Vec<KeyPathInformation>>, RepositoryError> {
		let inner = self.inner.read();
		Ok(scripts
			.iter()
			.map(|script| inner.owners.get(script).cloned().unwrap_or_default())
			.collect())
	}

	async fn track(&self, strategy: &DerivationStrategy) -> Result<(), RepositoryError> {
		self.inner.write().wallets.entry(strategy.clone()).or_default();
		Ok(())
	}

	async fn cancel_reservation(
		&self,
		strategy: &DerivationStrategy,
		key_paths: &[DerivationPath],
	) -> Result<(), RepositoryError> {
		if let Some(wallet) = self.inner.write().wallets.get_mut(strategy) {
			for key_path in key_paths {
				wallet.reserved.remove(key_path);
			}
		}
		Ok(())
	}

	async fn clean_transactions(
		&self,
		strategy: &DerivationStrategy,
		records: &[TransactionRecord],
	) -> Result<(), RepositoryError> {
		if let Some(saved) = self.inner.write().transactions.get_mut(strategy) {
			saved.retain(|r| !records.contains(r));
		}
		Ok(())
	}

	async fn get_unused(
		&self,
		strategy: &DerivationStrategy,
		feature: DerivationFeature,
		skip: usize,
		reserve: bool,
	) -> Result<Option<KeyPathInformation>, RepositoryError> {
		let mut inner = self.inner.write();
		let Some(wallet) = inner.wallets.get(strategy) else {
			return Ok(None);
		};
		if !wallet.keys.is_empty() && !wallet.keys.iter().any(|k| k.feature == feature) {
			return Err(RepositoryError::FeatureNotSupported(feature));
		}

		let candidate = wallet
			.keys
			.iter()
			.filter(|k| k.feature == feature && !wallet.reserved.contains(&k.key_path))
			.filter(|k| !Self::is_used(&inner, strategy, &k.script_pubkey))
			.nth(skip)
			.cloned();

		if let (Some(info), true) = (&candidate, reserve) {
			if let Some(wallet) = inner.wallets.get_mut(strategy) {
				wallet.reserved.insert(info.key_path.clone());
			}
		}
		Ok(candidate)
	}

	async fn get_index_progress(&self) -> Result<Option<Vec<BlockHash>>, RepositoryError> {
		Ok(self.inner.read().index_progress.clone())
	}

	async fn ping(&self) -> Result<(), RepositoryError> {
		Ok(())
	}
}
