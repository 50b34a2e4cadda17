//! Transaction classification against the best chain.
//!
//! A strategy's saved records are re-read and re-annotated on every request: a record is confirmed
//! only while its block is on the best chain, so a reorg silently turns it back into an unconfirmed
//! transaction. Unconfirmed transactions double-spending a confirmed one are evicted.

use crate::chain::ChainIndex;
use crate::repository::{Repository, TransactionRecord};
use crate::wallet::sync::events::{EventBus, EvictedTransactionEvent, ExplorerEvent};
use crate::wallet::{DerivationStrategy, ExplorerError};

use bitcoin::{OutPoint, Transaction, Txid};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};

/// A saved record with its height on the current best chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnotatedTransaction {
	pub txid: Txid,
	pub record: TransactionRecord,
	/// `None` when unconfirmed or when the recorded block left the best chain
	pub height: Option<u32>,
}

impl AnnotatedTransaction {
	fn new(record: TransactionRecord, chain: &dyn ChainIndex) -> Self {
		let height = record
			.block_hash
			.and_then(|hash| chain.get_block(&hash))
			.map(|block| block.height);
		Self {
			txid: record.txid(),
			record,
			height,
		}
	}

	pub fn transaction(&self) -> &Transaction {
		&self.record.transaction
	}

	pub fn is_confirmed(&self) -> bool {
		self.height.is_some()
	}

	/// Outpoints spent by this transaction. Coinbase inputs spend nothing.
	pub fn spent_outpoints(&self) -> impl Iterator<Item = OutPoint> + '_ {
		self.record
			.transaction
			.input
			.iter()
			.map(|input| input.previous_output)
			.filter(|outpoint| !outpoint.is_null())
	}
}

/// Request-scoped partition of a strategy's transactions.
///
/// Each txid appears in exactly one of the three views, represented by its best record: the
/// confirmed record at the lowest height, or else the first inserted one. Views are in replay order.
#[derive(Debug, Clone, Default)]
pub struct AnnotatedTransactionCollection {
	confirmed: Vec<AnnotatedTransaction>,
	unconfirmed: Vec<AnnotatedTransaction>,
	conflicted: Vec<AnnotatedTransaction>,
	by_txid: HashMap<Txid, Vec<AnnotatedTransaction>>,
}

impl AnnotatedTransactionCollection {
	pub fn new(records: Vec<TransactionRecord>, chain: &dyn ChainIndex) -> Self {
		let mut by_txid: HashMap<Txid, Vec<AnnotatedTransaction>> = HashMap::new();
		let mut first_seen_order = Vec::new();
		for record in records {
			let annotated = AnnotatedTransaction::new(record, chain);
			let duplicates = by_txid.entry(annotated.txid).or_default();
			if duplicates.is_empty() {
				first_seen_order.push(annotated.txid);
			}
			duplicates.push(annotated);
		}

		let representatives = first_seen_order
			.iter()
			.filter_map(|txid| by_txid.get(txid).and_then(|duplicates| representative(duplicates)))
			.cloned();
		let (confirmed, pending): (Vec<_>, Vec<_>) =
			representatives.partition(AnnotatedTransaction::is_confirmed);

		let spent_by_confirmed: HashSet<OutPoint> =
			confirmed.iter().flat_map(|tx| tx.spent_outpoints()).collect();
		let (conflicted, unconfirmed): (Vec<_>, Vec<_>) = pending
			.into_iter()
			.partition(|tx| tx.spent_outpoints().any(|outpoint| spent_by_confirmed.contains(&outpoint)));

		Self {
			confirmed: replay_order(confirmed),
			unconfirmed: replay_order(unconfirmed),
			conflicted,
			by_txid,
		}
	}

	pub fn confirmed(&self) -> &[AnnotatedTransaction] {
		&self.confirmed
	}

	pub fn unconfirmed(&self) -> &[AnnotatedTransaction] {
		&self.unconfirmed
	}

	pub fn conflicted(&self) -> &[AnnotatedTransaction] {
		&self.conflicted
	}

	/// Every saved record of `txid`, including duplicates.
	pub fn get_by_txid(&self, txid: &Txid) -> &[AnnotatedTransaction] {
		self.by_txid.get(txid).map(Vec::as_slice).unwrap_or_default()
	}

	/// Lowest best-chain height among the records of `txid`.
	pub fn height_of(&self, txid: &Txid) -> Option<u32> {
		self.get_by_txid(txid).iter().filter_map(|tx| tx.height).min()
	}

	/// Insertion time of the oldest record of `txid`.
	pub fn first_seen(&self, txid: &Txid) -> Option<DateTime<Utc>> {
		self.get_by_txid(txid).iter().map(|tx| tx.record.inserted).min()
	}

	/// All saved records of the conflicted transactions.
	pub fn conflicted_records(&self) -> Vec<TransactionRecord> {
		self.conflicted
			.iter()
			.flat_map(|tx| self.get_by_txid(&tx.txid))
			.map(|tx| tx.record.clone())
			.collect()
	}
}

fn representative(duplicates: &[AnnotatedTransaction]) -> Option<&AnnotatedTransaction> {
	duplicates
		.iter()
		.filter(|tx| tx.is_confirmed())
		.min_by_key(|tx| (tx.height, tx.record.inserted))
		.or_else(|| duplicates.iter().min_by_key(|tx| tx.record.inserted))
}

/// Insertion order, then parents before children.
fn replay_order(mut transactions: Vec<AnnotatedTransaction>) -> Vec<AnnotatedTransaction> {
	transactions.sort_by_key(|tx| tx.record.inserted);
	topological_sort(transactions)
}

/// Kahn's algorithm over in-set spends. Among ready transactions the earliest one goes first, so
/// an already consistent order is left untouched.
pub fn topological_sort(transactions: Vec<AnnotatedTransaction>) -> Vec<AnnotatedTransaction> {
	let positions: HashMap<Txid, usize> = transactions
		.iter()
		.enumerate()
		.map(|(index, tx)| (tx.txid, index))
		.collect();

	let mut children: Vec<Vec<usize>> = vec![Vec::new(); transactions.len()];
	let mut in_degree = vec![0usize; transactions.len()];
	for (index, tx) in transactions.iter().enumerate() {
		let parents = tx
			.spent_outpoints()
			.filter_map(|outpoint| positions.get(&outpoint.txid).copied())
			.filter(|parent| *parent != index)
			.unique();
		for parent in parents {
			children[parent].push(index);
			in_degree[index] += 1;
		}
	}

	let mut ready: BinaryHeap<Reverse<usize>> = in_degree
		.iter()
		.enumerate()
		.filter(|(_, degree)| **degree == 0)
		.map(|(index, _)| Reverse(index))
		.collect();
	let mut order = Vec::with_capacity(transactions.len());
	while let Some(Reverse(index)) = ready.pop() {
		order.push(index);
		for &child in &children[index] {
			in_degree[child] -= 1;
			if in_degree[child] == 0 {
				ready.push(Reverse(child));
			}
		}
	}

	// A cycle cannot come from valid transactions; keep whatever is left in its original order
	if order.len() != transactions.len() {
		debug!("Cyclic spends among {} transactions", transactions.len() - order.len());
		let placed: HashSet<usize> = order.iter().copied().collect();
		order.extend((0..transactions.len()).filter(|index| !placed.contains(index)));
	}

	let mut slots: Vec<Option<AnnotatedTransaction>> = transactions.into_iter().map(Some).collect();
	order.into_iter().filter_map(|index| slots[index].take()).collect()
}

/// Builds [`AnnotatedTransactionCollection`]s and applies conflict side effects.
#[derive(Clone)]
pub struct TransactionClassifier {
	repository: Arc<dyn Repository>,
	chain: Arc<dyn ChainIndex>,
	events: EventBus,
}

impl TransactionClassifier {
	pub fn new(repository: Arc<dyn Repository>, chain: Arc<dyn ChainIndex>, events: EventBus) -> Self {
		Self {
			repository,
			chain,
			events,
		}
	}

	/// Classify the saved transactions of `strategy`.
	///
	/// Conflicted transactions are published as evicted and deleted from the repository before
	/// the collection is returned.
	pub async fn annotate(
		&self,
		strategy: &DerivationStrategy,
	) -> Result<AnnotatedTransactionCollection, ExplorerError> {
		let records = self.repository.get_transactions(strategy).await?;
		let collection = AnnotatedTransactionCollection::new(records, self.chain.as_ref());
		debug!(
			"Classified transactions of {}: {} confirmed, {} unconfirmed, {} conflicted",
			strategy,
			collection.confirmed().len(),
			collection.unconfirmed().len(),
			collection.conflicted().len()
		);

		if !collection.conflicted().is_empty() {
			for tx in collection.conflicted() {
				info!("Evicting conflicted transaction {} of {}", tx.txid, strategy);
				self.events
					.publish(ExplorerEvent::EvictedTransaction(EvictedTransactionEvent { txid: tx.txid }));
			}
			self.repository
				.clean_transactions(strategy, &collection.conflicted_records())
				.await?;
		}

		Ok(collection)
	}
}

/// A transaction with its position on the best chain
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResult {
	pub transaction: Transaction,
	pub confirmations: u32,
	pub height: Option<u32>,
	pub timestamp: DateTime<Utc>,
}

impl TransactionResult {
	/// Merge the saved records of one transaction. `None` if there are none.
	pub fn from_records(chain: &dyn ChainIndex, records: &[TransactionRecord]) -> Option<Self> {
		let first = records.first()?;
		let timestamp = records
			.iter()
			.map(|record| record.inserted)
			.filter(|inserted| inserted.timestamp() != 0)
			.min()
			.unwrap_or(first.inserted);
		let height = records
			.iter()
			.filter_map(|record| record.block_hash)
			.find_map(|hash| chain.get_block(&hash))
			.map(|block| block.height);
		let confirmations = height
			.map(|height| chain.height().saturating_sub(height) + 1)
			.unwrap_or(0);

		Some(Self {
			transaction: first.transaction.clone(),
			confirmations,
			height,
			timestamp,
		})
	}
}
