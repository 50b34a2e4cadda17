use crate::chain::ChainIndex;
use crate::config::ExplorerConfig;
use crate::node::NodeClient;
use crate::repository::{Repository, RepositoryError};
use crate::wallet::sync::{
	BroadcastOrchestrator, BroadcastResult, EventBus, MissingInputsMatcher, NotificationSession,
	SyncOrchestrator, SyncRequest, TransactionClassifier, TransactionResult, UtxoChanges,
};
use crate::wallet::{DerivationFeature, DerivationStrategy, ExplorerError, KeyPathInformation};

use bitcoin::bip32::DerivationPath;
use bitcoin::{Network, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Node part of [`StatusResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
	pub blocks: u64,
	pub headers: u64,
	pub verification_progress: f64,
	pub is_synched: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResult {
	pub network: Network,
	pub chain_height: u32,
	/// Fork point between the indexer's progress and the best chain
	pub sync_height: Option<u32>,
	/// Seconds taken by a repository round trip
	pub repository_ping_time: f64,
	/// `None` when the node could not be reached
	pub node: Option<NodeStatus>,
	pub is_fully_synched: bool,
}

/// Blocks the indexer may lag behind the node's headers and still count as synched
const SYNCHED_TOLERANCE: u64 = 3;

/// Entry point exposing every explorer operation.
///
/// Owns the wiring between the external collaborators (repository, chain index, node) and the
/// sync components. The event bus is shared with whatever publishes chain and mempool events.
pub struct ExplorerService {
	network: Network,
	repository: Arc<dyn Repository>,
	chain: Arc<dyn ChainIndex>,
	node: Arc<dyn NodeClient>,
	events: EventBus,
	sync: SyncOrchestrator,
	broadcaster: BroadcastOrchestrator,
}

impl ExplorerService {
	pub fn new(
		config: &ExplorerConfig,
		repository: Arc<dyn Repository>,
		chain: Arc<dyn ChainIndex>,
		node: Arc<dyn NodeClient>,
		events: EventBus,
	) -> Self {
		let sync = SyncOrchestrator::new(
			config.network,
			repository.clone(),
			chain.clone(),
			events.clone(),
			config.sync.clone(),
		);
		let classifier = TransactionClassifier::new(repository.clone(), chain.clone(), events.clone());
		let broadcaster = BroadcastOrchestrator::new(
			node.clone(),
			classifier,
			MissingInputsMatcher::from_config(&config.broadcast),
		);

		Self {
			network: config.network,
			repository,
			chain,
			node,
			events,
			sync,
			broadcaster,
		}
	}

	pub fn events(&self) -> &EventBus {
		&self.events
	}

	/// Long-poll sync of one strategy's UTXOs
	pub async fn sync(
		&self,
		request: &SyncRequest,
		cancel: &CancellationToken,
	) -> Result<UtxoChanges, ExplorerError> {
		self.sync.sync(request, cancel).await
	}

	pub async fn broadcast(
		&self,
		transaction: &Transaction,
		strategy: Option<&DerivationStrategy>,
	) -> Result<BroadcastResult, ExplorerError> {
		self.broadcaster.broadcast(transaction, strategy).await
	}

	pub async fn get_transaction(&self, txid: &Txid) -> Result<TransactionResult, ExplorerError> {
		let records = self.repository.get_saved_transactions(txid).await?;
		TransactionResult::from_records(self.chain.as_ref(), &records)
			.ok_or(ExplorerError::TransactionNotFound(*txid))
	}

	pub async fn track(&self, strategy: &DerivationStrategy) -> Result<(), ExplorerError> {
		info!("Tracking {}", strategy);
		self.repository.track(strategy).await?;
		Ok(())
	}

	/// The `skip`-th unused address of `feature`, reserved if `reserve` is set.
	pub async fn get_unused_address(
		&self,
		strategy: &DerivationStrategy,
		feature: DerivationFeature,
		skip: usize,
		reserve: bool,
	) -> Result<KeyPathInformation, ExplorerError> {
		match self.repository.get_unused(strategy, feature, skip, reserve).await {
			Ok(Some(info)) => Ok(info),
			Ok(None) => Err(ExplorerError::StrategyNotFound(strategy.clone())),
			Err(RepositoryError::FeatureNotSupported(feature)) => {
				Err(ExplorerError::DerivationNotSupported(feature.to_string()))
			}
			Err(e) => Err(e.into()),
		}
	}

	pub async fn cancel_reservation(
		&self,
		strategy: &DerivationStrategy,
		key_paths: &[DerivationPath],
	) -> Result<(), ExplorerError> {
		self.repository.cancel_reservation(strategy, key_paths).await?;
		Ok(())
	}

	/// Health of the node, the repository and the indexer.
	///
	/// An unreachable node is reported in the result, not as an error.
	pub async fn status(&self) -> Result<StatusResult, ExplorerError> {
		let ping = async {
			let started = Instant::now();
			self.repository.ping().await.map(|_| started.elapsed())
		};
		let (node_info, ping) = futures::future::join(self.node.blockchain_info(), ping).await;
		let repository_ping_time = ping?.as_secs_f64();

		let node = match node_info {
			Ok(info) => Some(NodeStatus {
				blocks: info.blocks,
				headers: info.headers,
				verification_progress: info.verification_progress,
				is_synched: !info.initial_block_download,
			}),
			Err(e) => {
				warn!("Node status unavailable: {}", e);
				None
			}
		};

		let sync_height = self
			.repository
			.get_index_progress()
			.await?
			.map(|locator| self.chain.find_fork(&locator).height);

		let is_fully_synched = match (&node, sync_height) {
			(Some(node), Some(sync_height)) => {
				node.is_synched && node.headers.saturating_sub(sync_height as u64) < SYNCHED_TOLERANCE
			}
			_ => false,
		};

		Ok(StatusResult {
			network: self.network,
			chain_height: self.chain.height(),
			sync_height,
			repository_ping_time,
			node,
			is_fully_synched,
		})
	}

	/// A new push-notification session on this service's event bus
	pub fn notification_session(&self) -> NotificationSession {
		NotificationSession::new(&self.events, self.chain.clone())
	}

	/// Dispose every event subscription. Pending long-polls answer immediately.
	pub fn shutdown(&self) {
		info!("Shutting down explorer service");
		self.events.shutdown();
	}
}
