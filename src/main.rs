use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use utxo_sync::chain::InMemoryChain;
use utxo_sync::node::RpcNodeClient;
use utxo_sync::repository::InMemoryRepository;
use utxo_sync::wallet::sync::{EventBus, SyncRequest};
use utxo_sync::{DerivationStrategy, ExplorerConfig, ExplorerService};

#[tokio::main(flavor = "current_thread")]
async fn main() {
	tracing_subscriber::fmt()
		.with_env_filter(
			tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
		)
		.with_target(false)
		.with_thread_ids(false)
		.with_thread_names(false)
		.with_file(false)
		.with_line_number(false)
		.with_timer(tracing_subscriber::fmt::time::time())
		.init();

	info!("Starting UTXO sync service");

	let config = match ExplorerConfig::from_env() {
		Ok(config) => config,
		Err(e) => {
			error!("Failed to load configuration: {}", e);
			return;
		}
	};
	info!("Network {}, node RPC at {}", config.network, config.rpc.url);

	let node = match RpcNodeClient::new(&config.rpc) {
		Ok(node) => Arc::new(node),
		Err(e) => {
			error!("Failed to create node client: {}", e);
			return;
		}
	};

	let genesis = bitcoin::blockdata::constants::genesis_block(config.network).block_hash();
	let chain = Arc::new(InMemoryChain::new(genesis));
	let repository = Arc::new(InMemoryRepository::new());
	let service = ExplorerService::new(&config, repository, chain, node, EventBus::new());

	info!("Created explorer service");

	match service.status().await {
		Ok(status) => {
			match &status.node {
				Some(node) => info!(
					"Node at {} blocks / {} headers (progress {:.4}, synched: {})",
					node.blocks, node.headers, node.verification_progress, node.is_synched
				),
				None => warn!("Node is not reachable"),
			}
			info!(
				"Chain height {}, sync height {:?}, fully synched: {}",
				status.chain_height, status.sync_height, status.is_fully_synched
			);
		}
		Err(e) => error!("Failed to get status: {}", e),
	}

	// One-shot sync of a strategy given on the command line or in UTXO_SYNC_STRATEGY
	let strategy = std::env::args()
		.nth(1)
		.or_else(|| std::env::var("UTXO_SYNC_STRATEGY").ok())
		.map(DerivationStrategy::new);

	if let Some(strategy) = strategy {
		if let Err(e) = service.track(&strategy).await {
			error!("Failed to track {}: {}", strategy, e);
			return;
		}

		let mut request = SyncRequest::new(strategy);
		request.no_wait = true;
		match service.sync(&request, &CancellationToken::new()).await {
			Ok(changes) => match serde_json::to_string_pretty(&changes) {
				Ok(json) => println!("{}", json),
				Err(e) => error!("Failed to serialize changes: {}", e),
			},
			Err(e) => error!("Failed to sync {}: {} ({})", request.strategy, e, e.code()),
		}
	}

	service.shutdown();
}
