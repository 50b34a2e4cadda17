//! Push notifications for a connected client.
//!
//! A [`NotificationSession`] is what a streaming endpoint (a WebSocket, for instance) holds for one
//! client: it listens on the event bus, keeps only the events the client asked for, and queues
//! them as [`Notification`]s. Blocks and confirmation details are checked against the best chain
//! at delivery time.

use crate::chain::ChainIndex;
use crate::repository::TransactionRecord;
use crate::wallet::DerivationStrategy;
use crate::wallet::sync::events::{
    EventBus, ExplorerEvent, MatchedInput, MatchedOutput, NewBlockEvent, NewTransactionMatchEvent,
    SubscriptionHandle,
};
use crate::wallet::sync::transactions::TransactionResult;

use bitcoin::{BlockHash, Network};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum Notification {
    NewBlock(BlockNotification),
    NewTransaction(TransactionNotification),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockNotification {
    pub network: Network,
    pub hash: BlockHash,
    pub height: u32,
    pub previous_block_hash: Option<BlockHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionNotification {
    pub network: Network,
    pub strategy: DerivationStrategy,
    /// Only set while the block is on the best chain
    pub block_id: Option<BlockHash>,
    pub transaction: TransactionResult,
    pub inputs: Vec<MatchedInput>,
    pub outputs: Vec<MatchedOutput>,
}

#[derive(Default)]
struct Listening {
    blocks: HashSet<Network>,
    strategies: HashSet<(Network, DerivationStrategy)>,
    all_strategies: HashSet<Network>,
}

impl Listening {
    fn wants(&self, event: &ExplorerEvent) -> bool {
        match event {
            ExplorerEvent::NewBlock(block) => self.blocks.contains(&block.network),
            ExplorerEvent::NewTransactionMatch(matched) => {
                self.all_strategies.contains(&matched.network)
                    || self
                        .strategies
                        .contains(&(matched.network, matched.strategy.clone()))
            }
            ExplorerEvent::EvictedTransaction(_) => false,
        }
    }
}

/// One client's notification stream.
///
/// Dropping the session removes its bus subscription.
pub struct NotificationSession {
    listening: Arc<RwLock<Listening>>,
    receiver: mpsc::UnboundedReceiver<Notification>,
    _subscription: SubscriptionHandle,
}

impl NotificationSession {
    pub fn new(events: &EventBus, chain: Arc<dyn ChainIndex>) -> Self {
        let listening = Arc::new(RwLock::new(Listening::default()));
        let (sender, receiver) = mpsc::unbounded_channel();

        let filter = listening.clone();
        let subscription = events.subscribe(
            move |event| filter.read().wants(event),
            move |event| {
                let notification = match event {
                    ExplorerEvent::NewBlock(block) => block_notification(chain.as_ref(), block),
                    ExplorerEvent::NewTransactionMatch(matched) => {
                        Some(transaction_notification(chain.as_ref(), matched))
                    }
                    ExplorerEvent::EvictedTransaction(_) => None,
                };
                if let Some(notification) = notification {
                    if sender.send(notification).is_err() {
                        debug!("Notification session closed, dropping event");
                    }
                }
            },
        );

        Self {
            listening,
            receiver,
            _subscription: subscription,
        }
    }

    pub fn listen_new_blocks(&self, network: Network) {
        self.listening.write().blocks.insert(network);
    }

    pub fn listen_strategy(&self, network: Network, strategy: DerivationStrategy) {
        self.listening.write().strategies.insert((network, strategy));
    }

    pub fn listen_all_strategies(&self, network: Network) {
        self.listening.write().all_strategies.insert(network);
    }

    /// Wait for the next notification.
    pub async fn next(&mut self) -> Option<Notification> {
        self.receiver.recv().await
    }

    /// The next queued notification, if any.
    pub fn try_next(&mut self) -> Option<Notification> {
        self.receiver.try_recv().ok()
    }
}

fn block_notification(chain: &dyn ChainIndex, block: &NewBlockEvent) -> Option<Notification> {
    // Skip blocks already reorganized away
    chain.get_block(&block.hash)?;
    Some(Notification::NewBlock(BlockNotification {
        network: block.network,
        hash: block.hash,
        height: block.height,
        previous_block_hash: block.previous_hash,
    }))
}

fn transaction_notification(chain: &dyn ChainIndex, matched: &NewTransactionMatchEvent) -> Notification {
    let block_id = matched
        .block_id
        .filter(|hash| chain.get_block(hash).is_some());
    let transaction = TransactionResult::from_records(chain, std::slice::from_ref(&matched.transaction))
        .unwrap_or_else(|| unconfirmed_result(&matched.transaction));
    Notification::NewTransaction(TransactionNotification {
        network: matched.network,
        strategy: matched.strategy.clone(),
        block_id,
        transaction,
        inputs: matched.inputs.clone(),
        outputs: matched.outputs.clone(),
    })
}

fn unconfirmed_result(record: &TransactionRecord) -> TransactionResult {
    TransactionResult {
        transaction: record.transaction.clone(),
        confirmations: 0,
        height: None,
        timestamp: record.inserted,
    }
}
