//! Long-poll wallet sync.
//!
//! This module defines the `SyncOrchestrator`, which answers a client's "what changed since this
//! state?" question for one strategy. It composes the transaction classifier, a request-scoped key
//! path resolver and the UTXO state builder, and uses the event bus to hold the request open while
//! nothing has changed.
//!
//! A request runs at most two computations:
//! - compute the confirmed and unconfirmed changes against the client's hashes
//! - if both are empty and the client agreed to wait, wait for a matching transaction (bounded by
//!   `SyncConfig::long_poll_timeout` and the caller's cancellation token), then compute once more
//!
//! The wait subscription is taken before the first computation, so a transaction announced while
//! the state is being computed still wakes the request.

use crate::chain::ChainIndex;
use crate::config::SyncConfig;
use crate::repository::Repository;
use crate::wallet::sync::events::{EventBus, ExplorerEvent};
use crate::wallet::sync::key_paths::KeyPathResolver;
use crate::wallet::sync::transactions::{AnnotatedTransactionCollection, TransactionClassifier};
use crate::wallet::sync::utxo_state::{StateHash, UtxoChange, UtxoStates, parse_state_hash};
use crate::wallet::{DerivationStrategy, ExplorerError};

use bitcoin::Network;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// A client's sync request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub strategy: DerivationStrategy,
    /// Hash of the last confirmed state the client received
    #[serde(default)]
    pub confirmed_hash: Option<String>,
    #[serde(default)]
    pub unconfirmed_hash: Option<String>,
    /// Answer immediately even if nothing changed
    #[serde(default)]
    pub no_wait: bool,
}

impl SyncRequest {
    pub fn new(strategy: DerivationStrategy) -> Self {
        Self {
            strategy,
            confirmed_hash: None,
            unconfirmed_hash: None,
            no_wait: false,
        }
    }

    /// The request to send after receiving `changes`.
    pub fn follow_up(&self, changes: &UtxoChanges) -> Self {
        Self {
            strategy: self.strategy.clone(),
            confirmed_hash: Some(changes.confirmed.hash.to_string()),
            unconfirmed_hash: Some(changes.unconfirmed.hash.to_string()),
            no_wait: self.no_wait,
        }
    }
}

/// Sync response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoChanges {
    pub strategy: DerivationStrategy,
    pub current_height: u32,
    pub confirmed: UtxoChange,
    pub unconfirmed: UtxoChange,
}

impl UtxoChanges {
    pub fn has_changes(&self) -> bool {
        !self.confirmed.is_empty() || !self.unconfirmed.is_empty()
    }
}

/// Long-poll sync coordinator.
///
/// Holds no per-request state; every call works from fresh repository and chain snapshots.
#[derive(Clone)]
pub struct SyncOrchestrator {
    network: Network,
    classifier: TransactionClassifier,
    repository: Arc<dyn Repository>,
    chain: Arc<dyn ChainIndex>,
    events: EventBus,
    config: SyncConfig,
}

impl SyncOrchestrator {
    pub fn new(
        network: Network,
        repository: Arc<dyn Repository>,
        chain: Arc<dyn ChainIndex>,
        events: EventBus,
        config: SyncConfig,
    ) -> Self {
        let classifier = TransactionClassifier::new(repository.clone(), chain.clone(), events.clone());
        Self {
            network,
            classifier,
            repository,
            chain,
            events,
            config,
        }
    }

    /// Changes since the client's states, waiting at most one long-poll cycle for some to appear.
    ///
    /// Cancelling `cancel` ends the wait early; the request still answers with a fresh computation.
    pub async fn sync(
        &self,
        request: &SyncRequest,
        cancel: &CancellationToken,
    ) -> Result<UtxoChanges, ExplorerError> {
        let strategy = &request.strategy;
        let known_confirmed = parse_state_hash(request.confirmed_hash.as_deref());
        let known_unconfirmed = parse_state_hash(request.unconfirmed_hash.as_deref());

        let waiter = (!request.no_wait).then(|| {
            let network = self.network;
            let watched = strategy.clone();
            self.events.subscribe_next(move |event| {
                matches!(event, ExplorerEvent::NewTransactionMatch(matched)
                    if matched.network == network && matched.strategy == watched)
            })
        });

        let mut resolver = KeyPathResolver::new(self.repository.clone(), strategy.clone());
        let changes = self
            .compute(strategy, &mut resolver, known_confirmed, known_unconfirmed)
            .await?;
        if changes.has_changes() {
            return Ok(changes);
        }
        let Some(waiter) = waiter else {
            return Ok(changes);
        };

        debug!("No change for {}, waiting up to {:?}", strategy, self.config.long_poll_timeout);
        match waiter.wait(self.config.long_poll_timeout, cancel).await {
            Some(_) => debug!("New transaction for {}, recomputing", strategy),
            None => debug!("Wait for {} ended without a match", strategy),
        }

        self.compute(strategy, &mut resolver, known_confirmed, known_unconfirmed)
            .await
    }

    async fn compute(
        &self,
        strategy: &DerivationStrategy,
        resolver: &mut KeyPathResolver,
        known_confirmed: Option<StateHash>,
        known_unconfirmed: Option<StateHash>,
    ) -> Result<UtxoChanges, ExplorerError> {
        let current_height = self.chain.height();
        let transactions = self.classifier.annotate(strategy).await?;

        let scripts = transactions
            .confirmed()
            .iter()
            .chain(transactions.unconfirmed())
            .flat_map(|tx| tx.transaction().output.iter())
            .map(|output| output.script_pubkey.as_script());
        resolver.resolve(scripts).await?;

        let states = UtxoStates::create(
            &*resolver,
            transactions.confirmed(),
            transactions.unconfirmed(),
            known_confirmed,
            known_unconfirmed,
        );

        let mut confirmed = states.confirmed_change();
        let mut unconfirmed = states.unconfirmed_change();
        fill_utxo_information(&mut confirmed, &transactions, resolver, current_height);
        fill_utxo_information(&mut unconfirmed, &transactions, resolver, current_height);

        if confirmed.reset || unconfirmed.reset {
            info!(
                "Sending full state of {} ({} confirmed, {} unconfirmed UTXOs)",
                strategy,
                confirmed.utxos.len(),
                unconfirmed.utxos.len()
            );
        }

        Ok(UtxoChanges {
            strategy: strategy.clone(),
            current_height,
            confirmed,
            unconfirmed,
        })
    }
}

fn fill_utxo_information(
    change: &mut UtxoChange,
    transactions: &AnnotatedTransactionCollection,
    resolver: &KeyPathResolver,
    current_height: u32,
) {
    for utxo in &mut change.utxos {
        let txid = utxo.outpoint.txid;
        utxo.key_path = resolver.lookup(&utxo.script_pubkey).cloned();
        utxo.confirmations = transactions
            .height_of(&txid)
            .map(|height| current_height.saturating_sub(height) + 1)
            .unwrap_or(0);
        if let Some(first_seen) = transactions.first_seen(&txid) {
            utxo.timestamp = first_seen;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::InMemoryChain;
    use crate::test_utils::{
        CountingRepository, block_hash, external_outpoint, key_info, record, script, time, tx,
    };
    use crate::wallet::DerivationFeature;
    use crate::wallet::sync::events::NewTransactionMatchEvent;
    use bitcoin::hashes::Hash;
    use bitcoin::{Amount, OutPoint};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;
    use tokio::time::Instant;

    const TIMEOUT: Duration = Duration::from_secs(10);

    struct Fixture {
        repository: Arc<CountingRepository>,
        chain: Arc<InMemoryChain>,
        events: EventBus,
        orchestrator: SyncOrchestrator,
        strategy: DerivationStrategy,
    }

    fn fixture() -> Fixture {
        let repository = Arc::new(CountingRepository::default());
        let strategy = DerivationStrategy::new("xpub-alice");
        for n in 1..=5u8 {
            repository
                .inner
                .add_key(key_info(&strategy, DerivationFeature::Deposit, n as u32, script(n)));
        }
        let chain = Arc::new(InMemoryChain::new(block_hash(0)));
        chain.push(block_hash(1)).unwrap();
        chain.push(block_hash(2)).unwrap();
        let events = EventBus::new();
        let orchestrator = SyncOrchestrator::new(
            Network::Regtest,
            repository.clone(),
            chain.clone(),
            events.clone(),
            SyncConfig {
                long_poll_timeout: TIMEOUT,
            },
        );
        Fixture {
            repository,
            chain,
            events,
            orchestrator,
            strategy,
        }
    }

    fn matched(strategy: &DerivationStrategy, transaction: bitcoin::Transaction) -> ExplorerEvent {
        ExplorerEvent::NewTransactionMatch(NewTransactionMatchEvent {
            network: Network::Regtest,
            strategy: strategy.clone(),
            transaction: record(transaction, 100, None),
            inputs: vec![],
            outputs: vec![],
            block_id: None,
        })
    }

    /// Sync once without waiting and return the follow-up request.
    async fn caught_up(f: &Fixture) -> SyncRequest {
        let mut request = SyncRequest::new(f.strategy.clone());
        request.no_wait = true;
        let changes = f
            .orchestrator
            .sync(&request, &CancellationToken::new())
            .await
            .unwrap();
        let mut follow_up = request.follow_up(&changes);
        follow_up.no_wait = false;
        follow_up
    }

    #[tokio::test(start_paused = true)]
    async fn first_sync_resets_and_fills_utxo_information() {
        let f = fixture();
        let funding = tx(&[external_outpoint(1)], &[(script(1), 50_000), (script(99), 1_000)]);
        f.repository
            .inner
            .save_transaction(&f.strategy, record(funding.clone(), 42, Some(block_hash(1))));
        let pending = tx(&[external_outpoint(2)], &[(script(2), 7_000)]);
        f.repository
            .inner
            .save_transaction(&f.strategy, record(pending.clone(), 43, None));

        let mut request = SyncRequest::new(f.strategy.clone());
        request.no_wait = true;
        let changes = f
            .orchestrator
            .sync(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(changes.current_height, 2);
        assert!(changes.confirmed.reset);
        assert_eq!(changes.confirmed.utxos.len(), 1);
        let utxo = &changes.confirmed.utxos[0];
        assert_eq!(utxo.outpoint, OutPoint::new(funding.compute_txid(), 0));
        assert_eq!(utxo.value, Amount::from_sat(50_000));
        assert_eq!(utxo.confirmations, 2);
        assert_eq!(utxo.timestamp, time(42));
        assert_eq!(
            utxo.key_path,
            Some(key_info(&f.strategy, DerivationFeature::Deposit, 1, script(1)).key_path)
        );

        assert_eq!(changes.unconfirmed.utxos.len(), 1);
        assert_eq!(changes.unconfirmed.utxos[0].confirmations, 0);
        assert_eq!(f.repository.key_calls(), 1);
        assert_eq!(f.events.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unchanged_state_waits_one_cycle_then_answers_empty() {
        let f = fixture();
        f.repository.inner.save_transaction(
            &f.strategy,
            record(tx(&[external_outpoint(1)], &[(script(1), 50_000)]), 1, Some(block_hash(1))),
        );
        let request = caught_up(&f).await;

        let started = Instant::now();
        let changes = f
            .orchestrator
            .sync(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() >= TIMEOUT);
        assert!(!changes.has_changes());
        assert!(!changes.confirmed.reset);
        assert_eq!(f.events.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn matching_transaction_during_wait_wakes_request() {
        let f = fixture();
        let request = caught_up(&f).await;

        let orchestrator = f.orchestrator.clone();
        let started = Instant::now();
        let pending = tokio::spawn(async move {
            orchestrator
                .sync(&request, &CancellationToken::new())
                .await
        });
        while f.events.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }

        // Other strategies do not wake the request
        f.events
            .publish(matched(&DerivationStrategy::new("xpub-bob"), tx(&[external_outpoint(9)], &[])));

        let incoming = tx(&[external_outpoint(3)], &[(script(3), 8_000)]);
        f.repository
            .inner
            .save_transaction(&f.strategy, record(incoming.clone(), 5, None));
        f.events.publish(matched(&f.strategy, incoming.clone()));

        let changes = pending.await.unwrap().unwrap();
        assert!(started.elapsed() < TIMEOUT);
        assert_eq!(changes.unconfirmed.utxos.len(), 1);
        assert_eq!(
            changes.unconfirmed.utxos[0].outpoint,
            OutPoint::new(incoming.compute_txid(), 0)
        );
        assert_eq!(f.events.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn transaction_announced_during_compute_is_not_missed() {
        let f = fixture();
        let request = caught_up(&f).await;

        let incoming = tx(&[external_outpoint(4)], &[(script(4), 9_000)]);
        let fired = AtomicBool::new(false);
        let repository = Arc::downgrade(&f.repository);
        let events = f.events.clone();
        let strategy = f.strategy.clone();
        let announced = incoming.clone();
        // Runs after the records were read, so the first computation cannot see the transaction
        f.repository.on_get_transactions(move || {
            if fired.swap(true, Ordering::SeqCst) {
                return;
            }
            if let Some(repository) = repository.upgrade() {
                repository
                    .inner
                    .save_transaction(&strategy, record(announced.clone(), 6, None));
            }
            events.publish(matched(&strategy, announced.clone()));
        });

        let started = Instant::now();
        let changes = f
            .orchestrator
            .sync(&request, &CancellationToken::new())
            .await
            .unwrap();

        assert!(started.elapsed() < TIMEOUT);
        assert_eq!(changes.unconfirmed.utxos.len(), 1);
        assert_eq!(
            changes.unconfirmed.utxos[0].outpoint,
            OutPoint::new(incoming.compute_txid(), 0)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_ends_wait_and_releases_subscription() {
        let f = fixture();
        let request = caught_up(&f).await;
        let cancel = CancellationToken::new();

        let orchestrator = f.orchestrator.clone();
        let token = cancel.clone();
        let started = Instant::now();
        let pending = tokio::spawn(async move { orchestrator.sync(&request, &token).await });
        while f.events.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let changes = pending.await.unwrap().unwrap();
        assert!(started.elapsed() < TIMEOUT);
        assert!(!changes.has_changes());
        assert_eq!(f.events.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn aborted_request_releases_subscription() {
        let f = fixture();
        let request = caught_up(&f).await;

        let orchestrator = f.orchestrator.clone();
        let pending = tokio::spawn(async move {
            orchestrator
                .sync(&request, &CancellationToken::new())
                .await
        });
        while f.events.subscriber_count() == 0 {
            tokio::task::yield_now().await;
        }
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
        assert_eq!(f.events.subscriber_count(), 1);

        // Client went away mid-wait
        pending.abort();
        assert!(pending.await.unwrap_err().is_cancelled());
        assert_eq!(f.events.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn confirmation_of_pending_transaction_is_reported() {
        let f = fixture();
        let payment = tx(&[external_outpoint(1)], &[(script(2), 5_000)]);
        f.repository
            .inner
            .save_transaction(&f.strategy, record(payment.clone(), 1, None));
        let mut request = caught_up(&f).await;
        request.no_wait = true;

        f.chain.push(block_hash(3)).unwrap();
        f.repository
            .inner
            .save_transaction(&f.strategy, record(payment.clone(), 2, Some(block_hash(3))));

        let changes = f
            .orchestrator
            .sync(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(changes.current_height, 3);
        assert!(changes.confirmed.utxos.iter().any(|u| u.outpoint.txid == payment.compute_txid()));
        assert_eq!(changes.confirmed.utxos[0].confirmations, 1);
        assert_eq!(changes.confirmed.utxos[0].timestamp, time(1));
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_hashes_force_a_reset() {
        let f = fixture();
        let mut request = SyncRequest::new(f.strategy.clone());
        request.confirmed_hash = Some("not-a-hash".to_string());
        request.unconfirmed_hash = Some(StateHash::all_zeros().to_string());
        request.no_wait = true;

        let changes = f
            .orchestrator
            .sync(&request, &CancellationToken::new())
            .await
            .unwrap();
        assert!(changes.confirmed.reset);
        assert!(changes.unconfirmed.reset);
        assert!(changes.has_changes());
    }
}
