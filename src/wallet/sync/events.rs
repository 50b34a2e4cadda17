//! Event bus for block and wallet notifications.
//!
//! This module defines the events flowing between the chain watchers and the explorer core, and
//! the [`EventBus`] that carries them. The bus is constructed once per process and handed to every
//! component that publishes or listens; it is cheap to clone and all clones share one subscriber
//! registry.
//!
//! Delivery is synchronous on the publishing task. A subscriber never sees two events at the same
//! time, so events of one type reach it in the order they were published. Disposing a
//! subscription guarantees its callback is not entered again; an invocation already running on
//! another thread is allowed to finish first.

use crate::repository::TransactionRecord;
use crate::wallet::DerivationStrategy;

use bitcoin::bip32::DerivationPath;
use bitcoin::{Amount, BlockHash, Network, OutPoint, ScriptBuf, Txid};
use parking_lot::{Mutex, ReentrantMutex, RwLock};
use serde::{Deserialize, Serialize};
use std::cell::Cell;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Events carried by the bus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum ExplorerEvent {
    /// A block was connected to the best chain
    NewBlock(NewBlockEvent),
    /// A transaction touching a tracked strategy was seen
    NewTransactionMatch(NewTransactionMatchEvent),
    /// A transaction was dropped because it conflicts with the chain
    EvictedTransaction(EvictedTransactionEvent),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewBlockEvent {
    pub network: Network,
    pub height: u32,
    pub hash: BlockHash,
    pub previous_hash: Option<BlockHash>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewTransactionMatchEvent {
    pub network: Network,
    pub strategy: DerivationStrategy,
    pub transaction: TransactionRecord,
    pub inputs: Vec<MatchedInput>,
    pub outputs: Vec<MatchedOutput>,
    pub block_id: Option<BlockHash>,
}

/// An input of a matched transaction spending a coin of the strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedInput {
    pub index: u32,
    pub previous_output: OutPoint,
    pub key_path: DerivationPath,
}

/// An output of a matched transaction paying the strategy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchedOutput {
    pub index: u32,
    pub key_path: DerivationPath,
    pub script_pubkey: ScriptBuf,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvictedTransactionEvent {
    pub txid: Txid,
}

type Predicate = Box<dyn Fn(&ExplorerEvent) -> bool + Send + Sync>;
type Callback = Box<dyn Fn(&ExplorerEvent) + Send + Sync>;

struct Subscriber {
    predicate: Predicate,
    callback: Callback,
    /// Held for the whole callback invocation; `false` once disposed.
    /// Reentrant so a callback may dispose its own subscription.
    gate: ReentrantMutex<Cell<bool>>,
}

#[derive(Default)]
struct BusInner {
    subscribers: RwLock<BTreeMap<u64, Arc<Subscriber>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

/// Process-wide publish/subscribe service.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `callback` for every published event accepted by `predicate`.
    ///
    /// The subscription lives until the returned handle is disposed or dropped. Events published
    /// while this call runs may or may not be observed.
    pub fn subscribe<P, F>(&self, predicate: P, callback: F) -> SubscriptionHandle
    where
        P: Fn(&ExplorerEvent) -> bool + Send + Sync + 'static,
        F: Fn(&ExplorerEvent) + Send + Sync + 'static,
    {
        let subscriber = Arc::new(Subscriber {
            predicate: Box::new(predicate),
            callback: Box::new(callback),
            gate: ReentrantMutex::new(Cell::new(true)),
        });

        let mut subscribers = self.inner.subscribers.write();
        if self.inner.closed.load(Ordering::SeqCst) {
            debug!("Event bus is shut down, returning inert subscription");
            return SubscriptionHandle::inert();
        }
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        subscribers.insert(id, subscriber.clone());

        SubscriptionHandle {
            id,
            bus: Arc::downgrade(&self.inner),
            subscriber: Arc::downgrade(&subscriber),
        }
    }

    /// Deliver `event` to every live subscriber whose predicate accepts it.
    pub fn publish(&self, event: ExplorerEvent) {
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        // Snapshot so callbacks may subscribe or dispose without deadlocking the registry
        let subscribers: Vec<Arc<Subscriber>> =
            self.inner.subscribers.read().values().cloned().collect();

        for subscriber in subscribers {
            if !(subscriber.predicate)(&event) {
                continue;
            }
            let gate = subscriber.gate.lock();
            if gate.get() {
                (subscriber.callback)(&event);
            }
        }
    }

    /// One-shot subscription to the next event accepted by `predicate`.
    ///
    /// The subscription starts now, so an event published before [`NextEvent::wait`] is called is
    /// still delivered.
    pub fn subscribe_next<P>(&self, predicate: P) -> NextEvent
    where
        P: Fn(&ExplorerEvent) -> bool + Send + Sync + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let sender = Mutex::new(Some(sender));
        let handle = self.subscribe(predicate, move |event| {
            if let Some(sender) = sender.lock().take() {
                let _ = sender.send(event.clone());
            }
        });
        NextEvent { receiver, handle }
    }

    /// Wait for the next event accepted by `predicate`.
    ///
    /// Resolves to `None` when `timeout` elapses or `cancel` fires. The subscription is removed
    /// on every outcome.
    pub async fn wait_next<P>(
        &self,
        predicate: P,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Option<ExplorerEvent>
    where
        P: Fn(&ExplorerEvent) -> bool + Send + Sync + 'static,
    {
        self.subscribe_next(predicate).wait(timeout, cancel).await
    }

    /// Number of live subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.inner.subscribers.read().len()
    }

    /// Dispose every live subscription and stop accepting new ones.
    ///
    /// Pending waits resolve to `None`.
    pub fn shutdown(&self) {
        let drained = {
            let mut subscribers = self.inner.subscribers.write();
            self.inner.closed.store(true, Ordering::SeqCst);
            std::mem::take(&mut *subscribers)
        };
        debug!("Shutting down event bus with {} subscriptions", drained.len());
        for subscriber in drained.values() {
            subscriber.gate.lock().set(false);
        }
    }
}

/// Owner of one subscription. Dropping it disposes the subscription.
pub struct SubscriptionHandle {
    id: u64,
    bus: Weak<BusInner>,
    subscriber: Weak<Subscriber>,
}

impl SubscriptionHandle {
    fn inert() -> Self {
        Self {
            id: u64::MAX,
            bus: Weak::new(),
            subscriber: Weak::new(),
        }
    }

    /// Stop delivery to this subscription. Idempotent.
    pub fn dispose(&self) {
        if let Some(subscriber) = self.subscriber.upgrade() {
            subscriber.gate.lock().set(false);
        }
        if let Some(bus) = self.bus.upgrade() {
            bus.subscribers.write().remove(&self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.subscriber
            .upgrade()
            .is_some_and(|subscriber| subscriber.gate.lock().get())
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.dispose();
    }
}

/// A pending one-shot subscription created by [`EventBus::subscribe_next`].
pub struct NextEvent {
    receiver: oneshot::Receiver<ExplorerEvent>,
    handle: SubscriptionHandle,
}

impl NextEvent {
    /// Resolve with the captured event, or `None` on timeout, cancellation or bus shutdown.
    pub async fn wait(self, timeout: Duration, cancel: &CancellationToken) -> Option<ExplorerEvent> {
        let NextEvent { receiver, handle } = self;
        let outcome = tokio::select! {
            biased;
            received = receiver => received.ok(),
            _ = cancel.cancelled() => {
                debug!("Wait cancelled");
                None
            }
            _ = tokio::time::sleep(timeout) => {
                debug!("Wait timed out after {:?}", timeout);
                None
            }
        };
        handle.dispose();
        outcome
    }
}
