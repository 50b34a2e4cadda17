//! Wallet Synchronization Module
//!
//! This module holds the core logic for keeping clients' views of their wallets up to date. It is
//! composed of several submodules, each responsible for one step of the process:
//!
//! - `events`: The process-wide event bus carrying block, match and eviction events.
//! - `transactions`: Classifies a strategy's saved transactions as confirmed, unconfirmed or conflicted.
//! - `key_paths`: Request-scoped, batched script to key path resolution.
//! - `utxo_state`: Replays classified transactions into hashed UTXO states and diffs them.
//! - `orchestrator`: The long-poll sync protocol tying the above together.
//! - `broadcast`: Transaction submission with recovery of forgotten ancestors.
//! - `notifications`: Per-client push notification sessions.
//!
//! Every request builds its own view from fresh repository and chain snapshots; the event bus is
//! the only state shared between requests.

/// Event bus and event types
pub mod events;
/// Broadcast with missing-inputs recovery
pub mod broadcast;
/// Script to key path resolution
pub mod key_paths;
/// Push notification sessions
pub mod notifications;
/// Long-poll sync coordinator
pub mod orchestrator;
/// Transaction classification against the best chain
pub mod transactions;
/// UTXO state replay and diffs
pub mod utxo_state;

pub use broadcast::{BroadcastOrchestrator, BroadcastResult, MissingInputsMatcher};
pub use events::{
    EventBus, EvictedTransactionEvent, ExplorerEvent, MatchedInput, MatchedOutput, NewBlockEvent,
    NewTransactionMatchEvent, NextEvent, SubscriptionHandle,
};
pub use key_paths::KeyPathResolver;
pub use notifications::{BlockNotification, Notification, NotificationSession, TransactionNotification};
pub use orchestrator::{SyncOrchestrator, SyncRequest, UtxoChanges};
pub use transactions::{
    AnnotatedTransaction, AnnotatedTransactionCollection, TransactionClassifier, TransactionResult,
};
pub use utxo_state::{ScriptMatcher, StateHash, Utxo, UtxoChange, UtxoState, UtxoStateResult, UtxoStates};
