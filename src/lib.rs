//! UTXO tracking and long-poll sync for HD wallets.
//!
//! The crate keeps, for every tracked derivation strategy, a view of its unspent outputs that is
//! recomputed from saved transactions and the current best chain, and hands clients minimal
//! changes against the last state they saw. Storage, the chain index and the full node are
//! reached through the [`repository::Repository`], [`chain::ChainIndex`] and
//! [`node::NodeClient`] traits.

pub mod chain;
pub mod config;
pub mod node;
pub mod repository;
pub mod wallet;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::ExplorerConfig;
pub use wallet::{DerivationStrategy, ExplorerError, ExplorerService};
