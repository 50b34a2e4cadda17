//! Shared fixtures for unit tests.

use crate::node::{BlockchainInfo, NodeClient, NodeError, RpcError};
use crate::repository::{InMemoryRepository, Repository, RepositoryError, TransactionRecord};
use crate::wallet::{DerivationFeature, DerivationStrategy, KeyPathInformation};

use bitcoin::absolute::LockTime;
use bitcoin::bip32::{ChildNumber, DerivationPath};
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{
    Amount, BlockHash, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, WPubkeyHash,
    Witness,
};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

pub fn script(n: u8) -> ScriptBuf {
    ScriptBuf::new_p2wpkh(&WPubkeyHash::from_byte_array([n; 20]))
}

pub fn txid(n: u8) -> Txid {
    Txid::from_byte_array([n; 32])
}

pub fn block_hash(n: u8) -> BlockHash {
    BlockHash::from_byte_array([n; 32])
}

/// An outpoint funded by a transaction no wallet knows about.
pub fn external_outpoint(n: u8) -> OutPoint {
    let mut bytes = [n; 32];
    bytes[0] = 0xee;
    OutPoint::new(Txid::from_byte_array(bytes), 0)
}

pub fn tx(inputs: &[OutPoint], outputs: &[(ScriptBuf, u64)]) -> Transaction {
    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input: inputs
            .iter()
            .map(|previous_output| TxIn {
                previous_output: *previous_output,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            })
            .collect(),
        output: outputs
            .iter()
            .map(|(script_pubkey, sats)| TxOut {
                value: Amount::from_sat(*sats),
                script_pubkey: script_pubkey.clone(),
            })
            .collect(),
    }
}

pub fn time(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap()
}

pub fn record(transaction: Transaction, secs: i64, block: Option<BlockHash>) -> TransactionRecord {
    TransactionRecord::new(transaction, time(secs), block)
}

pub fn key_path(feature: DerivationFeature, index: u32) -> DerivationPath {
    let branch = match feature {
        DerivationFeature::Deposit => 0,
        DerivationFeature::Change => 1,
        DerivationFeature::Direct => 2,
    };
    DerivationPath::from(vec![
        ChildNumber::Normal { index: branch },
        ChildNumber::Normal { index },
    ])
}

pub fn key_info(
    strategy: &DerivationStrategy,
    feature: DerivationFeature,
    index: u32,
    script_pubkey: ScriptBuf,
) -> KeyPathInformation {
    KeyPathInformation {
        strategy: strategy.clone(),
        feature,
        key_path: key_path(feature, index),
        script_pubkey,
    }
}

pub fn missing_inputs() -> RpcError {
    RpcError::new(-25, "bad-txns-inputs-missingorspent")
}

/// Node double that accepts a transaction once every required parent is in its mempool.
#[derive(Default)]
pub struct FakeNode {
    pub mempool: Mutex<Vec<Txid>>,
    pub submissions: Mutex<Vec<Txid>>,
    required: Mutex<HashSet<Txid>>,
    rejections: Mutex<HashMap<Txid, RpcError>>,
    next_rejections: Mutex<VecDeque<RpcError>>,
    unavailable: Mutex<bool>,
    info: Mutex<Option<BlockchainInfo>>,
}

impl FakeNode {
    /// Children of `parent` are rejected with missing inputs until `parent` is submitted.
    pub fn require(&self, parent: Txid) {
        self.required.lock().insert(parent);
    }

    pub fn reject(&self, txid: Txid, error: RpcError) {
        self.rejections.lock().insert(txid, error);
    }

    /// Reject the next submission, whatever it is.
    pub fn reject_next(&self, error: RpcError) {
        self.next_rejections.lock().push_back(error);
    }

    pub fn set_unavailable(&self) {
        *self.unavailable.lock() = true;
    }

    pub fn set_info(&self, info: BlockchainInfo) {
        *self.info.lock() = Some(info);
    }

    pub fn submitted(&self) -> Vec<Txid> {
        self.submissions.lock().clone()
    }
}

#[async_trait::async_trait]
impl NodeClient for FakeNode {
    async fn send_raw_transaction(&self, transaction: &Transaction) -> Result<Txid, NodeError> {
        if *self.unavailable.lock() {
            return Err(NodeError::Unavailable("connection refused".to_string()));
        }
        let txid = transaction.compute_txid();
        self.submissions.lock().push(txid);

        if let Some(error) = self.next_rejections.lock().pop_front() {
            return Err(NodeError::Rejected(error));
        }
        if let Some(error) = self.rejections.lock().get(&txid) {
            return Err(NodeError::Rejected(error.clone()));
        }
        let required = self.required.lock();
        let mut mempool = self.mempool.lock();
        let missing = transaction.input.iter().any(|input| {
            let parent = input.previous_output.txid;
            required.contains(&parent) && !mempool.contains(&parent)
        });
        if missing {
            return Err(NodeError::Rejected(missing_inputs()));
        }
        mempool.push(txid);
        Ok(txid)
    }

    async fn blockchain_info(&self) -> Result<BlockchainInfo, NodeError> {
        if *self.unavailable.lock() {
            return Err(NodeError::Unavailable("connection refused".to_string()));
        }
        self.info
            .lock()
            .clone()
            .ok_or_else(|| NodeError::InvalidResponse("no info".to_string()))
    }
}

/// Repository wrapper counting key lookups and running a hook when transactions are read.
#[derive(Default)]
pub struct CountingRepository {
    pub inner: InMemoryRepository,
    pub key_calls: AtomicUsize,
    pub key_scripts: AtomicUsize,
    on_get_transactions: Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl CountingRepository {
    pub fn on_get_transactions(&self, hook: impl Fn() + Send + Sync + 'static) {
        *self.on_get_transactions.lock() = Some(Box::new(hook));
    }

    pub fn key_calls(&self) -> usize {
        self.key_calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Repository for CountingRepository {
    async fn get_transactions(
        &self,
        strategy: &DerivationStrategy,
    ) -> Result<Vec<TransactionRecord>, RepositoryError> {
        let records = self.inner.get_transactions(strategy).await?;
        if let Some(hook) = self.on_get_transactions.lock().as_ref() {
            hook();
        }
        Ok(records)
    }

    async fn get_saved_transactions(&self, txid: &Txid) -> Result<Vec<TransactionRecord>, RepositoryError> {
        self.inner.get_saved_transactions(txid).await
    }

    async fn get_key_informations(
        &self,
        scripts: &[ScriptBuf],
    ) -> Result<Vec<Vec<KeyPathInformation>>, RepositoryError> {
        self.key_calls.fetch_add(1, Ordering::SeqCst);
        self.key_scripts.fetch_add(scripts.len(), Ordering::SeqCst);
        self.inner.get_key_informations(scripts).await
    }

    async fn track(&self, strategy: &DerivationStrategy) -> Result<(), RepositoryError> {
        self.inner.track(strategy).await
    }

    async fn cancel_reservation(
        &self,
        strategy: &DerivationStrategy,
        key_paths: &[DerivationPath],
    ) -> Result<(), RepositoryError> {
        self.inner.cancel_reservation(strategy, key_paths).await
    }

    async fn clean_transactions(
        &self,
        strategy: &DerivationStrategy,
        records: &[TransactionRecord],
    ) -> Result<(), RepositoryError> {
        self.inner.clean_transactions(strategy, records).await
    }

    async fn get_unused(
        &self,
        strategy: &DerivationStrategy,
        feature: DerivationFeature,
        skip: usize,
        reserve: bool,
    ) -> Result<Option<KeyPathInformation>, RepositoryError> {
        self.inner.get_unused(strategy, feature, skip, reserve).await
    }

    async fn get_index_progress(&self) -> Result<Option<Vec<BlockHash>>, RepositoryError> {
        self.inner.get_index_progress().await
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        self.inner.ping().await
    }
}
