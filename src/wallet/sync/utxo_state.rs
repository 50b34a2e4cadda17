//! Content-addressed UTXO states and the minimal changes between them.
//!
//! A [`UtxoState`] is rebuilt from scratch on every request by replaying a strategy's classified
//! transactions. Its hash covers the unspent mapping and the spent set and nothing else, so two
//! replays ending in the same contents always hash the same. Clients hand back the hash of the
//! last state they received and get a [`UtxoChange`] relative to it.

use crate::wallet::sync::transactions::AnnotatedTransaction;

use bitcoin::bip32::DerivationPath;
use bitcoin::consensus::encode::serialize;
use bitcoin::hashes::{Hash, HashEngine, sha256};
use bitcoin::{Amount, OutPoint, Script, ScriptBuf, TxOut};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

/// Hash of a state's contents
pub type StateHash = sha256::Hash;

const UNSPENT_TAG: u8 = b'u';
const SPENT_TAG: u8 = b's';

/// Parse a client-supplied state hash. Anything unparseable counts as no hash.
pub fn parse_state_hash(hash: Option<&str>) -> Option<StateHash> {
    hash.and_then(|hash| StateHash::from_str(hash.trim()).ok())
}

/// Decides which output scripts belong to the wallet being replayed.
pub trait ScriptMatcher {
    /// One answer per script, in order.
    fn matches(&self, scripts: &[&Script]) -> Vec<bool>;
}

impl<F> ScriptMatcher for F
where
    F: Fn(&Script) -> bool,
{
    fn matches(&self, scripts: &[&Script]) -> Vec<bool> {
        scripts.iter().map(|&script| self(script)).collect()
    }
}

#[cfg(test)]
thread_local! {
    static ELEMENT_DIGESTS: std::cell::Cell<usize> = const { std::cell::Cell::new(0) };
}

fn element_digest(tag: u8, outpoint: &OutPoint, output: Option<&TxOut>) -> sha256::Hash {
    #[cfg(test)]
    ELEMENT_DIGESTS.with(|count| count.set(count.get() + 1));

    let mut engine = sha256::Hash::engine();
    engine.input(&[tag]);
    engine.input(&serialize(outpoint));
    if let Some(output) = output {
        engine.input(&serialize(output));
    }
    sha256::Hash::from_engine(engine)
}

/// Unspent outputs and spent outpoints of one replay.
///
/// Every element contributes its own digest, XOR-folded into `accumulator`, so adding or removing
/// an element updates the hash in constant time whatever the order of operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoState {
    unspent: BTreeMap<OutPoint, TxOut>,
    spent: BTreeSet<OutPoint>,
    accumulator: [u8; 32],
    hash: StateHash,
}

impl Default for UtxoState {
    fn default() -> Self {
        let mut state = Self {
            unspent: BTreeMap::new(),
            spent: BTreeSet::new(),
            accumulator: [0; 32],
            hash: StateHash::all_zeros(),
        };
        state.seal();
        state
    }
}

impl UtxoState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash(&self) -> StateHash {
        self.hash
    }

    pub fn unspent(&self) -> &BTreeMap<OutPoint, TxOut> {
        &self.unspent
    }

    pub fn spent(&self) -> &BTreeSet<OutPoint> {
        &self.spent
    }

    /// Inputs first, so a transaction cannot spend its own outputs.
    fn apply(&mut self, tx: &AnnotatedTransaction, matcher: &(impl ScriptMatcher + ?Sized)) {
        for outpoint in tx.spent_outpoints() {
            if let Some(output) = self.unspent.remove(&outpoint) {
                self.toggle(element_digest(UNSPENT_TAG, &outpoint, Some(&output)));
                if self.spent.insert(outpoint) {
                    self.toggle(element_digest(SPENT_TAG, &outpoint, None));
                }
            }
        }

        let outputs = &tx.transaction().output;
        let scripts: Vec<&Script> = outputs.iter().map(|output| output.script_pubkey.as_script()).collect();
        let owned = matcher.matches(&scripts);
        for (vout, (output, owned)) in outputs.iter().zip(owned).enumerate() {
            if owned {
                let outpoint = OutPoint::new(tx.txid, vout as u32);
                if let Some(previous) = self.unspent.insert(outpoint, output.clone()) {
                    self.toggle(element_digest(UNSPENT_TAG, &outpoint, Some(&previous)));
                }
                self.toggle(element_digest(UNSPENT_TAG, &outpoint, Some(output)));
            }
        }
    }

    fn toggle(&mut self, digest: sha256::Hash) {
        for (acc, byte) in self.accumulator.iter_mut().zip(digest.as_byte_array()) {
            *acc ^= byte;
        }
    }

    /// Fold the element counts and the accumulator into the state hash.
    fn seal(&mut self) {
        let mut engine = sha256::Hash::engine();
        engine.input(&(self.unspent.len() as u64).to_le_bytes());
        engine.input(&(self.spent.len() as u64).to_le_bytes());
        engine.input(&self.accumulator);
        self.hash = sha256::Hash::from_engine(engine);
    }

    /// Replay `transactions` on top of `self`.
    ///
    /// When `known` is given, the first prefix of the replay (the starting state included) whose
    /// hash equals it is kept as the known state.
    fn replay(
        mut self,
        transactions: &[AnnotatedTransaction],
        matcher: &(impl ScriptMatcher + ?Sized),
        known: Option<StateHash>,
    ) -> UtxoStateResult {
        let mut known_state = known.filter(|hash| *hash == self.hash).map(|_| self.clone());
        for tx in transactions {
            self.apply(tx, matcher);
            if known_state.is_none() && known.is_some() {
                self.seal();
                if Some(self.hash) == known {
                    known_state = Some(self.clone());
                }
            }
        }
        self.seal();

        UtxoStateResult {
            known: known_state,
            actual: self,
        }
    }
}

/// A freshly computed state and, if the client's hash was recognized, the state it names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UtxoStateResult {
    pub known: Option<UtxoState>,
    pub actual: UtxoState,
}

impl UtxoStateResult {
    pub fn change(&self, subtract: Option<&UtxoState>) -> UtxoChange {
        UtxoChange::between(self.known.as_ref(), &self.actual, subtract)
    }
}

/// Confirmed and unconfirmed states of one strategy.
#[derive(Debug, Clone)]
pub struct UtxoStates {
    pub confirmed: UtxoStateResult,
    /// Replayed on top of the confirmed actual state
    pub unconfirmed: UtxoStateResult,
}

impl UtxoStates {
    pub fn create(
        matcher: &(impl ScriptMatcher + ?Sized),
        confirmed: &[AnnotatedTransaction],
        unconfirmed: &[AnnotatedTransaction],
        known_confirmed: Option<StateHash>,
        known_unconfirmed: Option<StateHash>,
    ) -> Self {
        let confirmed = UtxoState::new().replay(confirmed, matcher, known_confirmed);
        let unconfirmed = confirmed
            .actual
            .clone()
            .replay(unconfirmed, matcher, known_unconfirmed);
        Self {
            confirmed,
            unconfirmed,
        }
    }

    pub fn confirmed_change(&self) -> UtxoChange {
        self.confirmed.change(None)
    }

    /// Confirmed outputs already reported by [`Self::confirmed_change`] are left out.
    pub fn unconfirmed_change(&self) -> UtxoChange {
        self.unconfirmed.change(Some(&self.confirmed.actual))
    }
}

/// An unspent output as reported to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub outpoint: OutPoint,
    pub script_pubkey: ScriptBuf,
    #[serde(with = "bitcoin::amount::serde::as_sat")]
    pub value: Amount,
    pub key_path: Option<DerivationPath>,
    pub confirmations: u32,
    pub timestamp: DateTime<Utc>,
}

impl Utxo {
    fn new(outpoint: OutPoint, output: &TxOut) -> Self {
        Self {
            outpoint,
            script_pubkey: output.script_pubkey.clone(),
            value: output.value,
            key_path: None,
            confirmations: 0,
            timestamp: DateTime::<Utc>::default(),
        }
    }

    pub fn tx_out(&self) -> TxOut {
        TxOut {
            value: self.value,
            script_pubkey: self.script_pubkey.clone(),
        }
    }
}

/// Difference between a client's known state and the actual one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UtxoChange {
    /// The client's state was not recognized; `utxos` is the whole unspent set
    pub reset: bool,
    /// Hash of the actual state, to be sent back next time
    pub hash: StateHash,
    pub utxos: Vec<Utxo>,
    pub spent_outpoints: Vec<OutPoint>,
}

impl UtxoChange {
    /// Outputs unspent in `actual` but not in `known`, and outputs spent since `known`.
    ///
    /// Anything in `subtract` has been reported through another change and is skipped.
    pub fn between(known: Option<&UtxoState>, actual: &UtxoState, subtract: Option<&UtxoState>) -> Self {
        let known_unspent = |outpoint: &OutPoint| known.is_some_and(|k| k.unspent.contains_key(outpoint));
        let known_spent = |outpoint: &OutPoint| known.is_some_and(|k| k.spent.contains(outpoint));
        let subtracted_unspent = |outpoint: &OutPoint| subtract.is_some_and(|s| s.unspent.contains_key(outpoint));
        let subtracted_spent = |outpoint: &OutPoint| subtract.is_some_and(|s| s.spent.contains(outpoint));

        let utxos = actual
            .unspent
            .iter()
            .filter(|(outpoint, _)| !known_unspent(outpoint) && !subtracted_unspent(outpoint))
            .map(|(outpoint, output)| Utxo::new(*outpoint, output))
            .collect();
        let spent_outpoints = actual
            .spent
            .iter()
            .filter(|outpoint| !known_spent(outpoint) && known_unspent(outpoint) && !subtracted_spent(outpoint))
            .copied()
            .collect();

        Self {
            reset: known.is_none(),
            hash: actual.hash,
            utxos,
            spent_outpoints,
        }
    }

    /// Nothing to tell the client. A reset always counts as a change.
    pub fn is_empty(&self) -> bool {
        !self.reset && self.utxos.is_empty() && self.spent_outpoints.is_empty()
    }

    /// Bring a client's copy of the unspent mapping up to date.
    pub fn apply_to(&self, unspent: &mut BTreeMap<OutPoint, TxOut>) {
        if self.reset {
            unspent.clear();
        }
        for outpoint in &self.spent_outpoints {
            unspent.remove(outpoint);
        }
        for utxo in &self.utxos {
            unspent.insert(utxo.outpoint, utxo.tx_out());
        }
    }
}
