//! In-memory chain used by unit tests

use async_trait::async_trait;
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::transaction::Version;
use bitcoin::{absolute, Amount, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::derivation::script_hash;
use crate::electrum::{HistoryEntry, UnspentEntry};
use crate::error::WalletError;
use crate::wallet::context::ChainSource;

#[derive(Default)]
struct State {
    counter: u32,
    transactions: HashMap<Txid, Transaction>,
    history: HashMap<ScriptBuf, Vec<HistoryEntry>>,
    unspent: HashMap<ScriptBuf, Vec<UnspentEntry>>,
    probed: Vec<ScriptBuf>,
    subscribed: Vec<String>,
    failing: bool,
}

#[derive(Default)]
pub struct FakeChain {
    state: Mutex<State>,
}

impl FakeChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pay `value` to `script` in a confirmed transaction
    pub fn fund(&self, script: &Script, value: u64) -> OutPoint {
        self.fund_at(script, value, 100)
    }

    pub fn fund_at(&self, script: &Script, value: u64, height: i64) -> OutPoint {
        let mut state = self.state.lock().unwrap();
        state.counter += 1;
        let mut seed = [0u8; 32];
        seed[..4].copy_from_slice(&state.counter.to_le_bytes());

        let tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: OutPoint::new(Txid::from_byte_array(seed), 0),
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(value),
                script_pubkey: script.to_owned(),
            }],
        };
        let txid = tx.compute_txid();
        state.transactions.insert(txid, tx);
        state
            .history
            .entry(script.to_owned())
            .or_default()
            .push(HistoryEntry {
                tx_hash: txid.to_string(),
                height,
                fee: None,
            });
        state
            .unspent
            .entry(script.to_owned())
            .or_default()
            .push(UnspentEntry {
                tx_hash: txid.to_string(),
                tx_pos: 0,
                height,
                value,
            });
        OutPoint::new(txid, 0)
    }

    /// Spend an output of `script` to an unrelated script
    pub fn spend(&self, script: &Script, outpoint: OutPoint) -> Txid {
        let mut state = self.state.lock().unwrap();
        let tx = Transaction {
            version: Version::TWO,
            lock_time: absolute::LockTime::ZERO,
            input: vec![TxIn {
                previous_output: outpoint,
                script_sig: ScriptBuf::new(),
                sequence: Sequence::MAX,
                witness: Witness::new(),
            }],
            output: vec![TxOut {
                value: Amount::from_sat(1),
                script_pubkey: ScriptBuf::from_bytes(vec![0x6a]),
            }],
        };
        let txid = tx.compute_txid();
        state.transactions.insert(txid, tx);
        state
            .history
            .entry(script.to_owned())
            .or_default()
            .push(HistoryEntry {
                tx_hash: txid.to_string(),
                height: 0,
                fee: None,
            });
        let spent = outpoint.txid.to_string();
        if let Some(entries) = state.unspent.get_mut(script) {
            entries.retain(|e| !(e.tx_hash == spent && e.tx_pos == outpoint.vout));
        }
        txid
    }

    /// Scripts whose history was requested, in request order
    pub fn probed_scripts(&self) -> Vec<ScriptBuf> {
        self.state.lock().unwrap().probed.clone()
    }

    pub fn subscribed(&self) -> Vec<String> {
        self.state.lock().unwrap().subscribed.clone()
    }

    pub fn fail_requests(&self, failing: bool) {
        self.state.lock().unwrap().failing = failing;
    }

    fn check(&self) -> Result<(), WalletError> {
        if self.state.lock().unwrap().failing {
            return Err(WalletError::Network("fake chain offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ChainSource for FakeChain {
    async fn get_history(&self, script: &Script) -> Result<Vec<HistoryEntry>, WalletError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.probed.push(script.to_owned());
        Ok(state.history.get(script).cloned().unwrap_or_default())
    }

    async fn list_unspent(&self, script: &Script) -> Result<Vec<UnspentEntry>, WalletError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        Ok(state.unspent.get(script).cloned().unwrap_or_default())
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<String, WalletError> {
        self.check()?;
        let state = self.state.lock().unwrap();
        state
            .transactions
            .values()
            .find(|tx| tx.compute_txid().to_string() == txid)
            .map(serialize_hex)
            .ok_or_else(|| WalletError::Network(format!("unknown transaction {}", txid)))
    }

    async fn subscribe(&self, hash: &str) -> Result<Option<String>, WalletError> {
        self.check()?;
        let mut state = self.state.lock().unwrap();
        state.subscribed.push(hash.to_string());
        let status = state
            .history
            .iter()
            .find(|(script, _)| script_hash(script) == hash)
            .map(|(_, entries)| format!("{}", entries.len()));
        Ok(status)
    }
}
