//! Common test utilities for engine integration tests
//!
//! - In-process Electrum server speaking newline-delimited JSON-RPC
//! - Chain state the tests fund and spend against
//! - Test mnemonic keys for signing payouts
#![allow(dead_code)]

use bitcoin::bip32::{ChildNumber, DerivationPath, Xpriv, Xpub};
use bitcoin::consensus::encode::serialize_hex;
use bitcoin::hashes::Hash;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::transaction::Version;
use bitcoin::{absolute, Amount, Network, OutPoint, Script, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use inheritance_engine::config::{ElectrumConfig, Transport};
use inheritance_engine::derivation::script_hash;
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub const TEST_MNEMONIC: &str =
    "abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon abandon about";

#[derive(Default)]
struct ChainState {
    counter: u32,
    transactions: HashMap<String, String>,
    history: HashMap<String, Vec<(String, i64)>>,
    unspent: HashMap<String, Vec<(String, u32, i64, u64)>>,
    /// Every request method received, in order
    requests: Vec<String>,
    subscribe_calls: HashMap<String, usize>,
    /// Sockets accepted, refused ones included
    accepted: usize,
    connections: usize,
    /// Only the handshake is answered
    silent: bool,
    /// Accepted sockets are closed straight away
    refusing: bool,
}

impl ChainState {
    /// Electrum status: sha256 of `tx_hash:height:` for each history entry
    fn status(&self, script_hash: &str) -> Value {
        match self.history.get(script_hash) {
            Some(entries) if !entries.is_empty() => {
                let joined: String = entries
                    .iter()
                    .map(|(tx, height)| format!("{}:{}:", tx, height))
                    .collect();
                Value::String(hex::encode(Sha256::digest(joined.as_bytes())))
            }
            _ => Value::Null,
        }
    }
}

/// Electrum server stand-in bound to a random local port
pub struct MockElectrum {
    port: u16,
    state: Arc<Mutex<ChainState>>,
    sessions: Arc<Mutex<Vec<(mpsc::UnboundedSender<String>, JoinHandle<()>)>>>,
    accept_task: JoinHandle<()>,
}

impl MockElectrum {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(Mutex::new(ChainState::default()));
        let sessions = Arc::new(Mutex::new(Vec::new()));

        let accept_state = state.clone();
        let accept_sessions = sessions.clone();
        let accept_task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                {
                    let mut state = accept_state.lock().unwrap();
                    state.accepted += 1;
                    if state.refusing {
                        drop(socket);
                        continue;
                    }
                    state.connections += 1;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                let handle = tokio::spawn(serve(socket, rx, tx.clone(), accept_state.clone()));
                accept_sessions.lock().unwrap().push((tx, handle));
            }
        });

        Self {
            port,
            state,
            sessions,
            accept_task,
        }
    }

    pub fn config(&self) -> ElectrumConfig {
        let mut config = ElectrumConfig::default_for(Network::Regtest);
        config.host = "127.0.0.1".to_string();
        config.port = self.port;
        config.transport = Transport::Tcp;
        config.reconnect_delay = Duration::from_millis(100);
        config.request_timeout = Duration::from_secs(5);
        config
    }

    /// Pay `value` to `script` in a confirmed transaction
    pub fn fund(&self, script: &Script, value: u64) -> OutPoint {
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
        let sh = script_hash(script);
        state.transactions.insert(txid.to_string(), serialize_hex(&tx));
        state.history.entry(sh.clone()).or_default().push((txid.to_string(), 100));
        state
            .unspent
            .entry(sh)
            .or_default()
            .push((txid.to_string(), 0, 100, value));
        OutPoint::new(txid, 0)
    }

    /// Spend an output of `script` in an unconfirmed transaction
    pub fn spend(&self, script: &Script, outpoint: OutPoint) {
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
                value: Amount::from_sat(1_000),
                script_pubkey: ScriptBuf::from_bytes(vec![0x6a]),
            }],
        };
        let txid = tx.compute_txid().to_string();
        let sh = script_hash(script);
        state.transactions.insert(txid.clone(), serialize_hex(&tx));
        state.history.entry(sh.clone()).or_default().push((txid, 0));
        let spent = outpoint.txid.to_string();
        if let Some(entries) = state.unspent.get_mut(&sh) {
            entries.retain(|(tx, pos, _, _)| !(tx == &spent && *pos == outpoint.vout));
        }
    }

    /// Push the current status of `script` to every open session
    pub fn notify(&self, script: &Script) {
        let sh = script_hash(script);
        let status = self.state.lock().unwrap().status(&sh);
        let line = json!({
            "jsonrpc": "2.0",
            "method": "blockchain.scripthash.subscribe",
            "params": [sh, status],
        })
        .to_string();
        for (tx, _) in self.sessions.lock().unwrap().iter() {
            let _ = tx.send(format!("{}\n", line));
        }
    }

    /// Close every open session from the server side
    pub fn drop_connections(&self) {
        for (_, handle) in self.sessions.lock().unwrap().drain(..) {
            handle.abort();
        }
    }

    /// Keep sessions open but stop answering anything except `server.version`
    pub fn go_silent(&self, silent: bool) {
        self.state.lock().unwrap().silent = silent;
    }

    pub fn refuse_connections(&self, refusing: bool) {
        self.state.lock().unwrap().refusing = refusing;
    }

    pub fn accepted(&self) -> usize {
        self.state.lock().unwrap().accepted
    }

    pub fn connections(&self) -> usize {
        self.state.lock().unwrap().connections
    }

    pub fn subscribe_calls(&self, script_hash: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .subscribe_calls
            .get(script_hash)
            .copied()
            .unwrap_or(0)
    }

    pub fn requests(&self) -> Vec<String> {
        self.state.lock().unwrap().requests.clone()
    }
}

impl Drop for MockElectrum {
    fn drop(&mut self) {
        self.accept_task.abort();
        self.drop_connections();
    }
}

async fn serve(
    socket: tokio::net::TcpStream,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    reply: mpsc::UnboundedSender<String>,
    state: Arc<Mutex<ChainState>>,
) {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                let Ok(request) = serde_json::from_str::<Value>(&line) else { continue };
                if let Some(response) = handle(&request, &state) {
                    let _ = reply.send(format!("{}\n", response));
                }
            }
            Some(out) = outgoing.recv() => {
                if write_half.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        }
    }
}

fn handle(request: &Value, state: &Arc<Mutex<ChainState>>) -> Option<Value> {
    let id = request["id"].clone();
    let method = request["method"].as_str().unwrap_or_default().to_string();
    let param = request["params"][0].as_str().unwrap_or_default().to_string();
    let mut state = state.lock().unwrap();
    state.requests.push(method.clone());
    if state.silent && method != "server.version" {
        return None;
    }

    let result = match method.as_str() {
        "server.version" => json!(["mock-electrum 1.0", "1.4"]),
        "server.ping" => Value::Null,
        "blockchain.scripthash.subscribe" => {
            *state.subscribe_calls.entry(param.clone()).or_default() += 1;
            state.status(&param)
        }
        "blockchain.scripthash.get_history" => {
            let entries = state.history.get(&param).cloned().unwrap_or_default();
            Value::Array(
                entries
                    .into_iter()
                    .map(|(tx_hash, height)| json!({ "tx_hash": tx_hash, "height": height }))
                    .collect(),
            )
        }
        "blockchain.scripthash.listunspent" => {
            let entries = state.unspent.get(&param).cloned().unwrap_or_default();
            Value::Array(
                entries
                    .into_iter()
                    .map(|(tx_hash, tx_pos, height, value)| {
                        json!({ "tx_hash": tx_hash, "tx_pos": tx_pos, "height": height, "value": value })
                    })
                    .collect(),
            )
        }
        "blockchain.transaction.get" => match state.transactions.get(&param) {
            Some(hex) => Value::String(hex.clone()),
            None => {
                return Some(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": { "code": 2, "message": "transaction not found" },
                }))
            }
        },
        other => {
            return Some(json!({
                "jsonrpc": "2.0",
                "id": id,
                "error": { "code": -32601, "message": format!("unknown method {}", other) },
            }))
        }
    };
    Some(json!({ "jsonrpc": "2.0", "id": id, "result": result }))
}

/// Account key `m/84'/1'/0'` of the test mnemonic
pub fn account_xpriv() -> Xpriv {
    let mnemonic = bip39::Mnemonic::parse(TEST_MNEMONIC).unwrap();
    let seed = mnemonic.to_seed("");
    let secp = Secp256k1::new();
    let master = Xpriv::new_master(Network::Regtest, &seed).unwrap();
    master
        .derive_priv(&secp, &DerivationPath::from_str("m/84'/1'/0'").unwrap())
        .unwrap()
}

/// Account key re-encoded with the `vpub` version
pub fn account_vpub() -> String {
    let xpub = Xpub::from_priv(&Secp256k1::new(), &account_xpriv());
    let mut data = xpub.encode().to_vec();
    data[..4].copy_from_slice(&[0x04, 0x5f, 0x1c, 0xf6]);
    bitcoin::base58::encode_check(&data)
}

/// Signing key for `change/index` under the test account
pub fn child_key(change: u32, index: u32) -> bitcoin::PrivateKey {
    account_xpriv()
        .derive_priv(
            &Secp256k1::new(),
            &[ChildNumber::Normal { index: change }, ChildNumber::Normal { index }],
        )
        .unwrap()
        .to_priv()
}
