//! Reconnecting Electrum client
//!
//! One long-lived connection per process. The composition root builds a
//! `NodeClient` once and hands out clones; every clone shares the same
//! session, subscription registry and event channel.

use async_trait::async_trait;
use bitcoin::Script;
use futures::future::BoxFuture;
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, RwLock};
use tokio::task::JoinHandle;

use super::protocol::{
    HistoryEntry, Incoming, Request, UnspentEntry, METHOD_GET_HISTORY, METHOD_GET_TRANSACTION,
    METHOD_LIST_UNSPENT, METHOD_PING, METHOD_SUBSCRIBE, METHOD_VERSION,
};
use super::transport;
use crate::config::ElectrumConfig;
use crate::derivation::script_hash;
use crate::error::WalletError;
use crate::wallet::context::ChainSource;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectPending,
}

/// Events published to every dependent of the connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Connected,
    Disconnected,
    /// Session re-established and subscriptions replayed
    Reconnected,
    ScriptHashChanged {
        script_hash: String,
        status: Option<String>,
    },
}

type PendingMap = HashMap<u64, oneshot::Sender<Result<Value, WalletError>>>;

const EVENT_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct NodeClient {
    inner: Arc<Inner>,
}

struct Inner {
    config: ElectrumConfig,
    state: RwLock<ConnectionState>,
    /// Set only after a completed handshake, cleared by the reader on close
    healthy: AtomicBool,
    shutting_down: AtomicBool,
    next_id: AtomicU64,
    /// Incremented per session so stale readers can't tear down a newer one
    generation: AtomicU64,
    writer: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<PendingMap>,
    subscriptions: Mutex<BTreeSet<String>>,
    session_tasks: Mutex<Vec<JoinHandle<()>>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    connect_lock: Mutex<()>,
    events: broadcast::Sender<NodeEvent>,
}

impl NodeClient {
    pub fn new(config: ElectrumConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                config,
                state: RwLock::new(ConnectionState::Disconnected),
                healthy: AtomicBool::new(false),
                shutting_down: AtomicBool::new(false),
                next_id: AtomicU64::new(1),
                generation: AtomicU64::new(0),
                writer: Mutex::new(None),
                pending: Mutex::new(HashMap::new()),
                subscriptions: Mutex::new(BTreeSet::new()),
                session_tasks: Mutex::new(Vec::new()),
                reconnect_task: Mutex::new(None),
                connect_lock: Mutex::new(()),
                events,
            }),
        }
    }

    /// Open the session if it isn't already up
    pub async fn connect(&self) -> Result<(), WalletError> {
        if self.inner.healthy.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutting_down.store(false, Ordering::SeqCst);
        let opened = Inner::ensure_session(&self.inner).await?;
        if opened {
            let _ = self.inner.events.send(NodeEvent::Connected);
        }
        Ok(())
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub fn is_connected(&self) -> bool {
        self.inner.healthy.load(Ordering::SeqCst)
    }

    /// New receiver for connection and subscription events
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.inner.events.subscribe()
    }

    pub async fn ping(&self) -> Result<(), WalletError> {
        self.request(METHOD_PING, vec![]).await.map(|_| ())
    }

    pub async fn history(&self, script_hash: &str) -> Result<Vec<HistoryEntry>, WalletError> {
        let value = self.request(METHOD_GET_HISTORY, vec![json!(script_hash)]).await?;
        decode(METHOD_GET_HISTORY, value)
    }

    pub async fn unspent(&self, script_hash: &str) -> Result<Vec<UnspentEntry>, WalletError> {
        let value = self.request(METHOD_LIST_UNSPENT, vec![json!(script_hash)]).await?;
        decode(METHOD_LIST_UNSPENT, value)
    }

    /// Raw transaction hex
    pub async fn transaction(&self, txid: &str) -> Result<String, WalletError> {
        let value = self
            .request(METHOD_GET_TRANSACTION, vec![json!(txid), json!(false)])
            .await?;
        decode(METHOD_GET_TRANSACTION, value)
    }

    /// Subscribe to status changes of a script hash
    ///
    /// The script hash stays in the registry even if the call fails, so it
    /// is picked up by the next session.
    pub async fn subscribe_script_hash(&self, script_hash: &str) -> Result<Option<String>, WalletError> {
        self.inner
            .subscriptions
            .lock()
            .await
            .insert(script_hash.to_string());
        let value = self.request(METHOD_SUBSCRIBE, vec![json!(script_hash)]).await?;
        decode(METHOD_SUBSCRIBE, value)
    }

    /// Enter the reconnect loop, e.g. after a failed first `connect`
    pub async fn schedule_reconnect(&self) {
        if !self.inner.shutting_down.load(Ordering::SeqCst) {
            Inner::schedule_reconnect(&self.inner).await;
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.inner.subscriptions.lock().await.len()
    }

    /// Close the session for good; no reconnect is scheduled afterwards
    pub async fn shutdown(&self) {
        log::info!("Shutting down Electrum client");
        self.inner.shutting_down.store(true, Ordering::SeqCst);
        if let Some(handle) = self.inner.reconnect_task.lock().await.take() {
            handle.abort();
        }
        self.inner.teardown_session().await;
        *self.inner.state.write().await = ConnectionState::Disconnected;
    }

    async fn request(&self, method: &str, params: Vec<Value>) -> Result<Value, WalletError> {
        if !self.inner.healthy.load(Ordering::SeqCst) {
            if !self.inner.shutting_down.load(Ordering::SeqCst) {
                Inner::schedule_reconnect(&self.inner).await;
            }
            return Err(WalletError::Network(format!(
                "not connected to {}",
                self.inner.config.endpoint()
            )));
        }
        self.inner.send_request(method, params).await
    }
}

impl Inner {
    /// Returns true when this call opened a new session
    ///
    /// Boxed: the reconnect task spawned from a closing session calls back
    /// into here.
    fn ensure_session(self: &Arc<Self>) -> BoxFuture<'_, Result<bool, WalletError>> {
        Box::pin(async move {
            let _guard = self.connect_lock.lock().await;
            if self.healthy.load(Ordering::SeqCst) {
                return Ok(false);
            }
            self.open_session().await?;
            Ok(true)
        })
    }

    async fn open_session(self: &Arc<Self>) -> Result<(), WalletError> {
        *self.state.write().await = ConnectionState::Connecting;
        self.teardown_session().await;

        let stream = match transport::open(&self.config).await {
            Ok(stream) => stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        };
        let (read_half, mut write_half) = tokio::io::split(stream);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.writer.lock().await = Some(tx);

        let writer_task = tokio::spawn(async move {
            while let Some(line) = rx.recv().await {
                if let Err(e) = write_half.write_all(line.as_bytes()).await {
                    log::warn!("Electrum write failed: {}", e);
                    break;
                }
                if write_half.flush().await.is_err() {
                    break;
                }
            }
        });

        let inner = Arc::clone(self);
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => inner.dispatch(&line).await,
                    Ok(None) => break,
                    Err(e) => {
                        log::warn!("Electrum read failed: {}", e);
                        break;
                    }
                }
            }
            inner.on_closed(generation).await;
        });

        self.session_tasks
            .lock()
            .await
            .extend([writer_task, reader_task]);

        let handshake = self
            .send_request(
                METHOD_VERSION,
                vec![
                    json!(self.config.client_name),
                    json!(self.config.protocol_version),
                ],
            )
            .await;
        match handshake {
            Ok(server) => log::info!("Connected to Electrum {} ({})", self.config.endpoint(), server),
            Err(e) => {
                self.teardown_session().await;
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e);
            }
        }

        self.healthy.store(true, Ordering::SeqCst);
        *self.state.write().await = ConnectionState::Connected;
        self.replay_subscriptions().await;
        Ok(())
    }

    async fn replay_subscriptions(self: &Arc<Self>) {
        let registry: Vec<String> = self.subscriptions.lock().await.iter().cloned().collect();
        if registry.is_empty() {
            return;
        }
        log::debug!("Replaying {} subscriptions", registry.len());
        for script_hash in registry {
            if let Err(e) = self
                .send_request(METHOD_SUBSCRIBE, vec![json!(script_hash)])
                .await
            {
                log::warn!("Failed to resubscribe {}: {}", script_hash, e);
            }
        }
    }

    async fn send_request(self: &Arc<Self>, method: &str, params: Vec<Value>) -> Result<Value, WalletError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let line = Request::new(id, method, params)
            .to_line()
            .map_err(|e| WalletError::Internal(e.to_string()))?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let sent = match self.writer.lock().await.as_ref() {
            Some(writer) => writer.send(line).is_ok(),
            None => false,
        };
        if !sent {
            self.pending.lock().await.remove(&id);
            return Err(WalletError::Network("connection closed".to_string()));
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(WalletError::Network("connection closed".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                self.on_timeout(method).await;
                Err(WalletError::Network(format!("{} timed out", method)))
            }
        }
    }

    /// A live session that stops answering is treated as lost
    ///
    /// Handshake timeouts are left to `open_session`, which tears down its
    /// own half-open session.
    async fn on_timeout(self: &Arc<Self>, method: &str) {
        if !self.healthy.swap(false, Ordering::SeqCst) {
            return;
        }
        log::warn!(
            "{} to {} timed out, dropping the session",
            method,
            self.config.endpoint()
        );
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.teardown_session().await;
        if self.shutting_down.load(Ordering::SeqCst) {
            return;
        }
        let _ = self.events.send(NodeEvent::Disconnected);
        Inner::schedule_reconnect(self).await;
    }

    async fn dispatch(&self, line: &str) {
        let message = match Incoming::parse(line) {
            Ok(message) => message,
            Err(e) => {
                log::warn!("Ignoring malformed Electrum message: {}", e);
                return;
            }
        };

        match message {
            Incoming::Response { id, result } => {
                if let Some(waiter) = self.pending.lock().await.remove(&id) {
                    let _ = waiter.send(result.map_err(WalletError::Network));
                } else {
                    log::debug!("Response for unknown request id {}", id);
                }
            }
            Incoming::ScriptHashNotification { script_hash, status } => {
                log::debug!("Script hash {} changed", script_hash);
                let _ = self
                    .events
                    .send(NodeEvent::ScriptHashChanged { script_hash, status });
            }
            Incoming::Other => {}
        }
    }

    async fn on_closed(self: &Arc<Self>, generation: u64) {
        if self.generation.load(Ordering::SeqCst) != generation {
            return;
        }
        let was_healthy = self.healthy.swap(false, Ordering::SeqCst);
        *self.writer.lock().await = None;
        self.fail_pending("connection closed").await;

        if self.shutting_down.load(Ordering::SeqCst) {
            *self.state.write().await = ConnectionState::Disconnected;
            return;
        }
        if was_healthy {
            log::warn!("Electrum connection to {} lost", self.config.endpoint());
            let _ = self.events.send(NodeEvent::Disconnected);
        }
        Inner::schedule_reconnect(self).await;
    }

    /// At most one reconnect task exists; later triggers join it
    async fn schedule_reconnect(self: &Arc<Self>) {
        let mut slot = self.reconnect_task.lock().await;
        if let Some(handle) = slot.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }

        *self.state.write().await = ConnectionState::ReconnectPending;
        let delay = self.config.reconnect_delay;
        log::info!("Reconnecting to {} in {:?}", self.config.endpoint(), delay);

        let inner = Arc::clone(self);
        *slot = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(delay).await;
                if inner.shutting_down.load(Ordering::SeqCst) {
                    break;
                }
                match Inner::ensure_session(&inner).await {
                    // replay timed out on the fresh session
                    Ok(_) if !inner.healthy.load(Ordering::SeqCst) => {
                        log::warn!("Session to {} dropped during replay", inner.config.endpoint());
                        *inner.state.write().await = ConnectionState::ReconnectPending;
                    }
                    Ok(_) => {
                        log::info!("Reconnected to {}", inner.config.endpoint());
                        let _ = inner.events.send(NodeEvent::Reconnected);
                        break;
                    }
                    Err(e) => {
                        log::warn!("Reconnect failed: {}", e);
                        *inner.state.write().await = ConnectionState::ReconnectPending;
                    }
                }
            }
        }));
    }

    async fn teardown_session(&self) {
        self.healthy.store(false, Ordering::SeqCst);
        *self.writer.lock().await = None;
        for handle in self.session_tasks.lock().await.drain(..) {
            handle.abort();
        }
        self.fail_pending("session closed").await;
    }

    async fn fail_pending(&self, reason: &str) {
        let pending: Vec<_> = self.pending.lock().await.drain().collect();
        for (_, waiter) in pending {
            let _ = waiter.send(Err(WalletError::Network(reason.to_string())));
        }
    }
}

fn decode<T: serde::de::DeserializeOwned>(method: &str, value: Value) -> Result<T, WalletError> {
    serde_json::from_value(value)
        .map_err(|e| WalletError::Network(format!("unexpected {} response: {}", method, e)))
}

#[async_trait]
impl ChainSource for NodeClient {
    async fn get_history(&self, script: &Script) -> Result<Vec<HistoryEntry>, WalletError> {
        self.history(&script_hash(script)).await
    }

    async fn list_unspent(&self, script: &Script) -> Result<Vec<UnspentEntry>, WalletError> {
        self.unspent(&script_hash(script)).await
    }

    async fn get_raw_transaction(&self, txid: &str) -> Result<String, WalletError> {
        self.transaction(txid).await
    }

    async fn subscribe(&self, script_hash: &str) -> Result<Option<String>, WalletError> {
        self.subscribe_script_hash(script_hash).await
    }
}
