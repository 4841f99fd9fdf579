//! Transport client for JSON-RPC 2.0 requests to the CAD peer.
//!
//! [`TransportClient`] owns one TCP connection to one peer. Any number of
//! callers can issue [`send_command`](TransportClient::send_command)
//! concurrently on clones of the same client: each request gets its own id
//! and its own completion handle in the pending request table, and a single
//! reader task routes responses back by id, in whatever order they arrive.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::{BridgeConfig, PeerAddress};
use crate::error::BridgeError;
use crate::ipc::framing::{write_message, FrameDecoder, Framing};
use crate::protocol::{generate_request_id, JsonRpcRequest, JsonRpcResponse};

/// Size of a single socket read.
const READ_CHUNK_SIZE: usize = 8 * 1024;

/// Connection state of a [`TransportClient`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type Completion = Result<Value, BridgeError>;
type SharedWriter = Arc<tokio::sync::Mutex<OwnedWriteHalf>>;

/// Socket tasks of the current connection attempt.
///
/// `generation` is bumped on every connect and disconnect so a task that
/// finishes after being superseded leaves the client alone.
#[derive(Default)]
struct Link {
    generation: u64,
    writer: Option<SharedWriter>,
    connect_task: Option<JoinHandle<()>>,
    reader_task: Option<JoinHandle<()>>,
    last_error: Option<String>,
}

struct Inner {
    peer: PeerAddress,
    framing: Framing,
    connect_timeout: Duration,
    request_timeout: Duration,
    state: watch::Sender<ConnectionState>,
    link: Mutex<Link>,
    /// Request id -> completion handle.
    pending: Mutex<HashMap<String, oneshot::Sender<Completion>>>,
}

/// Client for one peer over one TCP connection.
///
/// Cloning is cheap and every clone shares the same socket and pending
/// request table.
///
/// # Connection Lifecycle
///
/// - `connect()` - Start connecting in the background (non-blocking)
/// - `wait_connected()` - Wait for the in-progress attempt to settle
/// - `send_command()` - Send a request and wait for its response
/// - `disconnect()` - Close the socket
///
/// Prefer [`with_connection`](crate::ipc::with_connection), which pairs
/// every connect with a disconnect.
///
/// # Example
///
/// ```ignore
/// use cadbridge::{BridgeConfig, ipc::TransportClient};
/// use serde_json::json;
///
/// let client = TransportClient::new(&BridgeConfig::default());
/// client.connect();
/// client.wait_connected().await?;
/// let info = client.send_command("get_current_view_info", json!({})).await?;
/// client.disconnect();
/// ```
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for TransportClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportClient")
            .field("peer", &self.inner.peer)
            .field("framing", &self.inner.framing)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .finish()
    }
}

/// Lock a std mutex, recovering the data if a holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl TransportClient {
    /// Create a disconnected client for the configured peer.
    pub fn new(config: &BridgeConfig) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                peer: config.peer.clone(),
                framing: config.framing,
                connect_timeout: config.connect_timeout,
                request_timeout: config.request_timeout,
                state,
                link: Mutex::new(Link::default()),
                pending: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.inner.peer
    }

    pub fn framing(&self) -> Framing {
        self.inner.framing
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch connection state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock(&self.inner.pending).len()
    }

    /// Start connecting to the peer in the background.
    ///
    /// Returns immediately. No-op while `Connecting` or `Connected`.
    /// Completion is observed through [`subscribe`](Self::subscribe) or
    /// [`wait_connected`](Self::wait_connected).
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn connect(&self) {
        let mut link = lock(&self.inner.link);
        if self.state() != ConnectionState::Disconnected {
            return;
        }

        link.generation += 1;
        link.last_error = None;
        let generation = link.generation;
        self.inner.state.send_replace(ConnectionState::Connecting);
        debug!("Connecting to {} ({} framing)", self.inner.peer, self.inner.framing);

        let inner = Arc::clone(&self.inner);
        link.connect_task = Some(tokio::spawn(async move {
            let result =
                TcpStream::connect((inner.peer.host.as_str(), inner.peer.port)).await;
            Inner::finish_connect(&inner, generation, result);
        }));
    }

    /// Wait until the current connection attempt settles.
    ///
    /// Returns `Ok` once `Connected`, or `ConnectionFailed` if the client is
    /// (or falls back to) `Disconnected`. Callers bound the wait themselves;
    /// see [`connect_and_wait`](Self::connect_and_wait).
    pub async fn wait_connected(&self) -> Result<(), BridgeError> {
        let mut rx = self.subscribe();
        loop {
            let state = *rx.borrow_and_update();
            match state {
                ConnectionState::Connected => return Ok(()),
                ConnectionState::Disconnected => return Err(self.connect_error()),
                ConnectionState::Connecting => {
                    if rx.changed().await.is_err() {
                        return Err(self.connect_error());
                    }
                }
            }
        }
    }

    /// Connect if needed and wait up to `ceiling` for the outcome.
    pub async fn connect_and_wait(&self, ceiling: Duration) -> Result<(), BridgeError> {
        if self.is_connected() {
            return Ok(());
        }
        self.connect();
        match timeout(ceiling, self.wait_connected()).await {
            Ok(result) => result,
            Err(_) => Err(BridgeError::ConnectionFailed {
                peer: self.inner.peer.clone(),
                reason: format!("timed out after {:?}", ceiling),
            }),
        }
    }

    /// Close the socket and mark the client `Disconnected`.
    ///
    /// Idempotent. Pending requests are left in place and resolve through
    /// their own timeout.
    pub fn disconnect(&self) {
        let mut link = lock(&self.inner.link);
        link.generation += 1;
        if let Some(task) = link.connect_task.take() {
            task.abort();
        }
        if let Some(task) = link.reader_task.take() {
            task.abort();
        }
        // Dropping the last writer handle shuts down the write side
        let had_socket = link.writer.take().is_some();
        let previous = self.inner.state.send_replace(ConnectionState::Disconnected);
        drop(link);

        if had_socket || previous != ConnectionState::Disconnected {
            info!("Disconnected from {}", self.inner.peer);
        }
    }

    /// Send a command to the peer and wait for its response.
    ///
    /// A `null` params value is sent as `{}`. If the client is not
    /// connected, a connection is attempted first and awaited for at most
    /// the configured connect timeout; failing that, the call returns
    /// `NotConnected` without sending anything.
    ///
    /// # Errors
    ///
    /// - `InvalidCommand` for an empty command name
    /// - `NotConnected` if no connection could be made ready
    /// - `Remote` if the peer answered with an error
    /// - `Timeout` if no response arrived within the request timeout
    /// - `Io` if writing to the socket failed
    ///
    /// # Example
    ///
    /// ```ignore
    /// let elements = client
    ///     .send_command("get_selected_elements", json!({"limit": 100}))
    ///     .await?;
    /// ```
    pub async fn send_command(&self, command: &str, params: Value) -> Result<Value, BridgeError> {
        if command.is_empty() {
            return Err(BridgeError::InvalidCommand);
        }

        if !self.is_connected() {
            if let Err(e) = self.connect_and_wait(self.inner.connect_timeout).await {
                debug!("Cannot send {}: {}", command, e);
                return Err(BridgeError::NotConnected {
                    peer: self.inner.peer.clone(),
                });
            }
        }

        let params = if params.is_null() {
            Value::Object(Default::default())
        } else {
            params
        };

        let (id, rx) = self.inner.register();
        // Removes the entry on every early exit, including the caller
        // dropping this future
        let _entry = PendingEntry {
            inner: &self.inner,
            id: &id,
        };

        let request = JsonRpcRequest::new(command, params, id.clone());
        let body = serde_json::to_string(&request)
            .map_err(|e| BridgeError::Protocol(format!("Failed to serialize request: {}", e)))?;

        debug!(id = %id, "-> {}", command);
        self.inner.write(&body).await?;

        match timeout(self.inner.request_timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(BridgeError::Protocol(format!(
                "Response channel for {} closed",
                command
            ))),
            Err(_) => {
                warn!(id = %id, "{} timed out after {:?}", command, self.inner.request_timeout);
                Err(BridgeError::Timeout {
                    command: command.to_string(),
                    timeout: self.inner.request_timeout,
                })
            }
        }
    }

    /// Send a command with empty params.
    pub async fn send_command_default(&self, command: &str) -> Result<Value, BridgeError> {
        self.send_command(command, Value::Null).await
    }

    fn connect_error(&self) -> BridgeError {
        let reason = lock(&self.inner.link)
            .last_error
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        BridgeError::ConnectionFailed {
            peer: self.inner.peer.clone(),
            reason,
        }
    }
}

/// Guard removing a pending entry when a request finishes.
struct PendingEntry<'a> {
    inner: &'a Inner,
    id: &'a str,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.inner.remove_pending(self.id);
    }
}

impl Inner {
    /// Register a completion handle under a fresh id.
    ///
    /// An id already pending is never reused; a new one is drawn instead.
    fn register(&self) -> (String, oneshot::Receiver<Completion>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = lock(&self.pending);
        let mut id = generate_request_id();
        while pending.contains_key(&id) {
            id = generate_request_id();
        }
        pending.insert(id.clone(), tx);
        (id, rx)
    }

    /// Remove a pending entry. Removing a missing entry is a no-op.
    fn remove_pending(&self, id: &str) -> Option<oneshot::Sender<Completion>> {
        lock(&self.pending).remove(id)
    }

    /// Route an inbound message to its waiting caller.
    fn dispatch(&self, message: Value) {
        if !message.is_object() {
            warn!("Ignoring non-object message from {}", self.peer);
            return;
        }
        let response: JsonRpcResponse = match serde_json::from_value(message) {
            Ok(response) => response,
            Err(e) => {
                warn!("Ignoring message that is not a response: {}", e);
                return;
            }
        };

        let Some(id) = response.id_key() else {
            debug!("Ignoring response without a usable id");
            return;
        };

        match self.remove_pending(&id) {
            Some(tx) => {
                debug!(id = %id, "<- response");
                // The caller may have given up already
                let _ = tx.send(response.into_result());
            }
            None => debug!(id = %id, "No pending request for response"),
        }
    }

    async fn write(&self, body: &str) -> Result<(), BridgeError> {
        let writer = lock(&self.link)
            .writer
            .clone()
            .ok_or_else(|| BridgeError::NotConnected {
                peer: self.peer.clone(),
            })?;
        let mut writer = writer.lock().await;
        write_message(&mut *writer, self.framing, body).await?;
        Ok(())
    }

    fn finish_connect(this: &Arc<Self>, generation: u64, result: std::io::Result<TcpStream>) {
        let mut link = lock(&this.link);
        if link.generation != generation {
            // Superseded by disconnect(); dropping the stream closes it
            return;
        }
        link.connect_task = None;

        match result {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("Failed to set TCP_NODELAY: {}", e);
                }
                let (read_half, write_half) = stream.into_split();
                link.writer = Some(Arc::new(tokio::sync::Mutex::new(write_half)));
                link.reader_task = Some(tokio::spawn(read_loop(
                    Arc::downgrade(this),
                    read_half,
                    this.framing,
                    generation,
                )));
                this.state.send_replace(ConnectionState::Connected);
                info!("Connected to {}", this.peer);
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", this.peer, e);
                link.last_error = Some(e.to_string());
                this.state.send_replace(ConnectionState::Disconnected);
            }
        }
    }

    /// Called by the reader when the socket closes or errors.
    fn connection_lost(&self, generation: u64) {
        let mut link = lock(&self.link);
        if link.generation != generation {
            return;
        }
        link.writer = None;
        link.reader_task = None;
        self.state.send_replace(ConnectionState::Disconnected);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        let link = self.link.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Some(task) = link.connect_task.take() {
            task.abort();
        }
        if let Some(task) = link.reader_task.take() {
            task.abort();
        }
    }
}

/// Read chunks from the socket, decode messages, dispatch them by id.
///
/// Holds only a weak reference so an abandoned client is not kept alive by
/// its own reader.
async fn read_loop(inner: Weak<Inner>, mut reader: OwnedReadHalf, framing: Framing, generation: u64) {
    let mut decoder = FrameDecoder::new(framing);
    let mut chunk = vec![0u8; READ_CHUNK_SIZE];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                info!("Peer closed the connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!("Socket read failed: {}", e);
                break;
            }
        };

        let Some(inner) = inner.upgrade() else {
            return;
        };

        decoder.extend(&chunk[..n]);
        loop {
            match decoder.next_message() {
                Ok(Some(message)) => inner.dispatch(message),
                Ok(None) => break,
                Err(e) => warn!("Dropping undecodable bytes: {:#}", e),
            }
        }
    }

    if decoder.buffered() > 0 {
        debug!("Discarding {} buffered bytes", decoder.buffered());
    }
    if let Some(inner) = inner.upgrade() {
        inner.connection_lost(generation);
    }
}
