//! The sync state machine layered over one log and one connection.
//!
//! A node performs the handshake (protocol check, authentication, time
//! offset estimation), streams backlog and live log entries to its peer,
//! keeps the session alive with pings, and maps protocol violations to the
//! error taxonomy. [`ClientNode`] initiates the handshake,
//! [`ServerNode`] answers it; everything else is shared.

pub(crate) mod client;
pub(crate) mod server;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use actionsync_log::{
    Log, LogError, NewMeta, Order, StoreError, Subscription, SyncedUpdate, TimeSource,
};
use actionsync_types::{
    Action, ActionId, ConnectExtras, DecodeError, ErrorKind, Frame, Message, Meta,
    ProtocolVersion, SyncError,
};

use crate::config::ConfigError;
use crate::connection::{Connection, ConnectionError, ConnectionEvent, DisconnectReason};
use crate::options::{AuthError, NodeOptions};

const EVENT_CAPACITY: usize = 256;

/// Failed handshake attempts tolerated before answering `bruteforce`.
const BRUTEFORCE_THRESHOLD: u32 = 3;

/// Externally visible synchronization state of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    /// No connection.
    Disconnected,
    /// Connecting or handshaking.
    Connecting,
    /// Authenticated with `sync` messages awaiting acknowledgement.
    Sending,
    /// Authenticated and fully caught up.
    Synchronized,
}

/// An error surfaced through [`NodeEvent::Error`].
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    /// A protocol error, local or reported by the peer.
    #[error(transparent)]
    Sync(#[from] SyncError),
    /// An unexpected local failure while handling a message.
    #[error("internal failure while handling `{context}`: {message}")]
    Internal {
        /// The tag of the message being handled.
        context: String,
        /// Description of the failure.
        message: String,
    },
}

/// Events emitted by a node.
#[derive(Debug, Clone)]
pub enum NodeEvent {
    /// The underlying connection started connecting.
    Connecting,
    /// The underlying connection is up; the handshake follows.
    Connect,
    /// The session ended.
    Disconnect(Option<DisconnectReason>),
    /// The synchronization state changed.
    State(NodeState),
    /// A local error or a non-terminal error reported by the peer.
    Error(NodeError),
    /// The peer rejected this node's handshake permanently.
    ClientError(SyncError),
    /// All in-flight `sync` messages were acknowledged.
    Synced {
        /// Highest local `added` acknowledged by the peer.
        sent: u64,
        /// Highest remote `added` processed locally.
        received: u64,
    },
    /// A `debug` message arrived from the peer.
    Debug {
        /// The debug record discriminator.
        kind: String,
        /// Arbitrary payload.
        data: Value,
    },
}

/// Which side of the handshake this node plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NodeRole {
    /// Sends `connect` as soon as the transport is up.
    Client,
    /// Waits for `connect` and answers `connected`.
    Server,
}

#[derive(Debug, Clone, Copy)]
enum Heartbeat {
    /// No ping scheduled (heartbeat disabled or not authenticated).
    Idle,
    /// Send a ping at the given instant unless other traffic goes out.
    PingDue(Instant),
    /// A ping is out; disconnect if no pong arrives by the given instant.
    AwaitPong(Instant),
}

struct NodeInner {
    connected: bool,
    connecting: bool,
    authenticated: bool,
    syncing: u32,
    auth_failures: u32,
    remote_node_id: Option<String>,
    remote_protocol: Option<ProtocolVersion>,
    remote_subprotocol: Option<String>,
    time_fix: i64,
    last_sent: u64,
    last_received: u64,
    /// Ids that arrived from the peer and must not be echoed back.
    received_ids: HashSet<ActionId>,
    connect_sent_at: Option<i64>,
    heartbeat: Heartbeat,
    last_state: NodeState,
}

impl Default for NodeInner {
    fn default() -> Self {
        Self {
            connected: false,
            connecting: false,
            authenticated: false,
            syncing: 0,
            auth_failures: 0,
            remote_node_id: None,
            remote_protocol: None,
            remote_subprotocol: None,
            time_fix: 0,
            last_sent: 0,
            last_received: 0,
            received_ids: HashSet::new(),
            connect_sent_at: None,
            heartbeat: Heartbeat::Idle,
            last_state: NodeState::Disconnected,
        }
    }
}

#[derive(Debug, Error)]
enum HandleError {
    #[error(transparent)]
    Log(#[from] LogError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Auth(#[from] AuthError),
}

struct NodeShared {
    role: NodeRole,
    log: Log,
    connection: Arc<dyn Connection>,
    options: NodeOptions,
    time: TimeSource,
    inner: Mutex<NodeInner>,
    events: broadcast::Sender<NodeEvent>,
    destroyed: AtomicBool,
}

/// The sync state machine shared by [`ClientNode`] and [`ServerNode`].
pub struct BaseNode {
    shared: Arc<NodeShared>,
    driver: Mutex<Option<JoinHandle<()>>>,
    log_sub: Mutex<Option<Subscription>>,
}

pub use client::ClientNode;
pub use server::ServerNode;

impl BaseNode {
    pub(crate) fn start(
        role: NodeRole,
        log: Log,
        connection: Arc<dyn Connection>,
        options: NodeOptions,
    ) -> Result<Self, ConfigError> {
        options.config.validate()?;
        let time = options.time.clone().unwrap_or_else(|| log.time_source());
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(NodeShared {
            role,
            log: log.clone(),
            connection,
            options,
            time,
            inner: Mutex::new(NodeInner::default()),
            events,
            destroyed: AtomicBool::new(false),
        });

        let (add_tx, add_rx) = mpsc::unbounded_channel();
        let log_sub = log.on_add(move |action, meta| {
            let _ = add_tx.send((action.clone(), meta.clone()));
        });

        // Subscribe before the driver spawns so no event can slip past.
        let conn_events = shared.connection.events();
        let driver = tokio::spawn(drive(shared.clone(), conn_events, add_rx));

        Ok(Self {
            shared,
            driver: Mutex::new(Some(driver)),
            log_sub: Mutex::new(Some(log_sub)),
        })
    }

    /// Establish the underlying connection.
    pub async fn connect(&self) -> Result<(), ConnectionError> {
        self.shared.connection.connect().await
    }

    /// Close the current session without destroying the node.
    pub fn disconnect(&self) {
        self.shared.connection.disconnect(None);
    }

    /// Subscribe to node events.
    pub fn events(&self) -> broadcast::Receiver<NodeEvent> {
        self.shared.events.subscribe()
    }

    /// The current synchronization state.
    pub fn state(&self) -> NodeState {
        current_state(&self.shared.inner.lock().unwrap())
    }

    /// Whether the underlying connection is established.
    pub fn connected(&self) -> bool {
        self.shared.inner.lock().unwrap().connected
    }

    /// Whether the handshake completed.
    pub fn authenticated(&self) -> bool {
        self.shared.inner.lock().unwrap().authenticated
    }

    /// The number of `sync` messages awaiting acknowledgement.
    pub fn syncing(&self) -> u32 {
        self.shared.inner.lock().unwrap().syncing
    }

    /// The peer's node id, learned during the handshake.
    pub fn remote_node_id(&self) -> Option<String> {
        self.shared.inner.lock().unwrap().remote_node_id.clone()
    }

    /// The peer's protocol version, learned during the handshake.
    pub fn remote_protocol(&self) -> Option<ProtocolVersion> {
        self.shared.inner.lock().unwrap().remote_protocol
    }

    /// The peer's application subprotocol, when it announced one.
    pub fn remote_subprotocol(&self) -> Option<String> {
        self.shared.inner.lock().unwrap().remote_subprotocol.clone()
    }

    /// Milliseconds added to remote `meta.time` values to put them on the
    /// local clock. Zero when `fix_time` is off or before the handshake.
    pub fn time_fix(&self) -> i64 {
        self.shared.inner.lock().unwrap().time_fix
    }

    /// The log this node synchronizes.
    pub fn log(&self) -> &Log {
        &self.shared.log
    }

    /// The connection this node speaks over.
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.shared.connection
    }

    /// Whether the node reached its terminal state.
    pub fn destroyed(&self) -> bool {
        self.shared.destroyed.load(AtomicOrdering::SeqCst)
    }

    /// Send a free-form `debug` message to the peer. Peers surface it via
    /// [`NodeEvent::Debug`] without interpreting it.
    pub fn send_debug(&self, kind: impl Into<String>, data: Value) {
        self.shared.send(Message::Debug {
            kind: kind.into(),
            data,
        });
    }

    /// Tear the node down: unbind the log and connection listeners, abandon
    /// in-flight syncs and disconnect the transport. Terminal.
    pub fn destroy(&self) {
        if self.shared.destroyed.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        if let Some(handle) = self.driver.lock().unwrap().take() {
            handle.abort();
        }
        self.log_sub.lock().unwrap().take();
        {
            let mut inner = self.shared.inner.lock().unwrap();
            inner.connected = false;
            inner.connecting = false;
            inner.authenticated = false;
            inner.syncing = 0;
            inner.heartbeat = Heartbeat::Idle;
            inner.received_ids.clear();
        }
        self.shared.connection.disconnect(Some(DisconnectReason::Destroy));
    }
}

impl Drop for BaseNode {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn current_state(inner: &NodeInner) -> NodeState {
    if inner.connected && inner.authenticated {
        if inner.syncing > 0 {
            NodeState::Sending
        } else {
            NodeState::Synchronized
        }
    } else if inner.connecting || inner.connected {
        NodeState::Connecting
    } else {
        NodeState::Disconnected
    }
}

async fn drive(
    shared: Arc<NodeShared>,
    mut conn_events: broadcast::Receiver<ConnectionEvent>,
    mut add_rx: mpsc::UnboundedReceiver<(Action, Meta)>,
) {
    let mut log_open = true;
    loop {
        let deadline = shared.heartbeat_deadline();
        let heartbeat = async {
            match deadline {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            event = conn_events.recv() => match event {
                Ok(event) => shared.handle_connection_event(event).await,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "node lagged behind connection events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            entry = add_rx.recv(), if log_open => match entry {
                Some((action, meta)) => shared.handle_local_add(action, meta).await,
                None => log_open = false,
            },
            _ = heartbeat => shared.handle_heartbeat().await,
        }
    }
}

impl NodeShared {
    fn now(&self) -> i64 {
        (self.time)()
    }

    fn emit(&self, event: NodeEvent) {
        let _ = self.events.send(event);
    }

    fn emit_state(&self) {
        let state = {
            let mut inner = self.inner.lock().unwrap();
            let state = current_state(&inner);
            if state == inner.last_state {
                return;
            }
            inner.last_state = state;
            state
        };
        tracing::debug!(?state, "node state changed");
        self.emit(NodeEvent::State(state));
    }

    fn heartbeat_deadline(&self) -> Option<Instant> {
        match self.inner.lock().unwrap().heartbeat {
            Heartbeat::Idle => None,
            Heartbeat::PingDue(at) | Heartbeat::AwaitPong(at) => Some(at),
        }
    }

    fn send(&self, message: Message) {
        let tag = message.tag();
        if let Err(err) = self.connection.send(message.encode()) {
            tracing::warn!(%err, tag, "failed to send message");
            return;
        }
        self.bump_heartbeat();
    }

    /// Schedule the next ping `ping` ms from now. No-op while a pong is
    /// outstanding, before authentication, or with the heartbeat disabled.
    fn bump_heartbeat(&self) {
        if self.options.config.ping == 0 {
            return;
        }
        let mut inner = self.inner.lock().unwrap();
        if !inner.authenticated {
            return;
        }
        if matches!(inner.heartbeat, Heartbeat::AwaitPong(_)) {
            return;
        }
        inner.heartbeat =
            Heartbeat::PingDue(Instant::now() + Duration::from_millis(self.options.config.ping));
    }

    async fn handle_connection_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connecting => {
                self.inner.lock().unwrap().connecting = true;
                self.emit(NodeEvent::Connecting);
                self.emit_state();
            }
            ConnectionEvent::Connect => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.connected = true;
                    inner.connecting = false;
                }
                self.emit(NodeEvent::Connect);
                self.emit_state();
                if self.role == NodeRole::Client {
                    self.send_connect().await;
                }
            }
            ConnectionEvent::Message(frame) => self.handle_frame(frame).await,
            ConnectionEvent::Disconnect(reason) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    inner.connected = false;
                    inner.connecting = false;
                    inner.authenticated = false;
                    inner.syncing = 0;
                    inner.heartbeat = Heartbeat::Idle;
                    inner.received_ids.clear();
                }
                tracing::debug!(?reason, "session closed");
                self.emit(NodeEvent::Disconnect(reason));
                self.emit_state();
            }
            ConnectionEvent::Error(err) => {
                tracing::warn!(error = %err, "transport error");
            }
        }
    }

    async fn send_connect(&self) {
        let synced = match self.log.store().last_added().await {
            Ok(value) => value,
            Err(err) => {
                tracing::warn!(%err, "failed to read the last added sequence");
                0
            }
        };
        self.inner.lock().unwrap().connect_sent_at = Some(self.now());
        self.send(Message::Connect {
            protocol: ProtocolVersion::CURRENT,
            node_id: self.log.node_id().to_string(),
            synced,
            extras: ConnectExtras {
                credentials: self.options.config.effective_credentials(),
                subprotocol: self.options.config.subprotocol.clone(),
            },
        });
    }

    async fn handle_frame(&self, frame: Frame) {
        match Message::decode(&frame) {
            Ok(message) => {
                let tag = message.tag();
                if let Err(err) = self.dispatch(message).await {
                    tracing::error!(%err, tag, "internal failure while handling message");
                    self.emit(NodeEvent::Error(NodeError::Internal {
                        context: tag.to_string(),
                        message: err.to_string(),
                    }));
                    self.connection.disconnect(Some(DisconnectReason::Error));
                }
            }
            Err(DecodeError::UnknownCommand(tag)) => {
                self.report_error(ErrorKind::UnknownMessage(tag));
            }
            Err(DecodeError::Malformed(text)) => {
                self.report_error(ErrorKind::WrongFormat(text));
            }
        }
    }

    /// Send a protocol error to the peer, surface it locally and close the
    /// session. Terminal kinds forbid reconnection.
    fn report_error(&self, kind: ErrorKind) {
        tracing::warn!(error = %kind, "protocol error");
        let reason = if kind.is_terminal() {
            DisconnectReason::Protocol
        } else {
            DisconnectReason::Error
        };
        self.send(Message::Error(kind.clone()));
        self.emit(NodeEvent::Error(NodeError::Sync(SyncError::local(kind))));
        self.connection.disconnect(Some(reason));
    }

    async fn dispatch(&self, message: Message) -> Result<(), HandleError> {
        let authenticated = self.inner.lock().unwrap().authenticated;
        if !authenticated
            && !matches!(
                message,
                Message::Connect { .. }
                    | Message::Connected { .. }
                    | Message::Error(_)
                    | Message::Debug { .. }
            )
        {
            self.report_error(ErrorKind::MissedAuth(message.encode().to_string()));
            return Ok(());
        }

        match message {
            Message::Connect {
                protocol,
                node_id,
                synced,
                extras,
            } => self.handle_connect(protocol, node_id, synced, extras).await,
            Message::Connected {
                protocol,
                node_id,
                timing,
                extras,
            } => {
                self.handle_connected(protocol, node_id, timing, extras)
                    .await
            }
            Message::Ping(_) => {
                let last = self.log.store().last_added().await?;
                self.send(Message::Pong(last));
                Ok(())
            }
            Message::Pong(_) => {
                {
                    let mut inner = self.inner.lock().unwrap();
                    if matches!(inner.heartbeat, Heartbeat::AwaitPong(_)) {
                        inner.heartbeat = Heartbeat::Idle;
                    }
                }
                self.bump_heartbeat();
                Ok(())
            }
            Message::Sync { synced, entries } => self.handle_sync(synced, entries).await,
            Message::Synced(synced) => self.handle_synced(synced).await,
            Message::Error(kind) => {
                self.handle_remote_error(kind);
                Ok(())
            }
            Message::Debug { kind, data } => {
                self.emit(NodeEvent::Debug { kind, data });
                Ok(())
            }
        }
    }

    /// Responder half of the handshake.
    async fn handle_connect(
        &self,
        protocol: ProtocolVersion,
        node_id: String,
        synced: u64,
        extras: ConnectExtras,
    ) -> Result<(), HandleError> {
        let received_at = self.now();
        let local = ProtocolVersion::CURRENT;
        if !local.compatible(&protocol) {
            self.report_error(ErrorKind::WrongProtocol {
                supported: local,
                used: protocol,
            });
            return Ok(());
        }

        let accepted = self
            .options
            .auth
            .authenticate(&node_id, extras.credentials.as_ref())
            .await?;
        if !accepted {
            let failures = {
                let mut inner = self.inner.lock().unwrap();
                inner.auth_failures += 1;
                inner.auth_failures
            };
            let kind = if failures >= BRUTEFORCE_THRESHOLD {
                ErrorKind::Bruteforce
            } else {
                ErrorKind::WrongCredentials
            };
            self.report_error(kind);
            return Ok(());
        }

        if let (Some(matcher), Some(remote_sub)) =
            (&self.options.subprotocols, extras.subprotocol.as_ref())
        {
            if !matcher.matches(remote_sub) {
                self.report_error(ErrorKind::WrongSubprotocol {
                    supported: matcher.supported.clone(),
                    used: remote_sub.clone(),
                });
                return Ok(());
            }
        }

        let store = self.log.store();
        store
            .set_last_synced(&node_id, SyncedUpdate::received(synced))
            .await?;
        let cursors = store.get_last_synced(&node_id).await?;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.remote_node_id = Some(node_id.clone());
            inner.remote_protocol = Some(protocol);
            inner.remote_subprotocol = extras.subprotocol.clone();
            inner.authenticated = true;
            inner.auth_failures = 0;
            inner.last_sent = cursors.sent;
            inner.last_received = cursors.received;
        }

        self.send(Message::Connected {
            protocol: local,
            node_id: self.log.node_id().to_string(),
            timing: (received_at, self.now()),
            extras: ConnectExtras {
                credentials: None,
                subprotocol: self.options.config.subprotocol.clone(),
            },
        });
        tracing::info!(peer = %node_id, "session established");
        self.emit_state();
        self.sync_since(cursors.sent).await
    }

    /// Initiator half of the handshake.
    async fn handle_connected(
        &self,
        protocol: ProtocolVersion,
        node_id: String,
        timing: (i64, i64),
        extras: ConnectExtras,
    ) -> Result<(), HandleError> {
        let local_receive = self.now();
        let local = ProtocolVersion::CURRENT;
        if !local.compatible(&protocol) {
            self.report_error(ErrorKind::WrongProtocol {
                supported: local,
                used: protocol,
            });
            return Ok(());
        }

        // NTP-style offset estimate from our send/receive times and the
        // peer's receive/reply times.
        let time_fix = if self.options.config.fix_time {
            let local_send = self
                .inner
                .lock()
                .unwrap()
                .connect_sent_at
                .unwrap_or(local_receive);
            let round_trip = (local_receive - local_send) - (timing.1 - timing.0);
            let fix = ((local_send + local_receive) - (timing.0 + timing.1)) / 2;
            tracing::debug!(fix, round_trip, "estimated remote clock offset");
            fix
        } else {
            0
        };

        let cursors = self.log.store().get_last_synced(&node_id).await?;
        {
            let mut inner = self.inner.lock().unwrap();
            inner.remote_node_id = Some(node_id.clone());
            inner.remote_protocol = Some(protocol);
            inner.remote_subprotocol = extras.subprotocol.clone();
            inner.time_fix = time_fix;
            inner.authenticated = true;
            inner.last_sent = cursors.sent;
            inner.last_received = cursors.received;
        }
        self.bump_heartbeat();
        tracing::info!(peer = %node_id, time_fix, "session established");
        self.emit_state();
        self.sync_since(cursors.sent).await
    }

    /// Stream every stored entry with `added > since` to the peer in one
    /// `sync` message.
    async fn sync_since(&self, since: u64) -> Result<(), HandleError> {
        let time_fix = self.inner.lock().unwrap().time_fix;
        let store = self.log.store();

        let mut backlog: Vec<(Action, Meta)> = Vec::new();
        let mut page = store.get(Order::Added, None).await?;
        'collect: loop {
            for (action, meta) in &page.entries {
                match meta.added {
                    Some(added) if added > since => backlog.push((action.clone(), meta.clone())),
                    _ => break 'collect,
                }
            }
            match page.next {
                Some(cursor) => page = store.get(Order::Added, Some(cursor)).await?,
                None => break,
            }
        }
        backlog.reverse();

        let mut max_added = since;
        let mut batch = Vec::with_capacity(backlog.len());
        for (action, meta) in backlog {
            if let Some(added) = meta.added {
                max_added = max_added.max(added);
            }
            if !self.options.policy.filter_out(&action, &meta).await {
                continue;
            }
            let (action, mut meta) = self.options.policy.map_out(action, meta).await;
            meta.time -= time_fix;
            batch.push((action, meta));
        }

        if batch.is_empty() && max_added == since {
            self.emit_state();
            return Ok(());
        }

        tracing::debug!(count = batch.len(), up_to = max_added, "streaming backlog");
        self.inner.lock().unwrap().syncing += 1;
        self.send(Message::Sync {
            synced: max_added,
            entries: batch,
        });
        self.emit_state();
        Ok(())
    }

    /// A local log emitted `add`: forward the entry unless it came from the
    /// peer in the first place.
    async fn handle_local_add(&self, action: Action, meta: Meta) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.received_ids.remove(&meta.id) {
                return;
            }
            if !inner.connected || !inner.authenticated {
                return;
            }
        }
        if !self.options.policy.filter_out(&action, &meta).await {
            return;
        }
        let time_fix = self.inner.lock().unwrap().time_fix;
        let (action, mut meta) = self.options.policy.map_out(action, meta).await;
        meta.time -= time_fix;
        let synced = meta.added.unwrap_or(0);

        self.inner.lock().unwrap().syncing += 1;
        self.send(Message::Sync {
            synced,
            entries: vec![(action, meta)],
        });
        self.emit_state();
    }

    async fn handle_sync(
        &self,
        synced: u64,
        entries: Vec<(Action, Meta)>,
    ) -> Result<(), HandleError> {
        let time_fix = self.inner.lock().unwrap().time_fix;
        for (action, mut meta) in entries {
            meta.time += time_fix;
            if !self.options.policy.filter_in(&action, &meta).await {
                continue;
            }
            let (action, meta) = self.options.policy.map_in(action, meta).await;
            let id = meta.id.clone();
            self.inner.lock().unwrap().received_ids.insert(id.clone());
            match self.log.add(action, NewMeta::from(meta)).await {
                Ok(Some(_)) => {}
                Ok(None) => {
                    // Duplicate: no `add` event will fire for it.
                    self.inner.lock().unwrap().received_ids.remove(&id);
                }
                Err(err) => {
                    self.inner.lock().unwrap().received_ids.remove(&id);
                    return Err(err.into());
                }
            }
        }

        let remote = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_received = inner.last_received.max(synced);
            inner.remote_node_id.clone()
        };
        if let Some(peer) = remote {
            self.log
                .store()
                .set_last_synced(&peer, SyncedUpdate::received(synced))
                .await?;
        }
        self.send(Message::Synced(synced));
        Ok(())
    }

    async fn handle_synced(&self, synced: u64) -> Result<(), HandleError> {
        let (remote, sent, received, done) = {
            let mut inner = self.inner.lock().unwrap();
            inner.last_sent = inner.last_sent.max(synced);
            if inner.syncing > 0 {
                inner.syncing -= 1;
            }
            (
                inner.remote_node_id.clone(),
                inner.last_sent,
                inner.last_received,
                inner.syncing == 0,
            )
        };
        if let Some(peer) = remote {
            self.log
                .store()
                .set_last_synced(&peer, SyncedUpdate::sent(sent))
                .await?;
        }
        if done {
            tracing::debug!(sent, received, "synchronized");
            self.emit(NodeEvent::Synced { sent, received });
        }
        self.emit_state();
        Ok(())
    }

    fn handle_remote_error(&self, kind: ErrorKind) {
        let error = SyncError::remote(kind);
        tracing::warn!(%error, "error reported by peer");
        if error.is_terminal() {
            self.emit(NodeEvent::ClientError(error));
            self.connection.disconnect(Some(DisconnectReason::Protocol));
        } else {
            self.emit(NodeEvent::Error(NodeError::Sync(error)));
            self.connection.disconnect(Some(DisconnectReason::Error));
        }
    }

    async fn handle_heartbeat(&self) {
        enum Due {
            Ping,
            Timeout,
            Nothing,
        }

        let due = {
            let mut inner = self.inner.lock().unwrap();
            match inner.heartbeat {
                Heartbeat::PingDue(at) if at <= Instant::now() => {
                    inner.heartbeat = Heartbeat::AwaitPong(
                        Instant::now() + Duration::from_millis(self.options.config.timeout),
                    );
                    Due::Ping
                }
                Heartbeat::AwaitPong(at) if at <= Instant::now() => {
                    inner.heartbeat = Heartbeat::Idle;
                    Due::Timeout
                }
                _ => Due::Nothing,
            }
        };

        match due {
            Due::Ping => {
                let last = self.log.store().last_added().await.unwrap_or(0);
                tracing::debug!("sending ping");
                self.send(Message::Ping(last));
            }
            Due::Timeout => {
                let timeout = self.options.config.timeout;
                tracing::warn!(timeout, "peer missed the heartbeat deadline");
                self.emit(NodeEvent::Error(NodeError::Sync(SyncError::local(
                    ErrorKind::Timeout(timeout),
                ))));
                self.connection.disconnect(Some(DisconnectReason::Timeout));
            }
            Due::Nothing => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;
    use crate::connection::pair::LocalPair;
    use crate::options::{Authenticator, SubprotocolMatcher};
    use actionsync_log::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;

    fn fixed_clock(at: i64) -> TimeSource {
        Arc::new(move || at)
    }

    fn test_log(node_id: &str) -> Log {
        Log::with_time_source(node_id, MemoryStore::new(), fixed_clock(100)).unwrap()
    }

    fn reasoned() -> NewMeta {
        NewMeta::fresh().with_reasons(vec!["test".into()])
    }

    fn no_fix() -> NodeOptions {
        NodeOptions::new(NodeConfig {
            fix_time: false,
            ..NodeConfig::default()
        })
    }

    fn heartbeat(ping: u64, timeout: u64) -> NodeOptions {
        NodeOptions::new(NodeConfig {
            ping,
            timeout,
            fix_time: false,
            ..NodeConfig::default()
        })
    }

    /// Let queued events drain without advancing the (possibly paused) clock.
    async fn settle() {
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    fn frames_tagged(frames: &[Frame], tag: &str) -> usize {
        frames.iter().filter(|frame| frame[0] == tag).count()
    }

    struct RejectAll;

    #[async_trait]
    impl Authenticator for RejectAll {
        async fn authenticate(
            &self,
            _node_id: &str,
            _credentials: Option<&Value>,
        ) -> Result<bool, AuthError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn client_sends_connect_when_transport_connects() {
        let pair = LocalPair::new();
        let log = test_log("client:1");
        log.add(Action::new("test"), reasoned()).await.unwrap();
        let client = ClientNode::new(log, pair.left.clone(), no_fix()).unwrap();

        client.connect().await.unwrap();
        settle().await;

        let sent = pair.left.sent_frames();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0], json!(["connect", [0, 4], "client:1", 1]));
        assert_eq!(client.state(), NodeState::Connecting);
    }

    #[tokio::test]
    async fn connect_announces_credentials_and_subprotocol() {
        let pair = LocalPair::new();
        let options = NodeOptions::new(NodeConfig {
            fix_time: false,
            token: Some("secret".into()),
            subprotocol: Some("1.2.0".into()),
            ..NodeConfig::default()
        });
        let client = ClientNode::new(test_log("client:1"), pair.left.clone(), options).unwrap();

        client.connect().await.unwrap();
        settle().await;

        let sent = pair.left.sent_frames();
        assert_eq!(
            sent[0],
            json!([
                "connect",
                [0, 4],
                "client:1",
                0,
                { "credentials": "secret", "subprotocol": "1.2.0" }
            ])
        );
    }

    #[tokio::test]
    async fn server_answers_connect_and_streams_backlog() {
        let pair = LocalPair::new();
        let log = test_log("server");
        log.add(Action::new("one"), reasoned()).await.unwrap();
        log.add(Action::new("two"), reasoned()).await.unwrap();
        let server = ServerNode::new(log.clone(), pair.right.clone(), no_fix()).unwrap();

        pair.left.connect().await.unwrap();
        settle().await;
        pair.left
            .send(json!(["connect", [0, 4], "client:1", 0]))
            .unwrap();
        settle().await;

        assert!(server.base().authenticated());
        assert_eq!(server.base().remote_node_id().as_deref(), Some("client:1"));
        assert_eq!(server.state(), NodeState::Sending);

        let sent = pair.right.sent_frames();
        assert_eq!(sent[0][0], "connected");
        assert_eq!(sent[0][2], "server");
        assert_eq!(sent[1][0], "sync");
        assert_eq!(sent[1][1], 2);
        // Two (action, meta) pairs after the tag and cursor.
        assert_eq!(sent[1].as_array().unwrap().len(), 6);
        // Entries are streamed oldest first.
        assert_eq!(sent[1][2]["type"], "one");
        assert_eq!(sent[1][4]["type"], "two");

        pair.left.send(json!(["synced", 2])).unwrap();
        settle().await;
        assert_eq!(server.base().syncing(), 0);
        assert_eq!(server.state(), NodeState::Synchronized);
        assert_eq!(
            log.store().get_last_synced("client:1").await.unwrap().sent,
            2
        );
    }

    #[tokio::test]
    async fn wrong_protocol_major_is_terminal() {
        let pair = LocalPair::new();
        let server =
            ServerNode::new(test_log("server"), pair.right.clone(), no_fix()).unwrap();
        let mut events = server.events();

        pair.left.connect().await.unwrap();
        settle().await;
        pair.left
            .send(json!(["connect", [1, 0], "client:1", 0]))
            .unwrap();
        settle().await;

        let sent = pair.right.sent_frames();
        assert_eq!(sent[0][0], "error");
        assert_eq!(sent[0][1], "wrong-protocol");
        assert!(!server.base().connected());

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::Error(NodeError::Sync(error)) = event {
                assert!(matches!(error.kind, ErrorKind::WrongProtocol { .. }));
                assert!(!error.remote);
                saw_error = true;
            }
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn rejected_credentials_then_bruteforce() {
        let pair = LocalPair::new();
        let options = no_fix().with_auth(RejectAll);
        let server =
            ServerNode::new(test_log("server"), pair.right.clone(), options).unwrap();

        for _ in 0..3 {
            pair.left.connect().await.unwrap();
            settle().await;
            pair.left
                .send(json!(["connect", [0, 4], "client:1", 0]))
                .unwrap();
            settle().await;
            assert!(!server.base().authenticated());
        }

        let errors: Vec<String> = pair
            .right
            .sent_frames()
            .iter()
            .filter(|frame| frame[0] == "error")
            .map(|frame| frame[1].as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            errors,
            vec!["wrong-credentials", "wrong-credentials", "bruteforce"]
        );
    }

    #[tokio::test]
    async fn unacceptable_subprotocol_is_rejected() {
        let pair = LocalPair::new();
        let options = no_fix().with_subprotocols(SubprotocolMatcher::same_major("1.0.0"));
        let server =
            ServerNode::new(test_log("server"), pair.right.clone(), options).unwrap();

        pair.left.connect().await.unwrap();
        settle().await;
        pair.left
            .send(json!([
                "connect",
                [0, 4],
                "client:1",
                0,
                { "subprotocol": "2.0.0" }
            ]))
            .unwrap();
        settle().await;

        assert!(!server.base().authenticated());
        let sent = pair.right.sent_frames();
        assert_eq!(sent[0][0], "error");
        assert_eq!(sent[0][1], "wrong-subprotocol");
        assert_eq!(sent[0][2]["supported"], "1.x");
        assert_eq!(sent[0][2]["used"], "2.0.0");
    }

    #[tokio::test]
    async fn messages_before_auth_get_missed_auth() {
        let pair = LocalPair::new();
        let server =
            ServerNode::new(test_log("server"), pair.right.clone(), no_fix()).unwrap();

        pair.left.connect().await.unwrap();
        settle().await;
        pair.left.send(json!(["ping", 0])).unwrap();
        settle().await;

        let sent = pair.right.sent_frames();
        assert_eq!(sent[0][0], "error");
        assert_eq!(sent[0][1], "missed-auth");
        assert_eq!(sent[0][2], "[\"ping\",0]");
        assert!(!server.base().connected());
    }

    #[tokio::test]
    async fn malformed_frames_get_wrong_format() {
        for bad in [json!(["ping"]), json!(["ping", "abc"])] {
            let pair = LocalPair::new();
            let server =
                ServerNode::new(test_log("server"), pair.right.clone(), no_fix()).unwrap();

            pair.left.connect().await.unwrap();
            settle().await;
            pair.left.send(bad.clone()).unwrap();
            settle().await;

            let sent = pair.right.sent_frames();
            assert_eq!(sent[0][0], "error", "for {bad}");
            assert_eq!(sent[0][1], "wrong-format");
            assert_eq!(sent[0][2], bad.to_string());
            assert!(!server.base().connected());
        }
    }

    #[tokio::test]
    async fn unknown_commands_are_reported() {
        let pair = LocalPair::new();
        let _server =
            ServerNode::new(test_log("server"), pair.right.clone(), no_fix()).unwrap();

        pair.left.connect().await.unwrap();
        settle().await;
        pair.left.send(json!(["huffman", 1])).unwrap();
        settle().await;

        let sent = pair.right.sent_frames();
        assert_eq!(sent[0][0], "error");
        assert_eq!(sent[0][1], "unknown-message");
        assert_eq!(sent[0][2], "huffman");
    }

    #[tokio::test]
    async fn terminal_errors_from_the_peer_emit_client_error() {
        let pair = LocalPair::new();
        let client =
            ClientNode::new(test_log("client:1"), pair.left.clone(), no_fix()).unwrap();
        let mut events = client.events();

        client.connect().await.unwrap();
        settle().await;
        pair.right
            .send(json!(["error", "wrong-credentials"]))
            .unwrap();
        settle().await;

        assert!(!client.base().connected());
        let mut saw_client_error = false;
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::ClientError(error) = event {
                assert_eq!(error.kind, ErrorKind::WrongCredentials);
                assert!(error.remote);
                saw_client_error = true;
            }
        }
        assert!(saw_client_error);
    }

    #[tokio::test]
    async fn client_computes_the_time_fix() {
        let pair = LocalPair::new();
        let log = Log::with_time_source("client:1", MemoryStore::new(), fixed_clock(10_000))
            .unwrap();
        let client =
            ClientNode::new(log.clone(), pair.left.clone(), NodeOptions::default()).unwrap();

        client.connect().await.unwrap();
        settle().await;
        pair.right
            .send(json!(["connected", [0, 4], "server", [60_000, 60_000]]))
            .unwrap();
        settle().await;

        // ((10000 + 10000) - (60000 + 60000)) / 2
        assert_eq!(client.base().time_fix(), -50_000);

        // Incoming entries are moved onto the local clock.
        pair.right
            .send(json!([
                "sync",
                1,
                { "type": "test" },
                { "id": [60_000, "server", 0], "time": 60_000, "reasons": ["test"] }
            ]))
            .unwrap();
        settle().await;

        let entries = log.entries(Order::Added).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].1.time, 10_000);
        assert_eq!(entries[0].1.id.time, 60_000);
    }

    #[tokio::test]
    async fn received_entries_are_acked_and_not_echoed() {
        let pair = LocalPair::new();
        let log = test_log("client:1");
        let client = ClientNode::new(log.clone(), pair.left.clone(), no_fix()).unwrap();

        client.connect().await.unwrap();
        settle().await;
        pair.right
            .send(json!(["connected", [0, 4], "server", [0, 0]]))
            .unwrap();
        settle().await;
        pair.left.clear_sent();

        pair.right
            .send(json!([
                "sync",
                1,
                { "type": "incoming" },
                { "id": [1, "server", 0], "time": 1, "reasons": ["test"] }
            ]))
            .unwrap();
        settle().await;

        let sent = pair.left.sent_frames();
        assert_eq!(frames_tagged(&sent, "synced"), 1);
        assert_eq!(frames_tagged(&sent, "sync"), 0, "must not echo the entry");
        assert_eq!(log.entries(Order::Added).await.unwrap().len(), 1);
        assert_eq!(
            log.store().get_last_synced("server").await.unwrap().received,
            1
        );
    }

    #[tokio::test]
    async fn local_additions_are_streamed_live() {
        let pair = LocalPair::new();
        let log = test_log("client:1");
        let client = ClientNode::new(log.clone(), pair.left.clone(), no_fix()).unwrap();

        client.connect().await.unwrap();
        settle().await;
        pair.right
            .send(json!(["connected", [0, 4], "server", [0, 0]]))
            .unwrap();
        settle().await;
        pair.left.clear_sent();

        log.add(Action::new("live"), reasoned()).await.unwrap();
        settle().await;

        let sent = pair.left.sent_frames();
        assert_eq!(frames_tagged(&sent, "sync"), 1);
        let sync = sent.iter().find(|frame| frame[0] == "sync").unwrap();
        assert_eq!(sync[1], 1);
        assert_eq!(sync[2]["type"], "live");
        assert_eq!(client.state(), NodeState::Sending);

        pair.right.send(json!(["synced", 1])).unwrap();
        settle().await;
        assert_eq!(client.state(), NodeState::Synchronized);
    }

    #[tokio::test(start_paused = true)]
    async fn no_ping_before_authentication() {
        let pair = LocalPair::new();
        let client =
            ClientNode::new(test_log("client:1"), pair.left.clone(), heartbeat(100, 300))
                .unwrap();

        client.connect().await.unwrap();
        settle().await;
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(frames_tagged(&pair.left.sent_frames(), "ping"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn single_ping_while_a_pong_is_outstanding() {
        let pair = LocalPair::new();
        let client =
            ClientNode::new(test_log("client:1"), pair.left.clone(), heartbeat(100, 300))
                .unwrap();

        client.connect().await.unwrap();
        settle().await;
        pair.right
            .send(json!(["connected", [0, 4], "server", [0, 0]]))
            .unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_millis(250)).await;

        assert_eq!(frames_tagged(&pair.left.sent_frames(), "ping"), 1);
        assert!(client.base().connected());
    }

    #[tokio::test(start_paused = true)]
    async fn pong_reschedules_the_next_ping() {
        let pair = LocalPair::new();
        let client =
            ClientNode::new(test_log("client:1"), pair.left.clone(), heartbeat(100, 300))
                .unwrap();

        client.connect().await.unwrap();
        settle().await;
        pair.right
            .send(json!(["connected", [0, 4], "server", [0, 0]]))
            .unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(frames_tagged(&pair.left.sent_frames(), "ping"), 1);
        pair.right.send(json!(["pong", 0])).unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(frames_tagged(&pair.left.sent_frames(), "ping"), 2);
        assert!(client.base().connected());
    }

    #[tokio::test(start_paused = true)]
    async fn missing_pong_disconnects_with_timeout() {
        let pair = LocalPair::new();
        let client =
            ClientNode::new(test_log("client:1"), pair.left.clone(), heartbeat(100, 300))
                .unwrap();
        let mut events = client.events();

        client.connect().await.unwrap();
        settle().await;
        pair.right
            .send(json!(["connected", [0, 4], "server", [0, 0]]))
            .unwrap();
        settle().await;

        tokio::time::sleep(Duration::from_millis(450)).await;
        settle().await;

        assert!(!client.base().connected());
        let mut saw_timeout = false;
        let mut saw_disconnect = false;
        while let Ok(event) = events.try_recv() {
            match event {
                NodeEvent::Error(NodeError::Sync(error)) => {
                    assert_eq!(error.kind, ErrorKind::Timeout(300));
                    saw_timeout = true;
                }
                NodeEvent::Disconnect(reason) => {
                    assert_eq!(reason, Some(DisconnectReason::Timeout));
                    saw_disconnect = true;
                }
                _ => {}
            }
        }
        assert!(saw_timeout);
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn heartbeat_without_timeout_is_rejected() {
        let pair = LocalPair::new();
        let result = ClientNode::new(
            test_log("client:1"),
            pair.left.clone(),
            heartbeat(100, 0),
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[tokio::test]
    async fn debug_messages_flow_both_ways() {
        let pair = LocalPair::new();
        let client =
            ClientNode::new(test_log("client:1"), pair.left.clone(), no_fix()).unwrap();
        let mut events = client.events();

        client.connect().await.unwrap();
        settle().await;

        client.base().send_debug("error", json!("stack trace"));
        let sent = pair.left.sent_frames();
        assert!(sent.contains(&json!(["debug", "error", "stack trace"])));

        pair.right.send(json!(["debug", "error", "remote"])).unwrap();
        settle().await;
        let mut saw_debug = false;
        while let Ok(event) = events.try_recv() {
            if let NodeEvent::Debug { kind, data } = event {
                assert_eq!(kind, "error");
                assert_eq!(data, json!("remote"));
                saw_debug = true;
            }
        }
        assert!(saw_debug);
    }

    #[tokio::test]
    async fn destroy_is_terminal() {
        let pair = LocalPair::new();
        let log = test_log("client:1");
        let client = ClientNode::new(log.clone(), pair.left.clone(), no_fix()).unwrap();
        let mut right_events = pair.right.events();

        client.connect().await.unwrap();
        settle().await;
        pair.right
            .send(json!(["connected", [0, 4], "server", [0, 0]]))
            .unwrap();
        settle().await;
        pair.left.clear_sent();

        client.destroy();
        settle().await;

        assert!(client.base().destroyed());
        assert!(!client.base().connected());
        assert_eq!(client.state(), NodeState::Disconnected);
        assert_eq!(client.base().syncing(), 0);

        // The peer saw the link drop.
        let mut saw_disconnect = false;
        while let Ok(event) = right_events.try_recv() {
            if matches!(event, ConnectionEvent::Disconnect(_)) {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);

        // Further log activity is no longer forwarded.
        log.add(Action::new("late"), reasoned()).await.unwrap();
        settle().await;
        assert_eq!(frames_tagged(&pair.left.sent_frames(), "sync"), 0);
    }
}
