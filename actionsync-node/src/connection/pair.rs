//! In-memory connection pair.
//!
//! Two linked endpoints over in-process channels: frames sent on one side
//! arrive as `Message` events on the other, in order. Used by tests and by
//! same-process peers. Test hooks allow capturing sent frames and forcing
//! connect failures.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use async_trait::async_trait;
use tokio::sync::broadcast;

use actionsync_types::Frame;

use super::{Connection, ConnectionError, ConnectionEvent, DisconnectReason};

const EVENT_CAPACITY: usize = 1024;

/// Shared link state of one pair.
#[derive(Default)]
struct PairState {
    connected: AtomicBool,
}

/// One endpoint of a [`LocalPair`].
pub struct LocalConnection {
    state: Arc<PairState>,
    events: broadcast::Sender<ConnectionEvent>,
    peer: OnceLock<broadcast::Sender<ConnectionEvent>>,
    sent: Mutex<Vec<Frame>>,
    fail_next_connect: Mutex<Option<String>>,
    destroyed: AtomicBool,
}

impl LocalConnection {
    fn new(state: Arc<PairState>) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state,
            events,
            peer: OnceLock::new(),
            sent: Mutex::new(Vec::new()),
            fail_next_connect: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        }
    }

    /// Frames sent from this side, in send order.
    pub fn sent_frames(&self) -> Vec<Frame> {
        self.sent.lock().unwrap().clone()
    }

    /// Forget previously captured frames.
    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    /// Make the next `connect()` fail with the given error.
    pub fn fail_next_connect(&self, error: &str) {
        *self.fail_next_connect.lock().unwrap() = Some(error.to_string());
    }

    fn emit(&self, event: ConnectionEvent) {
        let _ = self.events.send(event);
    }

    fn emit_peer(&self, event: ConnectionEvent) {
        if let Some(peer) = self.peer.get() {
            let _ = peer.send(event);
        }
    }
}

#[async_trait]
impl Connection for LocalConnection {
    fn connected(&self) -> bool {
        self.state.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Destroyed);
        }
        if let Some(error) = self.fail_next_connect.lock().unwrap().take() {
            return Err(ConnectionError::ConnectFailed(error));
        }
        self.emit(ConnectionEvent::Connecting);
        self.state.connected.store(true, Ordering::SeqCst);
        self.emit(ConnectionEvent::Connect);
        self.emit_peer(ConnectionEvent::Connect);
        Ok(())
    }

    fn disconnect(&self, reason: Option<DisconnectReason>) {
        if !self.state.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        self.emit(ConnectionEvent::Disconnect(reason));
        // The peer only learns that the link dropped, not why.
        self.emit_peer(ConnectionEvent::Disconnect(None));
    }

    fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        if !self.connected() {
            return Err(ConnectionError::NotConnected);
        }
        self.sent.lock().unwrap().push(frame.clone());
        self.emit_peer(ConnectionEvent::Message(frame));
        Ok(())
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect(Some(DisconnectReason::Destroy));
    }
}

/// Two linked in-memory connections.
pub struct LocalPair {
    /// The conventional initiator endpoint.
    pub left: Arc<LocalConnection>,
    /// The conventional responder endpoint.
    pub right: Arc<LocalConnection>,
}

impl LocalPair {
    /// Create a linked pair. Neither side is connected yet; `connect()` on
    /// either side brings the link up for both.
    pub fn new() -> Self {
        let state = Arc::new(PairState::default());
        let left = Arc::new(LocalConnection::new(state.clone()));
        let right = Arc::new(LocalConnection::new(state));
        left.peer
            .set(right.events.clone())
            .unwrap_or_else(|_| unreachable!());
        right
            .peer
            .set(left.events.clone())
            .unwrap_or_else(|_| unreachable!());
        Self { left, right }
    }
}

impl Default for LocalPair {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn next_event(rx: &mut broadcast::Receiver<ConnectionEvent>) -> ConnectionEvent {
        tokio::time::timeout(std::time::Duration::from_secs(1), rx.recv())
            .await
            .expect("no event")
            .expect("channel closed")
    }

    #[tokio::test]
    async fn connect_links_both_sides() {
        let pair = LocalPair::new();
        let mut left_events = pair.left.events();
        let mut right_events = pair.right.events();

        assert!(!pair.left.connected());
        pair.left.connect().await.unwrap();

        assert!(pair.left.connected());
        assert!(pair.right.connected());
        assert!(matches!(
            next_event(&mut left_events).await,
            ConnectionEvent::Connecting
        ));
        assert!(matches!(
            next_event(&mut left_events).await,
            ConnectionEvent::Connect
        ));
        assert!(matches!(
            next_event(&mut right_events).await,
            ConnectionEvent::Connect
        ));
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let pair = LocalPair::new();
        let mut right_events = pair.right.events();
        pair.left.connect().await.unwrap();
        next_event(&mut right_events).await; // connect

        pair.left.send(json!(["ping", 1])).unwrap();
        pair.left.send(json!(["ping", 2])).unwrap();

        assert!(matches!(
            next_event(&mut right_events).await,
            ConnectionEvent::Message(frame) if frame == json!(["ping", 1])
        ));
        assert!(matches!(
            next_event(&mut right_events).await,
            ConnectionEvent::Message(frame) if frame == json!(["ping", 2])
        ));
        assert_eq!(pair.left.sent_frames().len(), 2);
    }

    #[tokio::test]
    async fn send_without_connect_fails() {
        let pair = LocalPair::new();
        assert!(matches!(
            pair.left.send(json!(["ping", 1])),
            Err(ConnectionError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn disconnect_reports_reason_locally_only() {
        let pair = LocalPair::new();
        let mut left_events = pair.left.events();
        let mut right_events = pair.right.events();
        pair.left.connect().await.unwrap();
        next_event(&mut left_events).await; // connecting
        next_event(&mut left_events).await; // connect
        next_event(&mut right_events).await; // connect

        pair.left.disconnect(Some(DisconnectReason::Timeout));

        assert!(!pair.left.connected());
        assert!(!pair.right.connected());
        assert!(matches!(
            next_event(&mut left_events).await,
            ConnectionEvent::Disconnect(Some(DisconnectReason::Timeout))
        ));
        assert!(matches!(
            next_event(&mut right_events).await,
            ConnectionEvent::Disconnect(None)
        ));
    }

    #[tokio::test]
    async fn forced_connect_failure() {
        let pair = LocalPair::new();
        pair.left.fail_next_connect("network down");

        let result = pair.left.connect().await;
        assert!(matches!(result, Err(ConnectionError::ConnectFailed(_))));
        assert!(!pair.left.connected());

        // The failure is one-shot.
        pair.left.connect().await.unwrap();
        assert!(pair.left.connected());
    }

    #[tokio::test]
    async fn destroyed_connection_refuses_connect() {
        let pair = LocalPair::new();
        pair.left.connect().await.unwrap();
        pair.left.destroy();

        assert!(!pair.left.connected());
        assert!(matches!(
            pair.left.connect().await,
            Err(ConnectionError::Destroyed)
        ));
    }
}
