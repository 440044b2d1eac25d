//! Supervised reconnection over any [`Connection`].
//!
//! `Reconnect` wraps a connection and re-exposes the same contract. When the
//! underlying connection drops for a retriable reason it dials again with
//! exponential backoff and jitter, stops on terminal protocol errors or an
//! attempt cap, and reacts to host environment signals (page visibility,
//! network status, process freeze).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use actionsync_types::{ErrorKind, Frame};

use super::{Connection, ConnectionError, ConnectionEvent, DisconnectReason};
use crate::config::ReconnectConfig;

const EVENT_CAPACITY: usize = 1024;

/// A source of backoff jitter: given a maximum, returns a value in
/// `[0, max]`. Injectable so that backoff tests are deterministic.
pub type JitterSource = Arc<dyn Fn(u64) -> u64 + Send + Sync>;

/// The default jitter source, backed by the operating system RNG.
pub fn random_jitter() -> JitterSource {
    Arc::new(|max| {
        if max == 0 {
            return 0;
        }
        let mut bytes = [0u8; 8];
        getrandom::getrandom(&mut bytes).expect("getrandom failed");
        u64::from_le_bytes(bytes) % (max + 1)
    })
}

/// Environment signals a host adapter can feed into the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostSignal {
    /// The application window was hidden or shown.
    Visibility {
        /// `true` when the window became hidden.
        hidden: bool,
    },
    /// The network came back, or the process resumed from sleep.
    Online,
    /// The host is about to freeze the process.
    Freeze,
}

#[derive(Default)]
struct ReconnectState {
    reconnecting: bool,
    connecting: bool,
    attempts: u32,
    /// Retries suspended by a visibility/freeze signal.
    paused: bool,
    /// Retries disabled permanently by a terminal protocol error.
    disabled: bool,
}

#[derive(Default)]
struct Tasks {
    driver: Option<JoinHandle<()>>,
    retry: Option<JoinHandle<()>>,
}

/// A [`Connection`] wrapper that reconnects with exponential backoff.
pub struct Reconnect {
    inner: Arc<dyn Connection>,
    config: ReconnectConfig,
    state: Mutex<ReconnectState>,
    events: broadcast::Sender<ConnectionEvent>,
    jitter: JitterSource,
    host_tx: mpsc::UnboundedSender<HostSignal>,
    tasks: Mutex<Tasks>,
    weak: OnceLock<Weak<Reconnect>>,
    destroyed: AtomicBool,
}

impl Reconnect {
    /// Wrap a connection with the given backoff policy.
    pub fn new(inner: Arc<dyn Connection>, config: ReconnectConfig) -> Arc<Self> {
        Self::with_jitter(inner, config, random_jitter())
    }

    /// Wrap a connection with an explicit jitter source (used by tests).
    pub fn with_jitter(
        inner: Arc<dyn Connection>,
        config: ReconnectConfig,
        jitter: JitterSource,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (host_tx, host_rx) = mpsc::unbounded_channel();
        let this = Arc::new(Self {
            inner,
            config,
            state: Mutex::new(ReconnectState::default()),
            events,
            jitter,
            host_tx,
            tasks: Mutex::new(Tasks::default()),
            weak: OnceLock::new(),
            destroyed: AtomicBool::new(false),
        });
        this.weak
            .set(Arc::downgrade(&this))
            .unwrap_or_else(|_| unreachable!());
        // Subscribe before the task spawns so no event can slip past.
        let events_rx = this.inner.events();
        let driver = tokio::spawn(drive(this.clone(), events_rx, host_rx));
        this.tasks.lock().unwrap().driver = Some(driver);
        this
    }

    /// Whether the supervisor will retry after a drop.
    pub fn reconnecting(&self) -> bool {
        self.state.lock().unwrap().reconnecting
    }

    /// Whether a connection attempt is in flight.
    pub fn connecting(&self) -> bool {
        self.state.lock().unwrap().connecting
    }

    /// Connection attempts made since the last explicit `connect()`.
    pub fn attempts(&self) -> u32 {
        self.state.lock().unwrap().attempts
    }

    /// A sender for host environment signals. Host adapters (a browser
    /// bridge, a mobile lifecycle listener) push events here; dropping the
    /// sender detaches the adapter.
    pub fn host_signals(&self) -> mpsc::UnboundedSender<HostSignal> {
        self.host_tx.clone()
    }

    /// The delay before retry number `attempt` (zero-based):
    /// `min(max_delay, min_delay * 2^attempt + jitter)` with jitter uniform
    /// on `[0, attempt * 200]` milliseconds.
    pub fn next_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let base = self.config.min_delay.saturating_mul(factor);
        if base >= self.config.max_delay {
            return Duration::from_millis(self.config.max_delay);
        }
        let jitter = (self.jitter)(u64::from(attempt) * 200);
        Duration::from_millis((base + jitter).min(self.config.max_delay))
    }

    fn handle_event(&self, event: ConnectionEvent) {
        match &event {
            ConnectionEvent::Connecting => {
                self.state.lock().unwrap().connecting = true;
            }
            ConnectionEvent::Connect => {
                self.state.lock().unwrap().connecting = false;
            }
            ConnectionEvent::Message(frame) => {
                if is_terminal_error(frame) {
                    let mut state = self.state.lock().unwrap();
                    state.disabled = true;
                    state.reconnecting = false;
                    tracing::debug!("terminal protocol error, reconnection disabled");
                }
            }
            ConnectionEvent::Disconnect(reason) => {
                self.state.lock().unwrap().connecting = false;
                self.maybe_schedule(*reason);
            }
            ConnectionEvent::Error(_) => {}
        }
        let _ = self.events.send(event);
    }

    fn maybe_schedule(&self, reason: Option<DisconnectReason>) {
        if self.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if matches!(
            reason,
            Some(DisconnectReason::Destroy) | Some(DisconnectReason::Protocol)
        ) {
            return;
        }
        let delay = {
            let mut state = self.state.lock().unwrap();
            if !state.reconnecting || state.disabled || state.paused {
                return;
            }
            if let Some(cap) = self.config.attempts {
                if state.attempts + 1 >= cap {
                    state.reconnecting = false;
                    tracing::warn!(attempts = state.attempts + 1, "giving up on reconnection");
                    return;
                }
            }
            let delay = self.next_delay(state.attempts);
            state.attempts += 1;
            delay
        };
        tracing::debug!(?delay, "scheduling reconnection attempt");
        self.spawn_retry(delay);
    }

    fn spawn_retry(&self, delay: Duration) {
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(handle) = &tasks.retry {
            if !handle.is_finished() {
                return;
            }
        }
        let Some(this) = self.weak.get().and_then(Weak::upgrade) else {
            return;
        };
        tasks.retry = Some(tokio::spawn(retry_loop(this, delay)));
    }

    fn cancel_retry(&self) {
        if let Some(handle) = self.tasks.lock().unwrap().retry.take() {
            handle.abort();
        }
    }

    fn handle_host(&self, signal: HostSignal) {
        match signal {
            HostSignal::Visibility { hidden: true } => {
                self.state.lock().unwrap().paused = true;
                self.cancel_retry();
            }
            HostSignal::Visibility { hidden: false } | HostSignal::Online => {
                let should_dial = {
                    let mut state = self.state.lock().unwrap();
                    state.paused = false;
                    state.reconnecting && !state.disabled && !self.inner.connected()
                };
                if should_dial {
                    self.spawn_retry(Duration::ZERO);
                }
            }
            HostSignal::Freeze => {
                self.state.lock().unwrap().paused = true;
                self.cancel_retry();
                self.inner.disconnect(Some(DisconnectReason::Freeze));
            }
        }
    }
}

fn is_terminal_error(frame: &Frame) -> bool {
    let Some(items) = frame.as_array() else {
        return false;
    };
    if items.first().and_then(Value::as_str) != Some("error") {
        return false;
    }
    items
        .get(1)
        .and_then(Value::as_str)
        .and_then(|tag| ErrorKind::from_wire(tag, items.get(2)))
        .is_some_and(|kind| kind.is_terminal())
}

async fn drive(
    this: Arc<Reconnect>,
    mut events: broadcast::Receiver<ConnectionEvent>,
    mut host_rx: mpsc::UnboundedReceiver<HostSignal>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => this.handle_event(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "reconnect supervisor lagged behind connection events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            signal = host_rx.recv() => match signal {
                Some(signal) => this.handle_host(signal),
                None => break,
            },
        }
    }
}

async fn retry_loop(this: Arc<Reconnect>, mut delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        if this.destroyed.load(Ordering::SeqCst) {
            return;
        }
        {
            let state = this.state.lock().unwrap();
            if !state.reconnecting || state.paused || state.disabled {
                return;
            }
        }
        tracing::debug!("attempting to reconnect");
        match this.inner.connect().await {
            Ok(()) => return,
            Err(err) => {
                tracing::debug!(%err, "reconnection attempt failed");
                let mut state = this.state.lock().unwrap();
                if let Some(cap) = this.config.attempts {
                    if state.attempts + 1 >= cap {
                        state.reconnecting = false;
                        return;
                    }
                }
                delay = this.next_delay(state.attempts);
                state.attempts += 1;
            }
        }
    }
}

#[async_trait]
impl Connection for Reconnect {
    fn connected(&self) -> bool {
        self.inner.connected()
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(ConnectionError::Destroyed);
        }
        {
            let mut state = self.state.lock().unwrap();
            state.reconnecting = true;
            state.attempts = 0;
        }
        self.inner.connect().await
    }

    fn disconnect(&self, reason: Option<DisconnectReason>) {
        // A deliberate disconnect stops the supervisor; internal failure
        // reasons keep it retrying.
        if !matches!(
            reason,
            Some(DisconnectReason::Error) | Some(DisconnectReason::Timeout)
        ) {
            self.state.lock().unwrap().reconnecting = false;
            self.cancel_retry();
        }
        self.inner.disconnect(reason);
    }

    fn send(&self, frame: Frame) -> Result<(), ConnectionError> {
        self.inner.send(frame)
    }

    fn events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.state.lock().unwrap().reconnecting = false;
        let mut tasks = self.tasks.lock().unwrap();
        if let Some(handle) = tasks.driver.take() {
            handle.abort();
        }
        if let Some(handle) = tasks.retry.take() {
            handle.abort();
        }
        self.inner.destroy();
    }
}
