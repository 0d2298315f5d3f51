//! Bus client: one logical connection to the server's event channel.
//!
//! The connection is modeled as an explicit state machine
//! (`disconnected → connecting → connected → subscribing → active`) driven
//! on a background thread, so reconnection and epoch-tagging logic stays in
//! one place instead of scattered across socket callbacks. Errors are
//! delivered as state transitions, never across the call boundary.

use crate::config::BusConfig;
use crate::error::{SyncError, SyncResult};
use crate::transport::{BusConnection, BusTransport};
use fieldsync_protocol::{ClientMessage, CursorTable, ServerMessage};
use parking_lot::{Condvar, Mutex, RwLock};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often the session loop wakes to check liveness and shutdown.
const POLL_INTERVAL: Duration = Duration::from_millis(25);

/// Connection state of the bus client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No connection; reconnect may be pending.
    Disconnected,
    /// A connect attempt is in progress.
    Connecting,
    /// Transport is up; subscribe not yet sent.
    Connected,
    /// Subscribe sent; waiting for the server to accept.
    Subscribing,
    /// Subscription accepted; live events flowing.
    Active,
}

impl ConnectionState {
    /// Returns true if the subscription is live.
    pub fn is_active(&self) -> bool {
        matches!(self, ConnectionState::Active)
    }
}

/// A state transition announced on the state stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusStateChange {
    /// The new state.
    pub state: ConnectionState,
    /// Why the transition happened, when it was caused by a failure.
    pub reason: Option<String>,
    /// Connection epoch the transition belongs to.
    pub epoch: u64,
}

/// A value tagged with the connection epoch it was produced under.
///
/// The coordinator uses the tag to discard stale deliveries from a
/// superseded connection.
#[derive(Debug, Clone, PartialEq)]
pub struct EpochStamped<T> {
    /// Connection epoch.
    pub epoch: u64,
    /// The tagged value.
    pub message: T,
}

struct BusShared {
    config: BusConfig,
    transport: Box<dyn BusTransport>,
    cursors: Arc<RwLock<CursorTable>>,
    state: RwLock<ConnectionState>,
    epoch: AtomicU64,
    state_subs: RwLock<Vec<Sender<BusStateChange>>>,
    event_subs: RwLock<Vec<Sender<EpochStamped<ServerMessage>>>>,
    shutdown: Mutex<bool>,
    shutdown_cv: Condvar,
}

impl BusShared {
    fn is_shutdown(&self) -> bool {
        *self.shutdown.lock()
    }

    fn set_state(&self, state: ConnectionState, reason: Option<String>, epoch: u64) {
        *self.state.write() = state;
        debug!(?state, ?reason, epoch, "bus state change");
        let change = BusStateChange {
            state,
            reason,
            epoch,
        };
        self.state_subs
            .write()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    fn emit_event(&self, epoch: u64, message: ServerMessage) {
        let stamped = EpochStamped { epoch, message };
        self.event_subs
            .write()
            .retain(|tx| tx.send(stamped.clone()).is_ok());
    }

    /// Sleeps out the backoff for `attempt`, waking early on shutdown.
    /// Returns false if the client is shutting down.
    fn wait_backoff(&self, attempt: u32) -> bool {
        let delay = self.config.backoff.delay_for_attempt(attempt);
        let mut flag = self.shutdown.lock();
        if *flag {
            return false;
        }
        if delay > Duration::ZERO {
            self.shutdown_cv.wait_for(&mut flag, delay);
        }
        !*flag
    }
}

/// Client for the server-pushed event bus.
///
/// Owns at most one active logical connection per instance. Dependents see
/// a continuous event stream across reconnects; replay gaps are covered by
/// resubscribing from the last acknowledged cursor per channel.
pub struct BusClient {
    shared: Arc<BusShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl BusClient {
    /// Creates a client. Call [`BusClient::start`] to begin connecting.
    ///
    /// The cursor table is shared with the coordinator: the coordinator
    /// advances cursors as it applies events, and reconnects resubscribe
    /// from wherever it got to.
    pub fn new(
        config: BusConfig,
        transport: Box<dyn BusTransport>,
        cursors: Arc<RwLock<CursorTable>>,
    ) -> Self {
        {
            let mut table = cursors.write();
            for channel in &config.channels {
                table.ensure(channel);
            }
        }
        Self {
            shared: Arc::new(BusShared {
                config,
                transport,
                cursors,
                state: RwLock::new(ConnectionState::Disconnected),
                epoch: AtomicU64::new(0),
                state_subs: RwLock::new(Vec::new()),
                event_subs: RwLock::new(Vec::new()),
                shutdown: Mutex::new(false),
                shutdown_cv: Condvar::new(),
            }),
            handle: Mutex::new(None),
        }
    }

    /// Starts the connection loop on a background thread. Idempotent.
    pub fn start(&self) {
        let mut handle = self.handle.lock();
        if handle.is_some() {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *handle = Some(std::thread::spawn(move || run_loop(&shared)));
    }

    /// Returns the current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.read()
    }

    /// Returns true if the subscription is live.
    pub fn is_active(&self) -> bool {
        self.state().is_active()
    }

    /// Returns the current connection epoch.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    /// Subscribes to state transitions.
    pub fn state_stream(&self) -> Receiver<BusStateChange> {
        let (tx, rx) = mpsc::channel();
        self.shared.state_subs.write().push(tx);
        rx
    }

    /// Subscribes to epoch-tagged server messages.
    pub fn event_stream(&self) -> Receiver<EpochStamped<ServerMessage>> {
        let (tx, rx) = mpsc::channel();
        self.shared.event_subs.write().push(tx);
        rx
    }

    /// Blocks until the subscription is live.
    ///
    /// Returns [`SyncError::Timeout`] when the deadline passes first and
    /// [`SyncError::Closed`] when the client shuts down while waiting.
    pub fn wait_until_active(&self, timeout: Duration) -> SyncResult<()> {
        let states = self.state_stream();
        let deadline = Instant::now() + timeout;
        loop {
            if self.is_active() {
                return Ok(());
            }
            if self.shared.is_shutdown() {
                return Err(SyncError::Closed);
            }
            let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                return Err(SyncError::Timeout);
            };
            match states.recv_timeout(remaining.min(Duration::from_millis(50))) {
                Ok(_) | Err(mpsc::RecvTimeoutError::Timeout) => {}
                Err(mpsc::RecvTimeoutError::Disconnected) => return Err(SyncError::Closed),
            }
        }
    }

    /// Tears down the connection and cancels any pending reconnect.
    ///
    /// Safe to call at any time, including mid connection attempt, and
    /// idempotent.
    pub fn close(&self) {
        {
            let mut flag = self.shared.shutdown.lock();
            *flag = true;
            self.shared.shutdown_cv.notify_all();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for BusClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn run_loop(shared: &Arc<BusShared>) {
    let mut attempt: u32 = 0;

    loop {
        if shared.is_shutdown() {
            break;
        }

        // Each attempt gets a fresh epoch; events from a superseded
        // connection carry the old tag and get discarded downstream.
        let epoch = shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        shared.set_state(ConnectionState::Connecting, None, epoch);

        let mut conn = match shared.transport.connect() {
            Ok(conn) => conn,
            Err(e) => {
                shared.set_state(ConnectionState::Disconnected, Some(e.to_string()), epoch);
                attempt += 1;
                if !shared.wait_backoff(attempt) {
                    break;
                }
                continue;
            }
        };

        shared.set_state(ConnectionState::Connected, None, epoch);
        shared.cursors.write().begin_epoch(epoch);

        let subscribe = {
            let table = shared.cursors.read();
            ClientMessage::subscribe(&shared.config.channels, &table.last_cursors())
        };
        if let Err(e) = conn.send(&subscribe) {
            conn.close();
            shared.set_state(ConnectionState::Disconnected, Some(e.to_string()), epoch);
            attempt += 1;
            if !shared.wait_backoff(attempt) {
                break;
            }
            continue;
        }
        shared.set_state(ConnectionState::Subscribing, None, epoch);

        let session_start = Instant::now();
        let reason = run_session(shared, conn.as_mut(), epoch);
        conn.close();

        if shared.is_shutdown() {
            shared.set_state(ConnectionState::Disconnected, Some("closed".into()), epoch);
            break;
        }

        // A connection that survived long enough proves the route works;
        // start the backoff ladder over.
        if session_start.elapsed() >= shared.config.stable_threshold {
            attempt = 1;
        } else {
            attempt += 1;
        }

        shared.set_state(ConnectionState::Disconnected, Some(reason), epoch);
        if !shared.wait_backoff(attempt) {
            break;
        }
    }

    let epoch = shared.epoch.load(Ordering::SeqCst);
    shared.set_state(ConnectionState::Disconnected, Some("closed".into()), epoch);
}

/// Drives one live connection until it dies. Returns the reason.
fn run_session(shared: &Arc<BusShared>, conn: &mut dyn BusConnection, epoch: u64) -> String {
    let mut last_frame = Instant::now();
    let mut active = false;

    loop {
        if shared.is_shutdown() {
            return "closed".into();
        }

        match conn.recv(POLL_INTERVAL) {
            Ok(Some(frame)) => {
                last_frame = Instant::now();
                match ServerMessage::decode(&frame) {
                    Ok(ServerMessage::SubscribeOk { channels }) => {
                        if !active {
                            active = true;
                            debug!(?channels, epoch, "subscription active");
                            shared.set_state(ConnectionState::Active, None, epoch);
                        }
                    }
                    Ok(ServerMessage::SubscribeRejected { reason }) => {
                        let err = SyncError::subscription_rejected(reason);
                        warn!(error = %err, epoch, "subscription rejected");
                        return err.to_string();
                    }
                    Ok(ServerMessage::Heartbeat) => {
                        // Nothing to forward; receipt already reset the
                        // idle clock.
                    }
                    Ok(message) => {
                        shared.emit_event(epoch, message);
                    }
                    Err(e) => {
                        warn!(error = %e, epoch, "dropping malformed frame");
                    }
                }
            }
            Ok(None) => {
                if last_frame.elapsed() >= shared.config.idle_timeout {
                    return "idle timeout: no frames within liveness window".into();
                }
            }
            Err(e) => return e.to_string(),
        }
    }
}
