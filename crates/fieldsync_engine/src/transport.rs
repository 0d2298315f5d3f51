//! Transport seam for the bus client.
//!
//! The bus client never touches a socket directly; it drives a
//! [`BusTransport`] that yields one [`BusConnection`] per attempt. Tests
//! inject a [`ScriptedTransport`] and exercise the full state machine
//! without a live server.

use crate::error::{SyncError, SyncResult};
use fieldsync_protocol::ClientMessage;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Produces one connection per connect attempt.
pub trait BusTransport: Send + Sync {
    /// Opens a new connection to the event bus.
    fn connect(&self) -> SyncResult<Box<dyn BusConnection>>;
}

/// One live connection to the event bus.
pub trait BusConnection: Send {
    /// Sends a client message.
    fn send(&mut self, message: &ClientMessage) -> SyncResult<()>;

    /// Waits up to `timeout` for the next raw frame.
    ///
    /// Returns `Ok(None)` when the window elapses with no frame.
    fn recv(&mut self, timeout: Duration) -> SyncResult<Option<serde_json::Value>>;

    /// Closes the connection. Idempotent.
    fn close(&mut self);
}

/// One scripted step of a test connection.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Deliver a raw frame.
    Frame(serde_json::Value),
    /// Fail the connection as if the peer dropped it.
    Drop,
}

enum ConnectionScript {
    /// `connect()` itself fails.
    Refuse,
    /// Connection succeeds and replays these steps; after the script is
    /// exhausted the connection goes silent.
    Accept(VecDeque<ScriptStep>),
}

/// A scripted transport for tests.
///
/// Each `connect()` consumes the next queued connection script. Sent
/// messages are recorded per connection for assertions. When no scripts
/// remain, connects are refused.
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<ConnectionScript>>,
    sent: Arc<Mutex<Vec<(usize, ClientMessage)>>>,
    connects: AtomicUsize,
}

impl ScriptedTransport {
    /// Creates a transport with no scripted connections.
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            sent: Arc::new(Mutex::new(Vec::new())),
            connects: AtomicUsize::new(0),
        }
    }

    /// Queues a successful connection that replays the given steps.
    pub fn push_connection(&self, steps: impl IntoIterator<Item = ScriptStep>) {
        self.scripts
            .lock()
            .push_back(ConnectionScript::Accept(steps.into_iter().collect()));
    }

    /// Queues a refused connection attempt.
    pub fn push_refused(&self) {
        self.scripts.lock().push_back(ConnectionScript::Refuse);
    }

    /// Returns all sent messages as (connection index, message) pairs.
    pub fn sent(&self) -> Vec<(usize, ClientMessage)> {
        self.sent.lock().clone()
    }

    /// Returns the number of connect attempts observed.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl Default for ScriptedTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BusTransport for ScriptedTransport {
    fn connect(&self) -> SyncResult<Box<dyn BusConnection>> {
        let index = self.connects.fetch_add(1, Ordering::SeqCst);
        match self.scripts.lock().pop_front() {
            Some(ConnectionScript::Accept(steps)) => Ok(Box::new(ScriptedConnection {
                index,
                steps,
                sent: Arc::clone(&self.sent),
                closed: false,
            })),
            Some(ConnectionScript::Refuse) => {
                Err(SyncError::connection_lost("scripted connection refused"))
            }
            None => Err(SyncError::connection_lost("no scripted connections left")),
        }
    }
}

// Lets a test keep a handle on the transport after handing it to the client.
impl BusTransport for Arc<ScriptedTransport> {
    fn connect(&self) -> SyncResult<Box<dyn BusConnection>> {
        ScriptedTransport::connect(self)
    }
}

struct ScriptedConnection {
    index: usize,
    steps: VecDeque<ScriptStep>,
    sent: Arc<Mutex<Vec<(usize, ClientMessage)>>>,
    closed: bool,
}

impl BusConnection for ScriptedConnection {
    fn send(&mut self, message: &ClientMessage) -> SyncResult<()> {
        if self.closed {
            return Err(SyncError::Closed);
        }
        self.sent.lock().push((self.index, message.clone()));
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> SyncResult<Option<serde_json::Value>> {
        if self.closed {
            return Err(SyncError::Closed);
        }
        match self.steps.pop_front() {
            Some(ScriptStep::Frame(frame)) => Ok(Some(frame)),
            Some(ScriptStep::Drop) => Err(SyncError::connection_lost("scripted drop")),
            None => {
                // Script exhausted: emulate a silent socket.
                std::thread::sleep(timeout);
                Ok(None)
            }
        }
    }

    fn close(&mut self) {
        self.closed = true;
    }
}
