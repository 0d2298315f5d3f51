//! Engine facade: wires the bus client, coordinator, and outbox together.
//!
//! The facade owns the background threads: one feeding bus messages into
//! the coordinator, one draining the outbox while the bus is active, and,
//! when a snapshot fetcher is attached, one pulling full model snapshots.
//! All share the engine's shutdown flag and stop with [`SyncEngine::close`].

use crate::bus::BusClient;
use crate::config::{BusConfig, OutboxConfig};
use crate::coordinator::{SnapshotFetcher, SyncCoordinator};
use crate::outbox::{MutationSender, Outbox};
use crate::transport::BusTransport;
use fieldsync_protocol::CursorTable;
use fieldsync_store::LocalStore;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::warn;

/// Configuration for the assembled engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Bus client configuration.
    pub bus: BusConfig,
    /// Outbox configuration.
    pub outbox: OutboxConfig,
    /// Models the engine manages: outbox recovery runs over these at
    /// startup and snapshot pulls cover them.
    pub models: Vec<String>,
    /// How often the drain loop checks for queued entries.
    pub drain_interval: Duration,
    /// How often a full snapshot pull runs while the bus is active.
    pub pull_interval: Duration,
}

impl EngineConfig {
    /// Creates a configuration for the given bus setup.
    pub fn new(bus: BusConfig) -> Self {
        Self {
            bus,
            outbox: OutboxConfig::default(),
            models: Vec::new(),
            drain_interval: Duration::from_millis(250),
            pull_interval: Duration::from_secs(300),
        }
    }

    /// Sets the outbox configuration.
    pub fn with_outbox(mut self, outbox: OutboxConfig) -> Self {
        self.outbox = outbox;
        self
    }

    /// Sets the managed models.
    pub fn with_models(mut self, models: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.models = models.into_iter().map(Into::into).collect();
        self
    }

    /// Sets the drain interval.
    pub fn with_drain_interval(mut self, interval: Duration) -> Self {
        self.drain_interval = interval;
        self
    }

    /// Sets the snapshot pull interval.
    pub fn with_pull_interval(mut self, interval: Duration) -> Self {
        self.pull_interval = interval;
        self
    }
}

/// The assembled sync engine.
///
/// Local reads and writes go through [`SyncEngine::store`] and
/// [`SyncEngine::outbox`]; server-originated changes flow in through the bus
/// and surface on the store's change feed.
pub struct SyncEngine {
    store: Arc<LocalStore>,
    bus: BusClient,
    coordinator: Arc<SyncCoordinator>,
    outbox: Arc<Outbox>,
    sender: Arc<dyn MutationSender>,
    fetcher: Option<Arc<dyn SnapshotFetcher>>,
    config: EngineConfig,
    shutdown: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// Assembles an engine over the given store and collaborators.
    pub fn new(
        store: Arc<LocalStore>,
        config: EngineConfig,
        transport: Box<dyn BusTransport>,
        sender: Arc<dyn MutationSender>,
    ) -> Self {
        let cursors = Arc::new(RwLock::new(CursorTable::new(&config.bus.channels)));
        let bus = BusClient::new(config.bus.clone(), transport, Arc::clone(&cursors));
        let coordinator = Arc::new(SyncCoordinator::new(Arc::clone(&store), cursors));
        let outbox = Arc::new(Outbox::new(Arc::clone(&store), config.outbox.clone()));

        Self {
            store,
            bus,
            coordinator,
            outbox,
            sender,
            fetcher: None,
            config,
            shutdown: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
        }
    }

    /// Attaches a snapshot fetcher.
    ///
    /// With a fetcher attached, the engine pulls a full snapshot of every
    /// configured model each time the subscription becomes active and again
    /// every [`EngineConfig::pull_interval`] while it stays active. Without
    /// one, the engine relies on channel replay alone.
    pub fn with_snapshot_fetcher(mut self, fetcher: Arc<dyn SnapshotFetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Starts the bus connection, the apply loop, the drain loop, and (with
    /// a fetcher attached) the pull loop. Idempotent.
    ///
    /// Recovers the persisted outbox queue for every configured model before
    /// anything connects, so mutations queued in an earlier process go out
    /// with their original request ids.
    pub fn start(&self) {
        let mut threads = self.threads.lock();
        if !threads.is_empty() {
            return;
        }

        for model in &self.config.models {
            if let Err(e) = self.outbox.recover(model) {
                warn!(model = %model, error = %e, "outbox recovery failed");
            }
        }

        // Streams are subscribed before the bus starts so the first
        // connection's transitions and events cannot slip past them.
        let events = self.bus.event_stream();
        let drain_states = self.bus.state_stream();
        let pull_states = self.fetcher.as_ref().map(|_| self.bus.state_stream());

        self.bus.start();
        let coordinator = Arc::clone(&self.coordinator);
        let shutdown = Arc::clone(&self.shutdown);
        threads.push(std::thread::spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                match events.recv_timeout(Duration::from_millis(100)) {
                    Ok(stamped) => {
                        if let Err(e) = coordinator.handle_message(&stamped) {
                            warn!(error = %e, "failed to apply bus message");
                        }
                    }
                    Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                    Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                }
            }
        }));

        let outbox = Arc::clone(&self.outbox);
        let sender = Arc::clone(&self.sender);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.drain_interval;
        let bus_state = {
            // The drain loop only runs while the subscription is live;
            // anything sent earlier would race the replay.
            let states = drain_states;
            let active = Arc::new(AtomicBool::new(self.bus.is_active()));
            let flag = Arc::clone(&active);
            let stop = Arc::clone(&self.shutdown);
            threads.push(std::thread::spawn(move || {
                while !stop.load(Ordering::SeqCst) {
                    match states.recv_timeout(Duration::from_millis(100)) {
                        Ok(change) => flag.store(change.state.is_active(), Ordering::SeqCst),
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                }
            }));
            active
        };
        threads.push(std::thread::spawn(move || {
            while !shutdown.load(Ordering::SeqCst) {
                if bus_state.load(Ordering::SeqCst) && outbox.pending_count() > 0 {
                    match outbox.drain_once(sender.as_ref()) {
                        Ok(report) if report.failed > 0 => {
                            warn!(failed = report.failed, "outbox entries failed permanently");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "outbox drain failed"),
                    }
                }
                std::thread::sleep(interval);
            }
        }));

        if let (Some(fetcher), Some(states)) = (self.fetcher.clone(), pull_states) {
            let coordinator = Arc::clone(&self.coordinator);
            let shutdown = Arc::clone(&self.shutdown);
            let models = self.config.models.clone();
            let interval = self.config.pull_interval;
            let mut active = self.bus.is_active();
            threads.push(std::thread::spawn(move || {
                let mut last_pull: Option<Instant> = None;
                while !shutdown.load(Ordering::SeqCst) {
                    match states.recv_timeout(Duration::from_millis(100)) {
                        Ok(change) => {
                            let was_active = active;
                            active = change.state.is_active();
                            if active && !was_active {
                                // Replay covers the channel backlog; the pull
                                // covers what fell out of the replay window.
                                last_pull = None;
                            }
                        }
                        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
                    }
                    if active && last_pull.is_none_or(|t| t.elapsed() >= interval) {
                        for model in &models {
                            if let Err(e) = coordinator.pull_model(fetcher.as_ref(), model) {
                                warn!(model = %model, error = %e, "snapshot pull failed");
                            }
                        }
                        last_pull = Some(Instant::now());
                    }
                }
            }));
        }
    }

    /// Returns the local store.
    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Returns the bus client.
    pub fn bus(&self) -> &BusClient {
        &self.bus
    }

    /// Returns the coordinator.
    pub fn coordinator(&self) -> &Arc<SyncCoordinator> {
        &self.coordinator
    }

    /// Returns the outbox.
    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Stops all background work and tears down the connection. Idempotent.
    pub fn close(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.bus.close();
        for handle in self.threads.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.close();
    }
}
