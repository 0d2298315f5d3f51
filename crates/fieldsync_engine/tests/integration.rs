//! End-to-end scenarios through the assembled engine: scripted transport,
//! scripted mutation sender, real store.

use fieldsync_engine::{
    BackoffConfig, BusConfig, ConflictResolution, EngineConfig, MutationAck, MutationSender,
    OutboxConfig, OutboxEntry, RemoteRecord, ScriptStep, ScriptedTransport, SnapshotFetcher,
    SyncEngine, SyncError, SyncResult,
};
use fieldsync_store::{FileBackend, LocalStore, Record, SyncState};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Mutation sender backed by a closure.
struct FnSender<F>(F);

impl<F> MutationSender for FnSender<F>
where
    F: Fn(&OutboxEntry) -> SyncResult<MutationAck> + Send + Sync,
{
    fn send(&self, entry: &OutboxEntry) -> SyncResult<MutationAck> {
        (self.0)(entry)
    }
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn sub_ok() -> ScriptStep {
    ScriptStep::Frame(json!({
        "event_name": "sub_ok",
        "data": {"channels": ["contacts"]}
    }))
}

fn upsert_event(sequence: u64, id: i64, updated_at: u64, name: &str) -> ScriptStep {
    ScriptStep::Frame(json!({
        "event_name": "event",
        "data": {
            "channel": "contacts",
            "sequence": sequence,
            "payload": {
                "model": "contact",
                "op": "upsert",
                "record": {
                    "id": id,
                    "updated_at": updated_at,
                    "fields": {"name": name, "v": sequence}
                }
            }
        }
    }))
}

fn engine_config() -> EngineConfig {
    EngineConfig::new(
        BusConfig::new(["contacts"])
            .with_idle_timeout(Duration::from_secs(2))
            .with_stable_threshold(Duration::from_secs(60))
            .with_backoff(
                BackoffConfig::new(Duration::from_millis(150))
                    .with_max_delay(Duration::from_millis(300))
                    .without_jitter(),
            ),
    )
    .with_outbox(OutboxConfig::new(3))
    .with_drain_interval(Duration::from_millis(20))
}

#[test]
fn offline_create_syncs_after_reconnect() {
    init_tracing();
    let transport = Arc::new(ScriptedTransport::new());
    let store = Arc::new(LocalStore::in_memory().unwrap());
    let sender = Arc::new(FnSender(|_entry: &OutboxEntry| {
        Ok(MutationAck {
            server_id: 42,
            updated_at: 9000,
        })
    }));

    let engine = SyncEngine::new(
        Arc::clone(&store),
        engine_config(),
        Box::new(Arc::clone(&transport)),
        sender,
    );
    engine.start();

    // Offline: no scripted connection yet. The create applies locally with
    // a placeholder id and waits in the outbox.
    let created = engine
        .outbox()
        .create(
            "contact",
            [("name".to_string(), json!("Alice"))].into_iter().collect(),
        )
        .unwrap();
    assert!(created.has_placeholder_id());
    store
        .upsert(Record::new("message", 10).with_field("contact_id", json!(created.id)))
        .unwrap();

    // Connectivity returns.
    transport.push_connection(vec![sub_ok()]);

    assert!(wait_until(Duration::from_secs(5), || {
        store
            .get("contact", 42)
            .is_some_and(|r| r.sync_state == SyncState::Clean)
    }));

    // Exactly one record; the placeholder is gone and references follow.
    assert_eq!(store.record_count("contact"), 1);
    assert_eq!(
        store.get("message", 10).unwrap().field("contact_id"),
        Some(&json!(42))
    );
    engine.close();
}

#[test]
fn reconnect_resumes_from_cursor_and_dedups_replay() {
    init_tracing();
    let transport = Arc::new(ScriptedTransport::new());

    let mut first: Vec<ScriptStep> = vec![sub_ok()];
    for seq in 1..=17 {
        first.push(upsert_event(seq, 1, seq * 1000, "remote"));
    }
    first.push(ScriptStep::Drop);
    transport.push_connection(first);

    // Second connection replays 17 (already applied) and delivers 18.
    transport.push_connection(vec![
        sub_ok(),
        upsert_event(17, 1, 17_000, "remote"),
        upsert_event(18, 1, 18_000, "remote"),
    ]);

    let store = Arc::new(LocalStore::in_memory().unwrap());
    let sender = Arc::new(FnSender(|entry: &OutboxEntry| {
        Err(SyncError::outbox_rejected(entry.request_id, "unused"))
    }));
    let engine = SyncEngine::new(
        Arc::clone(&store),
        engine_config(),
        Box::new(Arc::clone(&transport)),
        sender,
    );
    engine.start();

    assert!(wait_until(Duration::from_secs(5), || {
        store
            .get("contact", 1)
            .is_some_and(|r| r.field("v") == Some(&json!(18)))
    }));

    let stats = engine.coordinator().stats();
    assert_eq!(stats.applied, 18);
    assert_eq!(stats.deduped, 1);

    // The resubscribe asked for replay after the last applied sequence.
    let subscribes = transport.sent();
    assert!(subscribes.len() >= 2);
    assert_eq!(subscribes[1].1.data["last"]["contacts"], json!(17));
    engine.close();
}

#[test]
fn dirty_edit_survives_older_incoming_change() {
    init_tracing();
    let transport = Arc::new(ScriptedTransport::new());
    // Incoming change carries T2 = 2000, older than the local edit at T3.
    transport.push_connection(vec![sub_ok(), upsert_event(1, 1, 2000, "remote")]);

    let store = Arc::new(LocalStore::in_memory().unwrap());
    let mut dirty = Record::new("contact", 1).with_field("name", json!("local"));
    dirty.sync_state = SyncState::Dirty;
    dirty.local_updated_at = 3000;
    store.upsert(dirty).unwrap();

    let sender = Arc::new(FnSender(|entry: &OutboxEntry| {
        Err(SyncError::outbox_rejected(entry.request_id, "unused"))
    }));
    let engine = SyncEngine::new(
        Arc::clone(&store),
        engine_config(),
        Box::new(Arc::clone(&transport)),
        sender,
    );
    engine.start();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.coordinator().stats().discarded == 1
    }));

    let record = store.get("contact", 1).unwrap();
    assert_eq!(record.field("name"), Some(&json!("local")));
    assert_eq!(record.sync_state, SyncState::Dirty);
    engine.close();
}

#[test]
fn newer_incoming_change_becomes_resolvable_conflict() {
    init_tracing();
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_connection(vec![sub_ok(), upsert_event(1, 1, 4000, "remote")]);

    let store = Arc::new(LocalStore::in_memory().unwrap());
    let mut dirty = Record::new("contact", 1).with_field("name", json!("local"));
    dirty.sync_state = SyncState::Dirty;
    dirty.local_updated_at = 3000;
    store.upsert(dirty).unwrap();

    let sender = Arc::new(FnSender(|entry: &OutboxEntry| {
        Err(SyncError::outbox_rejected(entry.request_id, "unused"))
    }));
    let engine = SyncEngine::new(
        Arc::clone(&store),
        engine_config(),
        Box::new(Arc::clone(&transport)),
        sender,
    );
    engine.start();

    assert!(wait_until(Duration::from_secs(5), || {
        engine.coordinator().conflict_count() == 1
    }));

    // Local fields stay on top until someone decides.
    let record = store.get("contact", 1).unwrap();
    assert_eq!(record.field("name"), Some(&json!("local")));
    assert_eq!(record.sync_state, SyncState::Conflict);

    let resolved = engine
        .coordinator()
        .resolve_conflict("contact", 1, ConflictResolution::AcceptRemote)
        .unwrap()
        .unwrap();
    assert_eq!(resolved.field("name"), Some(&json!("remote")));
    assert_eq!(resolved.sync_state, SyncState::Clean);
    engine.close();
}

#[test]
fn interrupted_send_retries_with_same_request_id() {
    init_tracing();
    let store = Arc::new(LocalStore::in_memory().unwrap());
    store.upsert(Record::new("contact", 5)).unwrap();

    let outbox = fieldsync_engine::Outbox::new(Arc::clone(&store), OutboxConfig::new(5));
    outbox
        .update(
            "contact",
            5,
            [("name".to_string(), json!("A"))].into_iter().collect(),
        )
        .unwrap();

    let sent: Arc<Mutex<Vec<OutboxEntry>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&sent);
    let fail_first = FnSender(move |entry: &OutboxEntry| {
        log.lock().push(entry.clone());
        if log.lock().len() == 1 {
            Err(SyncError::connection_lost("socket reset mid-send"))
        } else {
            Ok(MutationAck {
                server_id: 5,
                updated_at: 100,
            })
        }
    });

    outbox.drain_once(&fail_first).unwrap();
    outbox.drain_once(&fail_first).unwrap();

    let sent = sent.lock();
    assert_eq!(sent.len(), 2);
    // The retransmission is byte-for-byte the same mutation, so the server
    // can deduplicate by request id.
    assert_eq!(sent[0].request_id, sent[1].request_id);
    assert_eq!(store.get("contact", 5).unwrap().sync_state, SyncState::Clean);
}

/// Snapshot fetcher returning a fixed record set for every model.
struct FixedFetcher(Vec<RemoteRecord>);

impl SnapshotFetcher for FixedFetcher {
    fn fetch(&self, _model: &str) -> SyncResult<Vec<RemoteRecord>> {
        Ok(self.0.clone())
    }
}

#[test]
fn snapshot_pull_reconciles_rows_the_replay_missed() {
    init_tracing();
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_connection(vec![sub_ok()]);

    let store = Arc::new(LocalStore::in_memory().unwrap());
    // Row 2 was deleted server-side while this client was offline; no
    // channel event for it survives in the replay window.
    let mut stale = Record::new("contact", 2).with_field("name", json!("gone"));
    stale.sync_state = SyncState::Clean;
    store.upsert(stale).unwrap();

    let fetcher = Arc::new(FixedFetcher(vec![RemoteRecord {
        id: 1,
        updated_at: 5000,
        fields: [("name".to_string(), json!("kept"))].into_iter().collect(),
    }]));
    let sender = Arc::new(FnSender(|entry: &OutboxEntry| {
        Err(SyncError::outbox_rejected(entry.request_id, "unused"))
    }));
    let engine = SyncEngine::new(
        Arc::clone(&store),
        engine_config()
            .with_models(["contact"])
            .with_pull_interval(Duration::from_secs(60)),
        Box::new(Arc::clone(&transport)),
        sender,
    )
    .with_snapshot_fetcher(fetcher);
    engine.start();

    // Going active triggers a pull: the server snapshot wins.
    assert!(wait_until(Duration::from_secs(5), || {
        store.get("contact", 2).is_none() && store.get("contact", 1).is_some()
    }));
    assert_eq!(
        store.get("contact", 1).unwrap().field("name"),
        Some(&json!("kept"))
    );
    engine.close();
}

#[test]
fn restart_preserves_queued_request_ids() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("store.json");

    // First run: create while offline, then shut down before anything
    // could be sent.
    let queued_request_id = {
        let transport = Arc::new(ScriptedTransport::new());
        let store = Arc::new(LocalStore::open(Box::new(FileBackend::new(&path))).unwrap());
        let sender = Arc::new(FnSender(|entry: &OutboxEntry| {
            Err(SyncError::outbox_rejected(entry.request_id, "unused"))
        }));
        let engine = SyncEngine::new(
            Arc::clone(&store),
            engine_config().with_models(["contact"]),
            Box::new(transport),
            sender,
        );
        engine.start();
        engine
            .outbox()
            .create(
                "contact",
                [("name".to_string(), json!("Alice"))].into_iter().collect(),
            )
            .unwrap();
        engine.close();

        let rows = store.outbox_rows();
        assert_eq!(rows.len(), 1);
        rows[0]["request_id"].as_str().unwrap().to_string()
    };

    // Second run over the same file: recovery requeues the entry and the
    // drain sends it under the original request id.
    let transport = Arc::new(ScriptedTransport::new());
    transport.push_connection(vec![sub_ok()]);
    let store = Arc::new(LocalStore::open(Box::new(FileBackend::new(&path))).unwrap());

    let sent: Arc<Mutex<Vec<OutboxEntry>>> = Arc::new(Mutex::new(Vec::new()));
    let log = Arc::clone(&sent);
    let sender = Arc::new(FnSender(move |entry: &OutboxEntry| {
        log.lock().push(entry.clone());
        Ok(MutationAck {
            server_id: 42,
            updated_at: 9000,
        })
    }));
    let engine = SyncEngine::new(
        Arc::clone(&store),
        engine_config().with_models(["contact"]),
        Box::new(Arc::clone(&transport)),
        sender,
    );
    engine.start();

    assert!(wait_until(Duration::from_secs(5), || {
        store
            .get("contact", 42)
            .is_some_and(|r| r.sync_state == SyncState::Clean)
    }));

    let sent = sent.lock();
    assert_eq!(sent[0].request_id.to_string(), queued_request_id);
    engine.close();
}
