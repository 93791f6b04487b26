use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use relay_core::channel::{
    AccountHandle, ChannelAdapter, CryptoStore, DecryptOutcome, OutboundTarget, SendOpts,
    SyncBatch,
};
use relay_core::config::{Config, DmPolicy, GroupPolicy, IntentConfig};
use relay_core::error::CoreError;
use relay_core::event::{ChannelEvent, MediaAttachment};
use relay_core::run::RunConfig;
use relay_core::session::SessionKey;
use relay_scheduler::SubmitOutcome;

use crate::monitor::{Dispatch, Monitor, MonitorState};

type BatchResult = Result<SyncBatch, CoreError>;

struct FakeAdapter {
    batches: tokio::sync::Mutex<mpsc::UnboundedReceiver<BatchResult>>,
    start_calls: AtomicU32,
    stop_calls: AtomicU32,
    reauth_calls: AtomicU32,
}

impl FakeAdapter {
    fn new() -> (Arc<Self>, mpsc::UnboundedSender<BatchResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                batches: tokio::sync::Mutex::new(rx),
                start_calls: AtomicU32::new(0),
                stop_calls: AtomicU32::new(0),
                reauth_calls: AtomicU32::new(0),
            }),
            tx,
        )
    }
}

#[async_trait]
impl ChannelAdapter for FakeAdapter {
    async fn start_account(&self, account_id: &str) -> Result<AccountHandle, CoreError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        Ok(AccountHandle {
            account_id: account_id.into(),
        })
    }

    async fn stop_account(&self, _handle: &AccountHandle) -> Result<(), CoreError> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn poll(
        &self,
        _handle: &AccountHandle,
        _cursor: Option<&str>,
        _timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<SyncBatch, CoreError> {
        let mut rx = self.batches.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => Err(CoreError::Cancelled),
            item = rx.recv() => item.unwrap_or(Err(CoreError::Cancelled)),
        }
    }

    async fn send_text(
        &self,
        _target: &OutboundTarget,
        _text: &str,
        _opts: &SendOpts,
    ) -> Result<String, CoreError> {
        Ok("$sent".into())
    }

    async fn send_media(
        &self,
        _target: &OutboundTarget,
        _media: &MediaAttachment,
        _opts: &SendOpts,
    ) -> Result<String, CoreError> {
        Ok("$sent".into())
    }

    async fn reauth(&self, _handle: &AccountHandle) -> Result<(), CoreError> {
        self.reauth_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn display_name(
        &self,
        _handle: &AccountHandle,
        _user_id: &str,
    ) -> Result<Option<String>, CoreError> {
        Ok(None)
    }
}

struct FakeCrypto {
    plaintexts: Mutex<HashMap<String, String>>,
    backups: Mutex<HashMap<String, String>>,
    log: Mutex<Vec<String>>,
    close_calls: AtomicU32,
}

impl FakeCrypto {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            plaintexts: Mutex::new(HashMap::new()),
            backups: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
            close_calls: AtomicU32::new(0),
        })
    }

    fn learn_key(&self, event_id: &str, plaintext: &str) {
        self.plaintexts
            .lock()
            .unwrap()
            .insert(event_id.into(), plaintext.into());
    }

    fn backup(&self, event_id: &str, plaintext: &str) {
        self.backups
            .lock()
            .unwrap()
            .insert(event_id.into(), plaintext.into());
    }
}

#[async_trait]
impl CryptoStore for FakeCrypto {
    async fn ingest_pre_timeline(&self, items: &[serde_json::Value]) -> Result<(), CoreError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("pre_timeline:{}", items.len()));
        Ok(())
    }

    async fn decrypt(&self, event: &ChannelEvent) -> Result<DecryptOutcome, CoreError> {
        self.log
            .lock()
            .unwrap()
            .push(format!("decrypt:{}", event.event_id));
        match self.plaintexts.lock().unwrap().get(&event.event_id) {
            Some(plaintext) => Ok(DecryptOutcome::Plaintext(plaintext.clone())),
            None => Ok(DecryptOutcome::Undecryptable),
        }
    }

    async fn restore_from_backup(
        &self,
        event: &ChannelEvent,
    ) -> Result<Option<String>, CoreError> {
        Ok(self.backups.lock().unwrap().get(&event.event_id).cloned())
    }

    async fn close(&self) -> Result<(), CoreError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct RecordingDispatch {
    submissions: Mutex<Vec<(String, String)>>,
}

impl RecordingDispatch {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            submissions: Mutex::new(Vec::new()),
        })
    }

    fn count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    fn all(&self) -> Vec<(String, String)> {
        self.submissions.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatch for RecordingDispatch {
    async fn submit(
        &self,
        key: SessionKey,
        prompt: String,
        _config: RunConfig,
    ) -> SubmitOutcome {
        self.submissions
            .lock()
            .unwrap()
            .push((key.to_string(), prompt));
        SubmitOutcome::Started {
            run_id: "run".into(),
        }
    }
}

fn build(
    data_dir: &Path,
    adapter: Arc<FakeAdapter>,
    crypto: Arc<FakeCrypto>,
    dispatch: Arc<RecordingDispatch>,
    configure: impl FnOnce(&mut Config),
) -> Arc<Monitor> {
    let mut config = Config::default();
    config.retry.min_delay_ms = 10;
    config.retry.max_delay_ms = 40;
    config.retry.jitter = 0.0;
    configure(&mut config);
    Monitor::new(
        "matrix",
        "acct-1",
        "main",
        &config,
        data_dir,
        adapter,
        crypto,
        dispatch,
    )
}

fn evt(id: &str, room: &str, body: &str) -> ChannelEvent {
    ChannelEvent {
        channel_id: "matrix".into(),
        room_id: room.into(),
        thread_id: None,
        event_id: id.into(),
        sender_id: "@alice:example.org".into(),
        body: body.into(),
        media: vec![],
        timestamp_ms: 1_700_000_000_000,
        is_own_message: false,
        encrypted: false,
        is_direct: true,
        is_notice: false,
    }
}

fn encrypted_evt(id: &str, room: &str) -> ChannelEvent {
    let mut event = evt(id, room, "<encrypted>");
    event.encrypted = true;
    event
}

fn batch(cursor: &str, timeline: Vec<ChannelEvent>) -> BatchResult {
    Ok(SyncBatch {
        next_cursor: cursor.into(),
        pre_timeline: vec![],
        timeline,
    })
}

async fn wait_until(what: &str, predicate: impl Fn() -> bool) {
    for _ in 0..500 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn events_dispatch_in_arrival_order_with_dedup() {
    let tmp = tempfile::tempdir().unwrap();
    let (adapter, batches) = FakeAdapter::new();
    let crypto = FakeCrypto::new();
    let dispatch = RecordingDispatch::new();
    let monitor = build(tmp.path(), adapter, crypto, dispatch.clone(), |_| {});

    monitor.start().await.unwrap();
    batches
        .send(batch(
            "c1",
            vec![evt("$e1", "!room", "one"), evt("$e2", "!room", "two")],
        ))
        .unwrap();
    batches
        .send(batch(
            "c2",
            vec![evt("$e1", "!room", "one"), evt("$e3", "!room", "three")],
        ))
        .unwrap();

    let d = dispatch.clone();
    wait_until("three dispatches", move || d.count() == 3).await;
    let prompts: Vec<String> = dispatch.all().into_iter().map(|(_, p)| p).collect();
    assert_eq!(prompts, vec!["one", "two", "three"]);

    monitor.close().await;
    assert_eq!(dispatch.count(), 3, "duplicate $e1 was rejected");
}

#[tokio::test]
async fn start_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let (adapter, _batches) = FakeAdapter::new();
    let monitor = build(
        tmp.path(),
        adapter.clone(),
        FakeCrypto::new(),
        RecordingDispatch::new(),
        |_| {},
    );

    monitor.start().await.unwrap();
    monitor.start().await.unwrap();
    assert_eq!(adapter.start_calls.load(Ordering::SeqCst), 1);

    monitor.close().await;
}

#[tokio::test]
async fn close_is_idempotent() {
    let tmp = tempfile::tempdir().unwrap();
    let (adapter, _batches) = FakeAdapter::new();
    let crypto = FakeCrypto::new();
    let monitor = build(
        tmp.path(),
        adapter.clone(),
        crypto.clone(),
        RecordingDispatch::new(),
        |_| {},
    );

    monitor.start().await.unwrap();
    monitor.close().await;
    monitor.close().await;

    assert_eq!(monitor.state(), MonitorState::Stopped);
    assert_eq!(adapter.stop_calls.load(Ordering::SeqCst), 1);
    assert_eq!(crypto.close_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dedup_survives_restart() {
    let tmp = tempfile::tempdir().unwrap();

    {
        let (adapter, batches) = FakeAdapter::new();
        let dispatch = RecordingDispatch::new();
        let monitor = build(
            tmp.path(),
            adapter,
            FakeCrypto::new(),
            dispatch.clone(),
            |_| {},
        );
        monitor.start().await.unwrap();
        batches
            .send(batch("c1", vec![evt("$e1", "!room", "first life")]))
            .unwrap();
        let d = dispatch.clone();
        wait_until("dispatch in first life", move || d.count() == 1).await;
        monitor.close().await;
    }

    // The adapter redelivers $e1 after the restart; the persisted dedup
    // set rejects it while the new event still flows.
    let (adapter, batches) = FakeAdapter::new();
    let dispatch = RecordingDispatch::new();
    let monitor = build(
        tmp.path(),
        adapter,
        FakeCrypto::new(),
        dispatch.clone(),
        |_| {},
    );
    monitor.start().await.unwrap();
    batches
        .send(batch(
            "c2",
            vec![evt("$e1", "!room", "first life"), evt("$e2", "!room", "fresh")],
        ))
        .unwrap();

    let d = dispatch.clone();
    wait_until("fresh dispatch", move || d.count() == 1).await;
    assert_eq!(dispatch.all()[0].1, "fresh");
    monitor.close().await;
    assert_eq!(dispatch.count(), 1);
}

#[tokio::test]
async fn encrypted_events_are_decrypted_before_dispatch() {
    let tmp = tempfile::tempdir().unwrap();
    let (adapter, batches) = FakeAdapter::new();
    let crypto = FakeCrypto::new();
    crypto.learn_key("$e1", "the secret plan");
    let dispatch = RecordingDispatch::new();
    let monitor = build(tmp.path(), adapter, crypto, dispatch.clone(), |_| {});

    monitor.start().await.unwrap();
    batches
        .send(batch("c1", vec![encrypted_evt("$e1", "!room")]))
        .unwrap();

    let d = dispatch.clone();
    wait_until("decrypted dispatch", move || d.count() == 1).await;
    assert_eq!(dispatch.all()[0].1, "the secret plan");
    monitor.close().await;
}

#[tokio::test]
async fn utd_event_dispatches_once_keys_arrive() {
    let tmp = tempfile::tempdir().unwrap();
    let (adapter, batches) = FakeAdapter::new();
    let crypto = FakeCrypto::new();
    let dispatch = RecordingDispatch::new();
    let monitor = build(tmp.path(), adapter, crypto.clone(), dispatch.clone(), |_| {});

    monitor.start().await.unwrap();
    batches
        .send(batch("c1", vec![encrypted_evt("$e1", "!room")]))
        .unwrap();

    let m = monitor.clone();
    wait_until("event parked", move || m.utd_backlog() == 1).await;
    assert_eq!(dispatch.count(), 0);

    // The key shows up (e.g. via a to-device message); the next sync
    // iteration retries the queue.
    crypto.learn_key("$e1", "now readable");
    batches.send(batch("c2", vec![])).unwrap();

    let d = dispatch.clone();
    wait_until("UTD retry dispatch", move || d.count() == 1).await;
    assert_eq!(dispatch.all()[0].1, "now readable");
    assert_eq!(monitor.utd_backlog(), 0);
    monitor.close().await;
}

#[tokio::test(start_paused = true)]
async fn utd_events_expire_after_the_hard_limit() {
    let tmp = tempfile::tempdir().unwrap();
    let (adapter, batches) = FakeAdapter::new();
    let dispatch = RecordingDispatch::new();
    let monitor = build(
        tmp.path(),
        adapter,
        FakeCrypto::new(),
        dispatch.clone(),
        |_| {},
    );

    monitor.start().await.unwrap();
    batches
        .send(batch("c1", vec![encrypted_evt("$e1", "!room")]))
        .unwrap();
    let m = monitor.clone();
    wait_until("event parked", move || m.utd_backlog() == 1).await;

    tokio::time::advance(Duration::from_secs(3_601)).await;
    batches.send(batch("c2", vec![])).unwrap();

    let m = monitor.clone();
    wait_until("expiry drop", move || m.utd_backlog() == 0).await;
    assert_eq!(dispatch.count(), 0);
    monitor.close().await;
}

#[tokio::test]
async fn key_backup_fallback_after_retry_budget() {
    let tmp = tempfile::tempdir().unwrap();
    let (adapter, batches) = FakeAdapter::new();
    let crypto = FakeCrypto::new();
    crypto.backup("$e1", "restored from backup");
    let dispatch = RecordingDispatch::new();
    let monitor = build(tmp.path(), adapter, crypto, dispatch.clone(), |config| {
        config.monitor.utd_max_retries = 0;
    });

    monitor.start().await.unwrap();
    batches
        .send(batch("c1", vec![encrypted_evt("$e1", "!room")]))
        .unwrap();
    batches.send(batch("c2", vec![])).unwrap();

    let d = dispatch.clone();
    wait_until("backup dispatch", move || d.count() == 1).await;
    assert_eq!(dispatch.all()[0].1, "restored from backup");
    monitor.close().await;
}

#[tokio::test]
async fn disallowed_senders_are_dropped_silently() {
    let tmp = tempfile::tempdir().unwrap();
    let (adapter, batches) = FakeAdapter::new();
    let dispatch = RecordingDispatch::new();
    let monitor = build(
        tmp.path(),
        adapter,
        FakeCrypto::new(),
        dispatch.clone(),
        |config| {
            let channel = config.channels.entry("matrix".into()).or_default();
            channel.policy = DmPolicy::Allowlist;
            channel.group_policy = GroupPolicy::Open;
        },
    );

    monitor.start().await.unwrap();
    let mut group_event = evt("$e2", "!room", "group hello");
    group_event.is_direct = false;
    batches
        .send(batch(
            "c1",
            vec![evt("$e1", "!room", "dm hello"), group_event],
        ))
        .unwrap();

    let d = dispatch.clone();
    wait_until("group dispatch", move || d.count() == 1).await;
    assert_eq!(dispatch.all()[0].1, "group hello");
    monitor.close().await;
    assert_eq!(dispatch.count(), 1, "the DM was dropped");
}

#[tokio::test]
async fn notices_and_own_messages_never_dispatch() {
    let tmp = tempfile::tempdir().unwrap();
    let (adapter, batches) = FakeAdapter::new();
    let dispatch = RecordingDispatch::new();
    let monitor = build(
        tmp.path(),
        adapter,
        FakeCrypto::new(),
        dispatch.clone(),
        |_| {},
    );

    monitor.start().await.unwrap();
    let mut notice = evt("$e1", "!room", "automated notice");
    notice.is_notice = true;
    let mut own = evt("$e2", "!room", "my own echo");
    own.is_own_message = true;
    batches
        .send(batch(
            "c1",
            vec![notice, own, evt("$e3", "!room", "real message")],
        ))
        .unwrap();

    let d = dispatch.clone();
    wait_until("real dispatch", move || d.count() == 1).await;
    assert_eq!(dispatch.all()[0].1, "real message");
    monitor.close().await;
    assert_eq!(dispatch.count(), 1);
}

#[tokio::test]
async fn soft_logout_pauses_reauths_and_resumes() {
    let tmp = tempfile::tempdir().unwrap();
    let (adapter, batches) = FakeAdapter::new();
    let dispatch = RecordingDispatch::new();
    let monitor = build(
        tmp.path(),
        adapter.clone(),
        FakeCrypto::new(),
        dispatch.clone(),
        |_| {},
    );

    monitor.start().await.unwrap();
    batches.send(Err(CoreError::Unauthorized)).unwrap();
    batches
        .send(batch("c1", vec![evt("$e1", "!room", "after reauth")]))
        .unwrap();

    let d = dispatch.clone();
    wait_until("dispatch after reauth", move || d.count() == 1).await;
    assert!(adapter.reauth_calls.load(Ordering::SeqCst) >= 1);
    assert_eq!(monitor.state(), MonitorState::Running);
    monitor.close().await;
}

#[tokio::test]
async fn pre_timeline_state_is_ingested_before_decryption() {
    let tmp = tempfile::tempdir().unwrap();
    let (adapter, batches) = FakeAdapter::new();
    let crypto = FakeCrypto::new();
    crypto.learn_key("$e1", "hello");
    let dispatch = RecordingDispatch::new();
    let monitor = build(tmp.path(), adapter, crypto.clone(), dispatch.clone(), |_| {});

    monitor.start().await.unwrap();
    batches
        .send(Ok(SyncBatch {
            next_cursor: "c1".into(),
            pre_timeline: vec![serde_json::json!({"type": "m.room_key"})],
            timeline: vec![encrypted_evt("$e1", "!room")],
        }))
        .unwrap();

    let d = dispatch.clone();
    wait_until("dispatch", move || d.count() == 1).await;
    let log = crypto.log.lock().unwrap().clone();
    assert_eq!(log[0], "pre_timeline:1");
    assert_eq!(log[1], "decrypt:$e1");
    monitor.close().await;
}

#[tokio::test]
async fn routed_intents_delegate_to_background_agents_too() {
    let tmp = tempfile::tempdir().unwrap();
    let (adapter, batches) = FakeAdapter::new();
    let dispatch = RecordingDispatch::new();
    let monitor = build(
        tmp.path(),
        adapter,
        FakeCrypto::new(),
        dispatch.clone(),
        |config| {
            config.router.intents.insert(
                "research".into(),
                IntentConfig {
                    keywords: vec!["investigate".into()],
                    primary: Some("researcher".into()),
                    background: Some("archivist".into()),
                    template: "Research task: {input}".into(),
                    mode: relay_core::config::DelegationMode::Blocking,
                },
            );
        },
    );

    monitor.start().await.unwrap();
    batches
        .send(batch(
            "c1",
            vec![evt("$e1", "!room", "please investigate the outage")],
        ))
        .unwrap();

    let d = dispatch.clone();
    wait_until("both dispatches", move || d.count() == 2).await;
    let submissions = dispatch.all();
    assert!(submissions[0].0.starts_with("agent:researcher:dm:"));
    assert_eq!(
        submissions[0].1,
        "Research task: please investigate the outage"
    );
    assert!(submissions[1].0.starts_with("agent:archivist:dm:"));
    monitor.close().await;
}
