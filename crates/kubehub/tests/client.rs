use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ksync_core::config::{QueueConfig, ResourceConfig};
use ksync_core::hash::canonical_hash;
use ksync_core::patch::apply_merge_patch;
use ksync_core::{filter_and_marshal, Callbacks, ResourceIdentity, SyncError, SyncStrategy, WatchEvent};
use ksync_kubehub::{ClientState, MemoryCluster, MemoryResource, Op, ResourceClient, RetryPolicy};
use serde_json::{json, Value as Json};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Added(String, Json),
    Deleted(String),
    Put(String, Json),
    Patch(String, String, Vec<u8>),
}

#[derive(Default)]
struct Recorder {
    calls: Mutex<Vec<Call>>,
    fail: AtomicBool,
}

impl Recorder {
    fn calls(&self) -> Vec<Call> { self.calls.lock().unwrap().clone() }

    fn record(&self, call: Call) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("transport down");
        }
        self.calls.lock().unwrap().push(call);
        Ok(())
    }
}

#[async_trait::async_trait]
impl Callbacks for Recorder {
    async fn object_added(&self, id: &ResourceIdentity, object: &[u8]) -> anyhow::Result<()> {
        self.record(Call::Added(id.name.clone(), serde_json::from_slice(object)?))
    }
    async fn object_deleted(&self, id: &ResourceIdentity) -> anyhow::Result<()> {
        self.record(Call::Deleted(id.name.clone()))
    }
    async fn put_object(&self, id: &ResourceIdentity, object: &[u8]) -> anyhow::Result<()> {
        self.record(Call::Put(id.name.clone(), serde_json::from_slice(object)?))
    }
    async fn patch_object(&self, id: &ResourceIdentity, checksum: &str, patch: &[u8]) -> anyhow::Result<()> {
        self.record(Call::Patch(id.name.clone(), checksum.to_string(), patch.to_vec()))
    }
    async fn get_object(&self, _id: &ResourceIdentity, _base: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

fn configmaps(strategy: SyncStrategy, list_first: bool) -> ResourceConfig {
    ResourceConfig {
        group: String::new(),
        version: "v1".into(),
        resource: "configmaps".into(),
        kind: Some("ConfigMap".into()),
        strategy,
        list_first,
    }
}

fn cm(name: &str, value: &str) -> Json {
    json!({"apiVersion": "v1", "kind": "ConfigMap", "metadata": {"name": name, "namespace": "ns"}, "data": {"k": value}})
}

struct Fixture {
    cluster: Arc<MemoryResource>,
    callbacks: Arc<Recorder>,
    client: Arc<ResourceClient>,
}

fn fixture(strategy: SyncStrategy, list_first: bool) -> Fixture {
    let cfg = configmaps(strategy, list_first);
    let cluster = MemoryCluster::new().resource(&cfg.kind_descriptor());
    let callbacks = Arc::new(Recorder::default());
    let client = ResourceClient::new("c1", &cfg, cluster.clone(), callbacks.clone(), CancellationToken::new())
        .with_queue(QueueConfig { capacity: 16, cooldown_ms: 100 })
        .with_retry_policy(RetryPolicy { initial: Duration::from_millis(10), max: Duration::from_millis(100), multiplier: 2.0 });
    Fixture { cluster, callbacks, client: Arc::new(client) }
}

fn id(f: &Fixture, name: &str) -> ResourceIdentity {
    ResourceIdentity::new("c1", f.client.kind().clone(), format!("ns/{name}"))
}

fn live_bytes(f: &Fixture, name: &str) -> Vec<u8> {
    filter_and_marshal(f.cluster.object("ns", name).expect("object")).unwrap()
}

async fn wait_watching(client: &ResourceClient) {
    let mut st = client.subscribe_state();
    st.wait_for(|s| *s == ClientState::Watching).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn watch_events_reach_callbacks_after_cooldown() {
    let f = fixture(SyncStrategy::FullReplace, false);
    let run = tokio::spawn({
        let client = f.client.clone();
        async move { client.run().await }
    });
    wait_watching(&f.client).await;
    assert_eq!(f.cluster.watch_versions(), vec![None]);

    f.cluster.apply(cm("a", "1"));
    f.cluster.apply(cm("a", "2"));
    f.cluster.apply(cm("a", "3"));
    f.cluster.remove("ns", "a");
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(f.callbacks.calls().is_empty(), "events are held for the cooldown");

    tokio::time::sleep(Duration::from_millis(100)).await;
    let calls = f.callbacks.calls();
    assert_eq!(calls.len(), 3);
    assert!(matches!(&calls[0], Call::Added(n, o) if n == "ns/a" && o["data"]["k"] == "1"));
    // two MODIFIED events collapse into the latest
    assert!(matches!(&calls[1], Call::Added(n, o) if n == "ns/a" && o["data"]["k"] == "3"));
    assert_eq!(calls[2], Call::Deleted("ns/a".into()));

    f.cluster.close_watches();
    run.await.unwrap().unwrap();
    assert_eq!(f.client.state(), ClientState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn list_first_fetches_each_object_and_watches_from_list_version() {
    let f = fixture(SyncStrategy::FullReplace, true);
    f.cluster.seed(cm("a", "1"));
    f.cluster.seed(cm("b", "2"));
    f.cluster.set_list_bodies(false);

    let run = tokio::spawn({
        let client = f.client.clone();
        async move { client.run().await }
    });
    wait_watching(&f.client).await;

    let calls = f.callbacks.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(&calls[0], Call::Added(n, o) if n == "ns/a" && o["data"]["k"] == "1"));
    assert!(matches!(&calls[1], Call::Added(n, o) if n == "ns/b" && o["data"]["k"] == "2"));
    assert_eq!(f.cluster.mutations().gets, 2);
    assert_eq!(f.cluster.watch_versions(), vec![Some("3".to_string())]);

    f.cluster.close_watches();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn watch_error_event_stops_the_loop() {
    let f = fixture(SyncStrategy::FullReplace, false);
    let run = tokio::spawn({
        let client = f.client.clone();
        async move { client.run().await }
    });
    wait_watching(&f.client).await;
    f.cluster.apply(cm("a", "1"));
    f.cluster.emit(WatchEvent::Error("too old resource version".into()));
    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, SyncError::Watch(msg) if msg.contains("too old")));
    assert_eq!(f.client.state(), ClientState::Stopped);
    // the event seen before the error still went out
    assert!(matches!(&f.callbacks.calls()[..], [Call::Added(n, _)] if n == "ns/a"));
}

#[tokio::test(start_paused = true)]
async fn events_cooling_down_are_delivered_when_watch_closes() {
    let f = fixture(SyncStrategy::Patch, false);
    f.cluster.seed(cm("a", "1"));
    f.client.get_object(&id(&f, "a"), b"").await.unwrap();
    let run = tokio::spawn({
        let client = f.client.clone();
        async move { client.run().await }
    });
    wait_watching(&f.client).await;

    f.cluster.remove("ns", "a");
    tokio::time::sleep(Duration::from_millis(10)).await;
    f.cluster.close_watches();
    run.await.unwrap().unwrap();

    assert_eq!(f.callbacks.calls().last(), Some(&Call::Deleted("ns/a".into())));
    assert_eq!(f.client.shadow_entry("ns/a").await, None);
}

#[tokio::test(start_paused = true)]
async fn cancellation_discards_events_cooling_down() {
    let cfg = configmaps(SyncStrategy::FullReplace, false);
    let cluster = MemoryCluster::new().resource(&cfg.kind_descriptor());
    let cancel = CancellationToken::new();
    let callbacks = Arc::new(Recorder::default());
    let client = Arc::new(
        ResourceClient::new("c1", &cfg, cluster.clone(), callbacks.clone(), cancel.clone())
            .with_queue(QueueConfig { capacity: 16, cooldown_ms: 100 }),
    );
    let run = tokio::spawn({
        let client = client.clone();
        async move { client.run().await }
    });
    wait_watching(&client).await;
    cluster.apply(cm("a", "1"));
    tokio::time::sleep(Duration::from_millis(10)).await;
    cancel.cancel();
    run.await.unwrap().unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert!(callbacks.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn watch_without_cursor_announces_existing_objects() {
    let f = fixture(SyncStrategy::FullReplace, false);
    f.cluster.seed(cm("a", "1"));
    f.cluster.seed(cm("b", "2"));
    let run = tokio::spawn({
        let client = f.client.clone();
        async move { client.run().await }
    });
    wait_watching(&f.client).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let calls = f.callbacks.calls();
    assert_eq!(calls.len(), 2);
    assert!(matches!(&calls[0], Call::Added(n, o) if n == "ns/a" && o["data"]["k"] == "1"));
    assert!(matches!(&calls[1], Call::Added(n, o) if n == "ns/b" && o["data"]["k"] == "2"));
    assert_eq!(f.cluster.mutations().lists, 0);

    f.cluster.close_watches();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn callback_failures_do_not_stop_the_loop() {
    let f = fixture(SyncStrategy::FullReplace, false);
    let run = tokio::spawn({
        let client = f.client.clone();
        async move { client.run().await }
    });
    wait_watching(&f.client).await;
    f.callbacks.fail.store(true, Ordering::SeqCst);
    f.cluster.apply(cm("a", "1"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    f.callbacks.fail.store(false, Ordering::SeqCst);
    f.cluster.apply(cm("b", "1"));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(f.callbacks.calls().len(), 1);
    f.cluster.close_watches();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn cancellation_ends_run_cleanly() {
    let cfg = configmaps(SyncStrategy::FullReplace, false);
    let cluster = MemoryCluster::new().resource(&cfg.kind_descriptor());
    let cancel = CancellationToken::new();
    let client = Arc::new(ResourceClient::new("c1", &cfg, cluster.clone(), Arc::new(Recorder::default()), cancel.clone()));
    let run = tokio::spawn({
        let client = client.clone();
        async move { client.run().await }
    });
    wait_watching(&client).await;
    cancel.cancel();
    run.await.unwrap().unwrap();
    assert_eq!(cluster.open_watches(), 0);
}

#[tokio::test]
async fn full_replace_get_object_always_puts() {
    let f = fixture(SyncStrategy::FullReplace, false);
    f.cluster.seed(cm("a", "1"));
    f.client.get_object(&id(&f, "a"), b"").await.unwrap();
    f.client.get_object(&id(&f, "a"), b"").await.unwrap();
    let calls = f.callbacks.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|c| matches!(c, Call::Put(n, _) if n == "ns/a")));
    assert_eq!(f.client.shadow_len().await, 0);
}

#[tokio::test]
async fn patch_kind_puts_first_then_patches_against_shadow() {
    let f = fixture(SyncStrategy::Patch, false);
    f.cluster.seed(cm("a", "1"));
    f.client.get_object(&id(&f, "a"), b"").await.unwrap();
    let first = live_bytes(&f, "a");
    assert_eq!(f.client.shadow_entry("ns/a").await, Some(first.clone()));

    f.cluster.seed(cm("a", "2"));
    f.client.get_object(&id(&f, "a"), b"").await.unwrap();
    let second = live_bytes(&f, "a");

    let calls = f.callbacks.calls();
    assert!(matches!(&calls[0], Call::Put(n, _) if n == "ns/a"));
    let Call::Patch(name, checksum, patch) = &calls[1] else { panic!("expected a patch, got {:?}", calls[1]) };
    assert_eq!(name, "ns/a");
    assert_eq!(checksum, &canonical_hash(&second).unwrap());
    let rebuilt = apply_merge_patch(&first, patch).unwrap();
    assert_eq!(canonical_hash(&rebuilt).unwrap(), *checksum);
    assert_eq!(f.client.shadow_entry("ns/a").await, Some(second));
}

#[tokio::test]
async fn base_object_replaces_shadow_before_diffing() {
    let f = fixture(SyncStrategy::Patch, false);
    f.cluster.seed(cm("a", "live"));
    let base = serde_json::to_vec(&cm("a", "remote")).unwrap();
    f.client.get_object(&id(&f, "a"), &base).await.unwrap();

    let calls = f.callbacks.calls();
    let Call::Patch(_, checksum, patch) = &calls[0] else { panic!("expected a patch, got {:?}", calls[0]) };
    let rebuilt = apply_merge_patch(&base, patch).unwrap();
    assert_eq!(canonical_hash(&rebuilt).unwrap(), *checksum);
    let patch: Json = serde_json::from_slice(patch).unwrap();
    assert_eq!(patch["data"]["k"], "live");
}

#[tokio::test]
async fn failed_delivery_does_not_advance_shadow() {
    let f = fixture(SyncStrategy::Patch, false);
    f.cluster.seed(cm("a", "1"));
    f.callbacks.fail.store(true, Ordering::SeqCst);
    let err = f.client.get_object(&id(&f, "a"), b"").await.unwrap_err();
    assert!(matches!(err, SyncError::Callback { op: "put object", .. }));
    assert_eq!(f.client.shadow_entry("ns/a").await, None);
}

#[tokio::test(start_paused = true)]
async fn transient_get_failures_are_retried() {
    let f = fixture(SyncStrategy::FullReplace, false);
    f.cluster.seed(cm("a", "1"));
    f.cluster.fail_next(Op::Get, Some(503));
    f.cluster.fail_next(Op::Get, None);
    f.client.get_object(&id(&f, "a"), b"").await.unwrap();
    assert_eq!(f.cluster.mutations().gets, 3);
    assert_eq!(f.callbacks.calls().len(), 1);
}

#[tokio::test]
async fn missing_object_fails_without_retry() {
    let f = fixture(SyncStrategy::FullReplace, false);
    let err = f.client.get_object(&id(&f, "ghost"), b"").await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(f.cluster.mutations().gets, 1);
}

#[tokio::test]
async fn patch_object_applies_verifies_and_persists() {
    let f = fixture(SyncStrategy::Patch, false);
    f.cluster.seed(cm("a", "1"));
    let base = live_bytes(&f, "a");
    let patch = br#"{"data":{"k":"2","extra":"x"}}"#;
    let expected = canonical_hash(&apply_merge_patch(&base, patch).unwrap()).unwrap();

    f.client.patch_object(&id(&f, "a"), &expected, patch).await.unwrap();

    let live = f.cluster.object("ns", "a").unwrap();
    assert_eq!(live["data"], json!({"k": "2", "extra": "x"}));
    let m = f.cluster.mutations();
    assert_eq!((m.creates, m.replaces), (1, 1));
    let shadow = f.client.shadow_entry("ns/a").await.unwrap();
    assert_eq!(canonical_hash(&shadow).unwrap(), expected);
}

#[tokio::test]
async fn patch_checksum_mismatch_returns_base_and_leaves_cluster_alone() {
    let f = fixture(SyncStrategy::Patch, false);
    f.cluster.seed(cm("a", "1"));
    let base = live_bytes(&f, "a");

    let err = f.client.patch_object(&id(&f, "a"), "deadbeef", br#"{"data":{"k":"2"}}"#).await.unwrap_err();
    assert!(matches!(err.source, SyncError::ChecksumMismatch { ref expected, .. } if expected == "deadbeef"));
    assert_eq!(err.base_object, Some(base));
    assert_eq!(f.cluster.mutations().replaces, 0);
    assert_eq!(f.cluster.object("ns", "a").unwrap()["data"]["k"], "1");
    assert_eq!(f.client.shadow_len().await, 0);
}

#[tokio::test]
async fn malformed_patch_returns_base() {
    let f = fixture(SyncStrategy::Patch, false);
    f.cluster.seed(cm("a", "1"));
    let err = f.client.patch_object(&id(&f, "a"), "x", b"not json").await.unwrap_err();
    assert!(matches!(err.source, SyncError::PatchApply(_)));
    assert!(err.base_object.is_some());
}

#[tokio::test]
async fn patch_is_rejected_for_full_replace_kinds() {
    let f = fixture(SyncStrategy::FullReplace, false);
    f.cluster.seed(cm("a", "1"));
    let err = f.client.patch_object(&id(&f, "a"), "x", b"{}").await.unwrap_err();
    assert!(matches!(err.source, SyncError::StrategyNotEnabled(_)));
    assert!(err.base_object.is_none());
    assert_eq!(f.cluster.mutations().gets, 0);
}

#[tokio::test]
async fn put_object_creates_or_replaces() {
    let f = fixture(SyncStrategy::FullReplace, false);
    let a = id(&f, "a");
    f.client.put_object(&a, &serde_json::to_vec(&cm("a", "1")).unwrap()).await.unwrap();
    f.client.put_object(&a, &serde_json::to_vec(&cm("a", "2")).unwrap()).await.unwrap();
    assert_eq!(f.cluster.object("ns", "a").unwrap()["data"]["k"], "2");
    assert!(matches!(f.client.put_object(&a, b"{").await, Err(SyncError::Marshal(_))));
}

#[tokio::test]
async fn put_object_rejects_a_body_for_another_object() {
    let f = fixture(SyncStrategy::FullReplace, false);
    let a = id(&f, "a");

    let err = f.client.put_object(&a, &serde_json::to_vec(&cm("b", "1")).unwrap()).await.unwrap_err();
    assert!(matches!(err, SyncError::Permanent(ref m) if m.contains("ns/b")), "{err}");
    let other_ns = json!({"metadata": {"name": "a", "namespace": "other"}});
    let err = f.client.put_object(&a, &serde_json::to_vec(&other_ns).unwrap()).await.unwrap_err();
    assert!(err.is_permanent());
    let unnamed = f.client.put_object(&a, br#"{"metadata":{}}"#).await.unwrap_err();
    assert!(unnamed.is_permanent());

    assert_eq!(f.cluster.mutations(), Default::default());
    assert!(f.cluster.is_empty());
}

#[tokio::test]
async fn verify_object_compares_canonical_hashes() {
    let f = fixture(SyncStrategy::FullReplace, false);
    f.cluster.seed(cm("a", "1"));
    let live = live_bytes(&f, "a");
    let checksum = canonical_hash(&live).unwrap();

    assert_eq!(f.client.verify_object(&id(&f, "a"), &checksum).await.unwrap(), live);
    let err = f.client.verify_object(&id(&f, "a"), "0000").await.unwrap_err();
    assert!(matches!(err.source, SyncError::ChecksumMismatch { .. }));
    assert_eq!(err.base_object, Some(live));
}

#[tokio::test]
async fn failed_delete_restores_shadow_entry() {
    let f = fixture(SyncStrategy::Patch, false);
    f.cluster.seed(cm("a", "1"));
    f.client.get_object(&id(&f, "a"), b"").await.unwrap();
    let shadow = f.client.shadow_entry("ns/a").await;
    assert!(shadow.is_some());

    f.cluster.fail_next(Op::Delete, Some(403));
    let err = f.client.delete_object(&id(&f, "a")).await.unwrap_err();
    assert_eq!(err.code(), Some(403));
    assert_eq!(f.client.shadow_entry("ns/a").await, shadow);

    f.client.delete_object(&id(&f, "a")).await.unwrap();
    assert_eq!(f.client.shadow_entry("ns/a").await, None);
    assert!(f.cluster.object("ns", "a").is_none());
    // already gone
    f.client.delete_object(&id(&f, "a")).await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn retrying_delete_does_not_hold_the_shadow() {
    let f = fixture(SyncStrategy::Patch, false);
    f.cluster.seed(cm("a", "1"));
    f.client.get_object(&id(&f, "a"), b"").await.unwrap();
    for _ in 0..3 {
        f.cluster.fail_next(Op::Delete, Some(503));
    }
    let delete = tokio::spawn({
        let client = f.client.clone();
        let a = id(&f, "a");
        async move { client.delete_object(&a).await }
    });
    tokio::time::sleep(Duration::from_millis(1)).await;

    // the delete is waiting out its backoff; shadow access must not wait on it
    let entry = tokio::time::timeout(Duration::from_millis(1), f.client.shadow_entry("ns/a")).await;
    assert_eq!(entry.expect("shadow lock is free"), None);

    delete.await.unwrap().unwrap();
    assert_eq!(f.cluster.mutations().deletes, 4);
    assert!(f.cluster.object("ns", "a").is_none());
}

#[tokio::test(start_paused = true)]
async fn deleted_event_drops_shadow_entry() {
    let f = fixture(SyncStrategy::Patch, false);
    f.cluster.seed(cm("a", "1"));
    f.client.get_object(&id(&f, "a"), b"").await.unwrap();
    let run = tokio::spawn({
        let client = f.client.clone();
        async move { client.run().await }
    });
    wait_watching(&f.client).await;
    f.cluster.remove("ns", "a");
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert_eq!(f.client.shadow_entry("ns/a").await, None);
    assert_eq!(f.callbacks.calls().last(), Some(&Call::Deleted("ns/a".into())));
    f.cluster.close_watches();
    run.await.unwrap().unwrap();
}
