//! Event-streaming apply tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use konverge_applier::mock::MockResourceManager;
use konverge_applier::{
    ApplierError, ApplyOptions as RmApplyOptions, DeleteOptions, DiffOptions as RmDiffOptions,
    DiffOutcome, ResourceManager, StagedError, WaitOptions,
};
use konverge_core::{ChangeEntry, ChangeSet, Manifest, ObjMeta};
use konverge_engine::{ApplyOptions, Event, Manager};
use konverge_inventory::memory::MemoryInventory;
use konverge_inventory::Inventory;

fn configmap(name: &str) -> Manifest {
    serde_json::json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": "default" },
        "data": { "key": "value" },
    })
}

fn fast_opts() -> ApplyOptions {
    ApplyOptions {
        wait_interval: Duration::from_millis(10),
        wait_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

#[tokio::test]
async fn streams_apply_and_prune_events() {
    let rm = MockResourceManager::new();
    let inv = MemoryInventory::new("test-inventory");
    let manager = Manager::custom(rm.clone(), inv.clone());

    // one stale object to prune
    manager.apply(&[configmap("stale")], ApplyOptions::default()).await.unwrap();

    let mut stream =
        manager.apply_events(vec![configmap("cm-a"), configmap("cm-b")], fast_opts());

    let mut applies = Vec::new();
    let mut prunes = Vec::new();
    while let Some(event) = stream.recv().await {
        match event {
            Event::Apply { object, skipped, error } => {
                assert!(error.is_none());
                assert!(!skipped, "fresh objects are real applies");
                applies.push(object.name);
            }
            Event::Prune { object } => prunes.push(object.name),
            Event::Wait { object } | Event::Rollout { object, .. } => {
                panic!("instantly-ready objects must stay silent, got event for {object}")
            }
        }
    }

    applies.sort();
    assert_eq!(applies, vec!["cm-a", "cm-b"]);
    assert_eq!(prunes, vec!["stale"]);

    let changes = stream.join().await.unwrap();
    assert_eq!(changes.len(), 3, "two applies and one prune");
    assert!(inv.read().await.unwrap().len() == 2);
}

#[tokio::test]
async fn reapply_streams_skipped_applies() {
    let rm = MockResourceManager::new();
    let inv = MemoryInventory::new("test-inventory");
    let manager = Manager::custom(rm, inv);

    manager.apply(&[configmap("cm")], ApplyOptions::default()).await.unwrap();

    let mut stream = manager.apply_events(vec![configmap("cm")], fast_opts());
    let mut saw_skipped = false;
    while let Some(event) = stream.recv().await {
        if let Event::Apply { skipped, .. } = event {
            saw_skipped = skipped;
        }
    }
    assert!(saw_skipped, "an unchanged re-apply must stream as skipped");
    stream.join().await.unwrap();
}

/// Readiness arrives only after a configurable number of probes per object.
#[derive(Clone)]
struct SlowReadyRm {
    inner: MockResourceManager,
    probes_until_ready: u32,
    seen: Arc<Mutex<HashMap<ObjMeta, u32>>>,
}

impl SlowReadyRm {
    fn new(inner: MockResourceManager, probes_until_ready: u32) -> Self {
        Self { inner, probes_until_ready, seen: Arc::new(Mutex::new(HashMap::new())) }
    }
}

#[async_trait]
impl ResourceManager for SlowReadyRm {
    async fn diff(&self, obj: &Manifest, opts: RmDiffOptions) -> Result<DiffOutcome, ApplierError> {
        self.inner.diff(obj, opts).await
    }

    async fn apply_all_staged(
        &self,
        objects: &[Manifest],
        opts: RmApplyOptions,
    ) -> Result<ChangeSet, StagedError> {
        self.inner.apply_all_staged(objects, opts).await
    }

    async fn delete(&self, obj: &Manifest, opts: DeleteOptions) -> Result<ChangeEntry, ApplierError> {
        self.inner.delete(obj, opts).await
    }

    async fn wait_for_set(&self, set: &[ObjMeta], _opts: WaitOptions) -> Result<(), ApplierError> {
        let mut seen = self.seen.lock().unwrap();
        let mut pending = Vec::new();
        for meta in set {
            let count = seen.entry(meta.clone()).or_insert(0);
            *count += 1;
            if *count <= self.probes_until_ready {
                pending.push(meta.path());
            }
        }
        if pending.is_empty() {
            Ok(())
        } else {
            Err(ApplierError::ReconcileTimeout { pending })
        }
    }
}

#[tokio::test]
async fn slow_objects_stream_wait_then_rollout() {
    let rm = SlowReadyRm::new(MockResourceManager::new(), 2);
    let inv = MemoryInventory::new("test-inventory");
    let manager = Manager::custom(rm, inv);

    let mut stream = manager.apply_events(vec![configmap("slow-cm")], fast_opts());

    let mut sequence = Vec::new();
    while let Some(event) = stream.recv().await {
        match event {
            Event::Apply { .. } => sequence.push("apply"),
            Event::Wait { .. } => sequence.push("wait"),
            Event::Rollout { error, .. } => {
                assert!(error.is_none(), "rollout should succeed: {error:?}");
                sequence.push("rollout");
            }
            Event::Prune { .. } => sequence.push("prune"),
        }
    }

    assert_eq!(sequence, vec!["apply", "wait", "rollout"], "one wait, then one rollout");
    stream.join().await.unwrap();
}

#[tokio::test]
async fn rollout_error_streams_on_timeout() {
    // never becomes ready
    let rm = SlowReadyRm::new(MockResourceManager::new(), u32::MAX);
    let inv = MemoryInventory::new("test-inventory");
    let manager = Manager::custom(rm, inv);

    let opts = ApplyOptions {
        wait_interval: Duration::from_millis(10),
        wait_timeout: Duration::from_millis(80),
        ..Default::default()
    };
    let mut stream = manager.apply_events(vec![configmap("stuck-cm")], opts);

    let mut saw_wait = false;
    let mut rollout_error = false;
    while let Some(event) = stream.recv().await {
        match event {
            Event::Wait { .. } => saw_wait = true,
            Event::Rollout { error, .. } => rollout_error = error.is_some(),
            _ => {}
        }
    }
    assert!(saw_wait);
    assert!(rollout_error, "timeout must surface as a rollout error event");
    stream.join().await.unwrap();
}

#[tokio::test]
async fn cancellation_terminates_stream_cleanly() {
    let rm = SlowReadyRm::new(MockResourceManager::new(), u32::MAX);
    let inv = MemoryInventory::new("test-inventory");
    let manager = Manager::custom(rm, inv);

    let opts = ApplyOptions {
        wait_interval: Duration::from_millis(20),
        wait_timeout: Duration::from_secs(60),
        ..Default::default()
    };
    let mut stream = manager.apply_events(vec![configmap("cm")], opts);

    // wait until the object is reported pending, then cancel
    loop {
        match stream.recv().await {
            Some(Event::Wait { .. }) => break,
            Some(_) => {}
            None => panic!("stream ended before a wait event"),
        }
    }
    stream.cancel();

    while stream.recv().await.is_some() {}
    let changes = stream.join().await.expect("cancellation is not an error");
    assert_eq!(changes.len(), 1, "the apply itself completed before cancellation");
}
