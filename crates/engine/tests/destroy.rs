//! Destroy tests: the inventory drains, and failures leave it intact for a
//! retry.

use assert_matches::assert_matches;
use async_trait::async_trait;

use konverge_applier::mock::MockResourceManager;
use konverge_applier::{
    ApplierError, ApplyOptions as RmApplyOptions, DeleteOptions, DiffOptions as RmDiffOptions,
    DiffOutcome, ResourceManager, StagedError, WaitOptions,
};
use konverge_core::{obj_ref_of, ChangeEntry, ChangeSet, Manifest, ObjMeta};
use konverge_engine::{ApplyOptions, DestroyOptions, EngineError, Manager};
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

#[tokio::test]
async fn destroy_drains_inventory_and_cluster() {
    let rm = MockResourceManager::new();
    let inv = MemoryInventory::new("test-inventory");
    let manager = Manager::custom(rm.clone(), inv.clone());

    manager
        .apply(&[configmap("cm-a"), configmap("cm-b")], ApplyOptions::default())
        .await
        .unwrap();
    assert_eq!(inv.read().await.unwrap().len(), 2);

    manager.destroy(DestroyOptions::default()).await.unwrap();

    assert!(inv.read().await.unwrap().is_empty(), "inventory is drained");
    assert!(rm.get_object("", "ConfigMap", "default", "cm-a").is_none());
    assert!(rm.get_object("", "ConfigMap", "default", "cm-b").is_none());

    // a second destroy is a no-op success
    manager.destroy(DestroyOptions::default()).await.unwrap();
}

#[tokio::test]
async fn destroy_tolerates_externally_deleted_objects() {
    let rm = MockResourceManager::new();
    let inv = MemoryInventory::new("test-inventory");
    // claimed but not present in the cluster
    inv.write(&[obj_ref_of(&configmap("gone")).unwrap()]).await.unwrap();
    let manager = Manager::custom(rm, inv.clone());

    manager.destroy(DestroyOptions::default()).await.unwrap();
    assert!(inv.read().await.unwrap().is_empty());
}

/// Fails every delete.
#[derive(Clone)]
struct BrokenDeleteRm {
    inner: MockResourceManager,
}

#[async_trait]
impl ResourceManager for BrokenDeleteRm {
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

    async fn delete(&self, obj: &Manifest, _opts: DeleteOptions) -> Result<ChangeEntry, ApplierError> {
        Err(ApplierError::ReconcileFailed {
            path: konverge_core::manifest_path(obj),
            reason: "delete refused".into(),
        })
    }

    async fn wait_for_set(&self, set: &[ObjMeta], opts: WaitOptions) -> Result<(), ApplierError> {
        self.inner.wait_for_set(set, opts).await
    }
}

#[tokio::test]
async fn destroy_aborts_on_delete_error_keeping_inventory() {
    let rm = BrokenDeleteRm { inner: MockResourceManager::new() };
    rm.inner.set_objects([configmap("stuck")]);
    let inv = MemoryInventory::new("test-inventory");
    inv.write(&[obj_ref_of(&configmap("stuck")).unwrap()]).await.unwrap();
    let manager = Manager::custom(rm, inv.clone());

    let err = manager.destroy(DestroyOptions::default()).await.unwrap_err();
    assert_matches!(err, EngineError::Applier(ApplierError::ReconcileFailed { .. }));

    assert_eq!(inv.read().await.unwrap().len(), 1, "inventory stays intact for the retry");
}
