//! In-memory resource manager for unit tests.
//!
//! Simulates a cluster as a map keyed by object identity. Apply and diff
//! compare stored state structurally, so reapplying an identical manifest
//! reads as `Unchanged` just like a real server-side apply.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use konverge_core::{meta_of, obj_ref_of, Action, ChangeEntry, ChangeSet, Manifest, ObjMeta};

use crate::{
    ApplierError, ApplyOptions, DeleteOptions, DiffOptions, DiffOutcome, ResourceManager,
    StagedError, WaitOptions,
};

#[derive(Debug, Clone, Default)]
pub struct MockResourceManager {
    objects: Arc<Mutex<HashMap<ObjMeta, Manifest>>>,
}

impl MockResourceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate the simulated cluster.
    pub fn set_objects(&self, objects: impl IntoIterator<Item = Manifest>) {
        let mut store = self.objects.lock().unwrap();
        for obj in objects {
            let meta = meta_of(&obj).expect("mock object must carry identity");
            store.insert(meta, obj);
        }
    }

    /// Fetch a stored object by identity, if present.
    pub fn get_object(&self, group: &str, kind: &str, namespace: &str, name: &str) -> Option<Manifest> {
        let meta = ObjMeta {
            group: group.into(),
            kind: kind.into(),
            namespace: namespace.into(),
            name: name.into(),
        };
        self.objects.lock().unwrap().get(&meta).cloned()
    }

    fn apply_entry(&self, obj: &Manifest) -> Result<ChangeEntry, ApplierError> {
        let r = obj_ref_of(obj)?;
        let mut store = self.objects.lock().unwrap();
        let action = match store.get(&r.meta) {
            None => Action::Created,
            Some(existing) if existing == obj => Action::Unchanged,
            Some(_) => Action::Configured,
        };
        store.insert(r.meta.clone(), obj.clone());
        Ok(ChangeEntry::new(r.meta, r.group_version, action))
    }
}

#[async_trait]
impl ResourceManager for MockResourceManager {
    async fn diff(&self, obj: &Manifest, _opts: DiffOptions) -> Result<DiffOutcome, ApplierError> {
        let r = obj_ref_of(obj)?;
        let store = self.objects.lock().unwrap();
        match store.get(&r.meta) {
            None => Ok(DiffOutcome {
                entry: ChangeEntry::new(r.meta, r.group_version, Action::Created),
                in_cluster: None,
                dry_run: Some(obj.clone()),
            }),
            Some(existing) => {
                let action = if existing == obj { Action::Unchanged } else { Action::Configured };
                Ok(DiffOutcome {
                    entry: ChangeEntry::new(r.meta, r.group_version, action),
                    in_cluster: Some(existing.clone()),
                    dry_run: Some(obj.clone()),
                })
            }
        }
    }

    async fn apply_all_staged(
        &self,
        objects: &[Manifest],
        _opts: ApplyOptions,
    ) -> Result<ChangeSet, StagedError> {
        let mut change_set = ChangeSet::new();
        for obj in objects {
            match self.apply_entry(obj) {
                Ok(entry) => change_set.push(entry),
                Err(e) => return Err(StagedError { completed: change_set, source: e }),
            }
        }
        Ok(change_set)
    }

    async fn delete(&self, obj: &Manifest, _opts: DeleteOptions) -> Result<ChangeEntry, ApplierError> {
        let r = obj_ref_of(obj)?;
        let mut store = self.objects.lock().unwrap();
        match store.remove(&r.meta) {
            Some(_) => Ok(ChangeEntry::new(r.meta, r.group_version, Action::Deleted)),
            None => Err(ApplierError::NotFound { path: r.meta.path() }),
        }
    }

    async fn wait_for_set(&self, _set: &[ObjMeta], _opts: WaitOptions) -> Result<(), ApplierError> {
        // The simulated cluster reconciles instantly.
        Ok(())
    }
}
