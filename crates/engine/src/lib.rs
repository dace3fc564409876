//! Declarative reconciliation of a desired manifest set onto a cluster via
//! server-side apply, with ownership tracked in a persisted inventory.
//!
//! A [`Manager`] is constructed against one cluster and one inventory
//! identity, then driven through one-shot operations: [`Manager::diff`],
//! [`Manager::apply`], [`Manager::destroy`] and [`Manager::wait`]. It is not
//! thread-safe in the large: callers needing parallelism use disjoint
//! managers with disjoint inventory identities.

#![forbid(unsafe_code)]

use std::time::Duration;

use konverge_applier::{DEFAULT_WAIT_INTERVAL, DEFAULT_WAIT_TIMEOUT};
use konverge_core::{annotation, manifest_path_with_gv, set_annotation};

mod apply;
mod destroy;
mod diff;
mod error;
mod events;
mod policy;

pub use error::{ApplyFailure, EngineError};
pub use events::{Event, EventStream};

pub use konverge_applier::{KubeResourceManager, PropagationPolicy, ResourceManager, WaitOptions};
pub use konverge_cluster::ClusterClient;
pub use konverge_core::{
    Action, Change, ChangeEntry, ChangeSet, DiffAction, DiffResult, InventoryPolicy, Manifest,
    ObjMeta, ObjRef, INVENTORY_ANNOTATION,
};
pub use konverge_inventory::{ConfigMapInventory, Inventory};

/// Apply behavior knobs. Zero durations are normalized to the applier
/// defaults.
#[derive(Debug, Clone)]
pub struct ApplyOptions {
    pub delete_propagation_policy: PropagationPolicy,
    pub inventory_policy: InventoryPolicy,
    pub wait_interval: Duration,
    pub wait_timeout: Duration,
    /// Leave previously-owned objects alone even when absent from the
    /// desired set.
    pub no_prune: bool,
    /// Take field ownership from other managers on conflict.
    pub force_conflicts: bool,
    /// Recreate objects with immutable-field changes.
    pub force: bool,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            delete_propagation_policy: PropagationPolicy::Background,
            inventory_policy: InventoryPolicy::default(),
            wait_interval: Duration::ZERO,
            wait_timeout: Duration::ZERO,
            no_prune: false,
            force_conflicts: false,
            force: false,
        }
    }
}

impl ApplyOptions {
    fn normalized(mut self) -> Self {
        if self.wait_interval.is_zero() {
            self.wait_interval = DEFAULT_WAIT_INTERVAL;
        }
        if self.wait_timeout.is_zero() {
            self.wait_timeout = DEFAULT_WAIT_TIMEOUT;
        }
        self
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    pub no_prune: bool,
    pub force: bool,
    pub inventory_policy: InventoryPolicy,
}

#[derive(Debug, Clone)]
pub struct DestroyOptions {
    pub delete_propagation_policy: PropagationPolicy,
}

impl Default for DestroyOptions {
    fn default() -> Self {
        Self { delete_propagation_policy: PropagationPolicy::Background }
    }
}

/// The reconciliation engine: an SSA resource manager plus the inventory it
/// keeps consistent with the cluster.
pub struct Manager<R, I> {
    pub(crate) resource_manager: R,
    pub(crate) inventory: I,
}

impl<R: ResourceManager, I: Inventory> Manager<R, I> {
    /// Wire a manager from explicit capability implementations.
    pub fn custom(resource_manager: R, inventory: I) -> Self {
        Self { resource_manager, inventory }
    }

    /// Identity stamped into every applied object.
    pub fn inventory_id(&self) -> &str {
        self.inventory.id()
    }

    /// Block until every object in `set` reports ready; pass-through to the
    /// resource manager. Cancellation propagates by dropping the future.
    pub async fn wait(&self, set: &[ObjMeta], opts: WaitOptions) -> Result<(), EngineError> {
        Ok(self.resource_manager.wait_for_set(set, opts).await?)
    }

    /// Check input annotations against this inventory's identity and return
    /// stamped copies. Inputs are never mutated.
    pub(crate) fn prepare(&self, objects: &[Manifest]) -> Result<Vec<Manifest>, EngineError> {
        objects
            .iter()
            .map(|obj| {
                if let Some(existing) = annotation(obj, INVENTORY_ANNOTATION) {
                    if existing != self.inventory.id() {
                        return Err(EngineError::AnnotationConflict {
                            path: manifest_path_with_gv(obj),
                        });
                    }
                }
                let mut obj = obj.clone();
                set_annotation(&mut obj, INVENTORY_ANNOTATION, self.inventory.id());
                Ok(obj)
            })
            .collect()
    }
}

impl Manager<KubeResourceManager, ConfigMapInventory> {
    /// Connect with the ambient kube config and the reference capability
    /// implementations, bootstrapping the inventory namespace and ConfigMap.
    pub async fn connect(
        field_manager: &str,
        inventory_namespace: &str,
        inventory_name: &str,
    ) -> Result<Self, EngineError> {
        let cluster = ClusterClient::connect().await?;
        Self::with_cluster(cluster, field_manager, inventory_namespace, inventory_name).await
    }

    /// Like [`Manager::connect`], against an existing cluster connection.
    pub async fn with_cluster(
        cluster: ClusterClient,
        field_manager: &str,
        inventory_namespace: &str,
        inventory_name: &str,
    ) -> Result<Self, EngineError> {
        let inventory =
            ConfigMapInventory::new(cluster.clone(), inventory_namespace, inventory_name).await?;
        let resource_manager = KubeResourceManager::new(cluster, field_manager);
        Ok(Self::custom(resource_manager, inventory))
    }
}
