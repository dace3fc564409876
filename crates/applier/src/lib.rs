//! Server-side apply primitive: per-object dry-run diff, staged apply,
//! delete, and readiness polling over a dynamic Kubernetes client.

#![forbid(unsafe_code)]

use std::time::{Duration, Instant};

use async_trait::async_trait;
use kube::api::{DeleteParams, Patch, PatchParams};
use metrics::{counter, histogram};
use tracing::{debug, warn};

use konverge_cluster::{is_not_found, ClusterClient, ClusterError};
use konverge_core::{kind_of, obj_ref_of, Action, ChangeEntry, ChangeSet, Manifest, ManifestError, ObjMeta};

pub mod mock;
pub mod ready;

pub use kube::api::PropagationPolicy;

use ready::Readiness;

/// Default poll cadence for readiness checks.
pub const DEFAULT_WAIT_INTERVAL: Duration = Duration::from_secs(2);
/// Default total readiness budget during staged apply.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Kinds that must be applied and reconciled before anything that may depend
/// on them.
const FOUNDATION_KINDS: &[&str] = &[
    "CustomResourceDefinition",
    "Namespace",
    "ResourceQuota",
    "StorageClass",
    "ServiceAccount",
    "PriorityClass",
    "RuntimeClass",
    "IngressClass",
    "ClusterRole",
    "ClusterRoleBinding",
    "Role",
    "RoleBinding",
];

pub fn is_foundation_kind(kind: &str) -> bool {
    FOUNDATION_KINDS.contains(&kind)
}

#[derive(Debug, thiserror::Error)]
pub enum ApplierError {
    #[error("object {path} not found")]
    NotFound { path: String },

    #[error("api request for {path} failed")]
    Api {
        path: String,
        #[source]
        source: Box<kube::Error>,
    },

    #[error("serializing object {path}")]
    Serialization {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("timed out waiting for [{}] to reconcile", pending.join(", "))]
    ReconcileTimeout { pending: Vec<String> },

    #[error("reconciliation failed for {path}: {reason}")]
    ReconcileFailed { path: String, reason: String },

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl ApplierError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ApplierError::NotFound { .. })
    }
}

/// Error from [`ResourceManager::apply_all_staged`], carrying the entries for
/// objects that were submitted before the failure.
#[derive(Debug, thiserror::Error)]
#[error("staged apply aborted after {} object(s)", completed.entries.len())]
pub struct StagedError {
    pub completed: ChangeSet,
    #[source]
    pub source: ApplierError,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiffOptions {
    /// Take field ownership from other managers during the dry run.
    pub force: bool,
}

#[derive(Debug, Clone)]
pub struct ApplyOptions {
    /// Recreate objects whose immutable fields changed.
    pub force: bool,
    /// Take field ownership from other managers on conflict.
    pub force_conflicts: bool,
    /// Poll cadence while waiting for foundation objects.
    pub wait_interval: Duration,
    /// Total readiness budget for foundation objects.
    pub wait_timeout: Duration,
}

impl Default for ApplyOptions {
    fn default() -> Self {
        Self {
            force: false,
            force_conflicts: false,
            wait_interval: DEFAULT_WAIT_INTERVAL,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeleteOptions {
    pub propagation_policy: PropagationPolicy,
}

impl Default for DeleteOptions {
    fn default() -> Self {
        Self { propagation_policy: PropagationPolicy::Background }
    }
}

#[derive(Debug, Clone)]
pub struct WaitOptions {
    pub interval: Duration,
    pub timeout: Duration,
    /// Abort on the first object observed in a failed state.
    pub fail_fast: bool,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self { interval: DEFAULT_WAIT_INTERVAL, timeout: DEFAULT_WAIT_TIMEOUT, fail_fast: false }
    }
}

/// Result of a per-object dry-run diff.
#[derive(Debug, Clone)]
pub struct DiffOutcome {
    /// The action a real apply would take.
    pub entry: ChangeEntry,
    /// Current live object (noise-stripped); `None` when it does not exist.
    pub in_cluster: Option<Manifest>,
    /// What the cluster would hold after an apply (noise-stripped).
    pub dry_run: Option<Manifest>,
}

/// Minimal SSA capability the manager orchestrates.
///
/// Implementations may wrap any client that supports server-side apply with
/// dry-run and status reads; [`KubeResourceManager`] is the reference
/// implementation, [`mock::MockResourceManager`] the test double.
#[async_trait]
pub trait ResourceManager: Send + Sync {
    /// Dry-run apply one object. A missing live object yields a `Created`
    /// entry; missing namespaces surface as [`ApplierError::NotFound`].
    async fn diff(&self, obj: &Manifest, opts: DiffOptions) -> Result<DiffOutcome, ApplierError>;

    /// Apply a set in dependency order: foundation kinds first, reconciled to
    /// readiness, then everything else. Entries for submitted objects survive
    /// an abort inside the returned [`StagedError`].
    async fn apply_all_staged(
        &self,
        objects: &[Manifest],
        opts: ApplyOptions,
    ) -> Result<ChangeSet, StagedError>;

    /// Delete one object.
    async fn delete(&self, obj: &Manifest, opts: DeleteOptions) -> Result<ChangeEntry, ApplierError>;

    /// Block until every referenced object reports ready, the timeout fires,
    /// or (with `fail_fast`) one of them fails to reconcile.
    async fn wait_for_set(&self, set: &[ObjMeta], opts: WaitOptions) -> Result<(), ApplierError>;
}

/// Strip server-managed churn so comparisons and diffs only show fields a
/// caller can influence.
pub fn sanitize(mut v: Manifest) -> Manifest {
    if let Some(meta) = v.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        meta.remove("generation");
        meta.remove("creationTimestamp");
        meta.remove("uid");
    }
    if let Some(obj) = v.as_object_mut() {
        obj.remove("status");
    }
    v
}

/// Reference [`ResourceManager`] over a dynamic kube client.
#[derive(Debug, Clone)]
pub struct KubeResourceManager {
    cluster: ClusterClient,
    field_manager: String,
}

impl KubeResourceManager {
    pub fn new(cluster: ClusterClient, field_manager: impl Into<String>) -> Self {
        Self { cluster, field_manager: field_manager.into() }
    }

    fn ssa_params(&self, dry_run: bool, force: bool) -> PatchParams {
        PatchParams {
            dry_run,
            force,
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        }
    }

    async fn apply_one(&self, obj: &Manifest, opts: &ApplyOptions) -> Result<ChangeEntry, ApplierError> {
        let t0 = Instant::now();
        counter!("apply_attempts", 1u64);

        let r = obj_ref_of(obj)?;
        let path = r.meta.path();
        let api = self.cluster.api_for(obj).await?;

        let live_rv = api
            .get_opt(&r.meta.name)
            .await
            .map_err(|e| api_err(&path, e))?
            .and_then(|o| o.metadata.resource_version);

        let pp = self.ssa_params(false, opts.force_conflicts);
        let applied = match api.patch(&r.meta.name, &pp, &Patch::Apply(obj)).await {
            Ok(o) => o,
            Err(kube::Error::Api(ref ae)) if ae.code == 422 && opts.force => {
                // Immutable field change: recreate the object.
                warn!(object = %r.meta, "immutable field change, recreating");
                let dp = DeleteParams {
                    propagation_policy: Some(PropagationPolicy::Background),
                    ..Default::default()
                };
                api.delete(&r.meta.name, &dp).await.map_err(|e| api_err(&path, e))?;
                self.wait_gone(&api, &r.meta.name, opts.wait_timeout).await?;
                api.patch(&r.meta.name, &pp, &Patch::Apply(obj))
                    .await
                    .map_err(|e| api_err(&path, e))?
            }
            Err(e) => {
                counter!("apply_errors", 1u64);
                return Err(api_err(&path, e));
            }
        };

        let action = match (&live_rv, &applied.metadata.resource_version) {
            (None, _) => Action::Created,
            (Some(before), Some(after)) if before == after => Action::Unchanged,
            _ => Action::Configured,
        };

        histogram!("apply_latency_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(object = %r.meta, action = %action, "applied");
        Ok(ChangeEntry::new(r.meta, r.group_version, action))
    }

    async fn wait_gone(
        &self,
        api: &kube::Api<kube::core::DynamicObject>,
        name: &str,
        budget: Duration,
    ) -> Result<(), ApplierError> {
        let deadline = Instant::now() + budget;
        loop {
            match api.get_opt(name).await {
                Ok(None) => return Ok(()),
                Ok(Some(_)) if Instant::now() >= deadline => {
                    return Err(ApplierError::ReconcileTimeout { pending: vec![name.to_string()] });
                }
                Ok(Some(_)) => tokio::time::sleep(Duration::from_millis(250)).await,
                Err(e) => return Err(api_err(name, e)),
            }
        }
    }

    async fn probe(&self, meta: &ObjMeta) -> Result<Readiness, ApplierError> {
        let api = self.cluster.api_for_meta(meta).await?;
        match api.get_opt(&meta.name).await {
            Ok(Some(o)) => {
                let v = serde_json::to_value(&o).map_err(|e| ApplierError::Serialization {
                    path: meta.path(),
                    source: e,
                })?;
                Ok(ready::check(&v))
            }
            Ok(None) => Ok(Readiness::InProgress("object not present yet".to_string())),
            Err(e) => Err(api_err(&meta.path(), e)),
        }
    }
}

fn api_err(path: &str, e: kube::Error) -> ApplierError {
    if is_not_found(&e) {
        ApplierError::NotFound { path: path.to_string() }
    } else {
        ApplierError::Api { path: path.to_string(), source: Box::new(e) }
    }
}

#[async_trait]
impl ResourceManager for KubeResourceManager {
    async fn diff(&self, obj: &Manifest, opts: DiffOptions) -> Result<DiffOutcome, ApplierError> {
        counter!("diff_dry_runs", 1u64);
        let r = obj_ref_of(obj)?;
        let path = r.meta.path();
        let api = self.cluster.api_for(obj).await?;

        let Some(live) = api.get_opt(&r.meta.name).await.map_err(|e| api_err(&path, e))? else {
            return Ok(DiffOutcome {
                entry: ChangeEntry::new(r.meta, r.group_version, Action::Created),
                in_cluster: None,
                dry_run: Some(obj.clone()),
            });
        };

        let pp = self.ssa_params(true, opts.force);
        let dry = api
            .patch(&r.meta.name, &pp, &Patch::Apply(obj))
            .await
            .map_err(|e| api_err(&path, e))?;

        let live = sanitize(serde_json::to_value(&live).map_err(|e| ApplierError::Serialization {
            path: path.clone(),
            source: e,
        })?);
        let dry = sanitize(serde_json::to_value(&dry).map_err(|e| ApplierError::Serialization {
            path: path.clone(),
            source: e,
        })?);

        let action = if live == dry { Action::Unchanged } else { Action::Configured };
        Ok(DiffOutcome {
            entry: ChangeEntry::new(r.meta, r.group_version, action),
            in_cluster: Some(live),
            dry_run: Some(dry),
        })
    }

    async fn apply_all_staged(
        &self,
        objects: &[Manifest],
        opts: ApplyOptions,
    ) -> Result<ChangeSet, StagedError> {
        let mut change_set = ChangeSet::new();
        let (foundation, dependent): (Vec<&Manifest>, Vec<&Manifest>) = objects
            .iter()
            .partition(|o| is_foundation_kind(kind_of(o).unwrap_or("")));

        for obj in &foundation {
            match self.apply_one(obj, &opts).await {
                Ok(entry) => change_set.push(entry),
                Err(e) => return Err(StagedError { completed: change_set, source: e }),
            }
        }

        if !foundation.is_empty() {
            let metas: Vec<ObjMeta> = change_set.entries.iter().map(|e| e.meta.clone()).collect();
            let wait = WaitOptions {
                interval: opts.wait_interval,
                timeout: opts.wait_timeout,
                fail_fast: true,
            };
            if let Err(e) = self.wait_for_set(&metas, wait).await {
                return Err(StagedError { completed: change_set, source: e });
            }
        }

        for obj in &dependent {
            match self.apply_one(obj, &opts).await {
                Ok(entry) => change_set.push(entry),
                Err(e) => return Err(StagedError { completed: change_set, source: e }),
            }
        }

        Ok(change_set)
    }

    async fn delete(&self, obj: &Manifest, opts: DeleteOptions) -> Result<ChangeEntry, ApplierError> {
        counter!("delete_attempts", 1u64);
        let r = obj_ref_of(obj)?;
        let path = r.meta.path();
        let api = self.cluster.api_for(obj).await?;

        let dp = DeleteParams {
            propagation_policy: Some(opts.propagation_policy.clone()),
            ..Default::default()
        };
        match api.delete(&r.meta.name, &dp).await {
            Ok(_) => {
                debug!(object = %r.meta, "deleted");
                Ok(ChangeEntry::new(r.meta, r.group_version, Action::Deleted))
            }
            Err(e) => Err(api_err(&path, e)),
        }
    }

    async fn wait_for_set(&self, set: &[ObjMeta], opts: WaitOptions) -> Result<(), ApplierError> {
        let deadline = Instant::now() + opts.timeout;
        let mut pending: Vec<ObjMeta> = set.to_vec();

        loop {
            let mut still_pending = Vec::new();
            for meta in &pending {
                match self.probe(meta).await? {
                    Readiness::Ready => {}
                    Readiness::InProgress(reason) => {
                        debug!(object = %meta, reason = %reason, "not ready");
                        still_pending.push(meta.clone());
                    }
                    Readiness::Failed(reason) => {
                        if opts.fail_fast {
                            counter!("wait_failures", 1u64);
                            return Err(ApplierError::ReconcileFailed { path: meta.path(), reason });
                        }
                        still_pending.push(meta.clone());
                    }
                }
            }

            if still_pending.is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                counter!("wait_timeouts", 1u64);
                return Err(ApplierError::ReconcileTimeout {
                    pending: still_pending.iter().map(|m| m.path()).collect(),
                });
            }

            pending = still_pending;
            let nap = opts.interval.min(deadline.saturating_duration_since(Instant::now()));
            tokio::time::sleep(nap).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_prunes_server_churn() {
        let v = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": "x",
                "namespace": "ns",
                "managedFields": [{ "manager": "konverge" }],
                "resourceVersion": "123",
                "generation": 5,
                "creationTimestamp": "2020-01-01T00:00:00Z",
                "uid": "d92e3a9d-5c68-4bde-97f5-9d9e6e0678a7",
            },
            "status": { "observed": true },
            "data": { "k": "v" },
        });
        let pruned = sanitize(v);
        let meta = pruned["metadata"].as_object().unwrap();
        assert!(!meta.contains_key("managedFields"));
        assert!(!meta.contains_key("resourceVersion"));
        assert!(!meta.contains_key("generation"));
        assert!(!meta.contains_key("creationTimestamp"));
        assert!(!meta.contains_key("uid"));
        assert!(pruned.get("status").is_none());
        assert_eq!(pruned["data"]["k"], "v");
    }

    #[test]
    fn foundation_kinds_cover_dependency_roots() {
        for kind in ["CustomResourceDefinition", "Namespace", "ClusterRole", "ClusterRoleBinding"] {
            assert!(is_foundation_kind(kind), "{kind} must be a foundation kind");
        }
        for kind in ["ConfigMap", "Deployment", "Secret", "Service"] {
            assert!(!is_foundation_kind(kind), "{kind} must not be a foundation kind");
        }
    }
}
