//! Dry-run diffing of a desired set against the cluster.

use konverge_applier::{DiffOptions as ApplierDiffOptions, DiffOutcome, ResourceManager};
use konverge_core::{
    manifest_path, manifest_path_with_gv, obj_ref_of, Action, ChangeEntry, DiffAction, DiffResult,
    InventoryPolicy, Manifest,
};
use konverge_diff::render_diff;
use konverge_inventory::Inventory;

use crate::error::EngineError;
use crate::policy::can_apply;
use crate::{DiffOptions, Manager};

impl<R: ResourceManager, I: Inventory> Manager<R, I> {
    /// Compute per-object diffs: what a real apply would create, reconfigure,
    /// leave alone, and prune. No side effects; policy violations fail the
    /// whole call before anything is written.
    pub async fn diff(
        &self,
        objects: &[Manifest],
        opts: DiffOptions,
    ) -> Result<Vec<DiffResult>, EngineError> {
        let objects = self.prepare(objects)?;
        let prune_objs = self.inventory.get_prune_objs(Some(&objects)).await?;

        let mut result = Vec::with_capacity(objects.len() + prune_objs.len());

        if !opts.no_prune {
            for p in &prune_objs {
                can_apply(self.inventory.id(), p, opts.inventory_policy).map_err(|reason| {
                    EngineError::PolicyViolation { path: manifest_path_with_gv(p), reason }
                })?;

                let r = obj_ref_of(p)?;
                result.push(DiffResult {
                    action: DiffAction::Pruned,
                    diff: deleted_diff(p)?,
                    meta: r.meta,
                    group_version: r.group_version,
                    subject: r.subject,
                });
            }
        }

        for obj in &objects {
            let (entry, diff) = self.diff_one(obj, opts.force, opts.inventory_policy).await?;
            let action = match entry.action {
                Action::Created => DiffAction::Created,
                Action::Configured => DiffAction::Configured,
                Action::Unchanged => DiffAction::Unchanged,
                other => {
                    return Err(EngineError::UnexpectedAction {
                        action: other,
                        subject: entry.subject,
                    })
                }
            };
            result.push(DiffResult {
                action,
                diff,
                meta: entry.meta,
                group_version: entry.group_version,
                subject: entry.subject,
            });
        }

        Ok(result)
    }

    /// Dry-run one object and render its diff. Enforces the inventory policy
    /// against the in-cluster object for would-be reconfigurations, the only
    /// case where ownership could be stolen.
    pub(crate) async fn diff_one(
        &self,
        obj: &Manifest,
        force: bool,
        policy: InventoryPolicy,
    ) -> Result<(ChangeEntry, String), EngineError> {
        let outcome = match self.resource_manager.diff(obj, ApplierDiffOptions { force }).await {
            Ok(outcome) => outcome,
            Err(e) if e.is_not_found() => {
                // The object (or its namespace) does not exist: a real apply
                // would create it.
                let r = obj_ref_of(obj)?;
                DiffOutcome {
                    entry: ChangeEntry::new(r.meta, r.group_version, Action::Created),
                    in_cluster: None,
                    dry_run: Some(obj.clone()),
                }
            }
            Err(e) => {
                return Err(EngineError::DryRun { path: manifest_path(obj), source: e });
            }
        };

        let diff = match outcome.entry.action {
            Action::Created => render_diff(None, Some(obj))?,
            Action::Configured => {
                render_diff(outcome.in_cluster.as_ref(), outcome.dry_run.as_ref())?
            }
            // should never come back from a dry run, but render something
            // sensible rather than panic; callers surface it as an error
            Action::Deleted => deleted_diff(obj)?,
            _ => String::new(),
        };

        if outcome.entry.action == Action::Configured {
            if let Some(in_cluster) = &outcome.in_cluster {
                can_apply(self.inventory.id(), in_cluster, policy).map_err(|reason| {
                    EngineError::PolicyViolation { path: outcome.entry.subject.clone(), reason }
                })?;
            }
        }

        Ok((outcome.entry, diff))
    }
}

/// Render the removal diff for a prune target or destroyed object.
pub(crate) fn deleted_diff(obj: &Manifest) -> Result<String, EngineError> {
    let mut obj = obj.clone();
    // managed fields carry no signal in a removal diff
    if let Some(meta) = obj.get_mut("metadata").and_then(|m| m.as_object_mut()) {
        meta.remove("managedFields");
    }
    Ok(render_diff(Some(&obj), None)?)
}
