//! The apply state machine: dry-run diff, staged write, inventory
//! reconciliation, prune.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use konverge_applier::{
    ApplyOptions as ApplierApplyOptions, DeleteOptions, ResourceManager, StagedError,
};
use konverge_core::{
    manifest_path, manifest_path_with_gv, meta_of, obj_ref_of, Action, Change, ChangeEntry,
    Manifest, ObjRef,
};
use konverge_inventory::Inventory;

use crate::diff::deleted_diff;
use crate::error::{join, ApplyFailure, EngineError};
use crate::events::{Event, StreamCtx};
use crate::policy::can_apply;
use crate::{ApplyOptions, Manager};

impl<R: ResourceManager, I: Inventory> Manager<R, I> {
    /// Converge the cluster onto `objects`: server-side apply the set in
    /// dependency order, record every applied reference in the inventory,
    /// then prune references absent from the set.
    ///
    /// On failure the error carries every change collected up to that point,
    /// and the inventory reflects what actually happened: objects observed
    /// applied are recorded even when a later step failed, and objects that
    /// could not be pruned stay claimed so a later apply retries them.
    pub async fn apply(
        &self,
        objects: &[Manifest],
        opts: ApplyOptions,
    ) -> Result<Vec<Change>, ApplyFailure> {
        self.apply_inner(objects, opts, None).await
    }

    pub(crate) async fn apply_inner(
        &self,
        objects: &[Manifest],
        opts: ApplyOptions,
        mut stream: Option<&mut StreamCtx>,
    ) -> Result<Vec<Change>, ApplyFailure> {
        let opts = opts.normalized();

        // A conflicting input annotation is fatal with zero side effects.
        let objects = self.prepare(objects).map_err(ApplyFailure::bare)?;

        // Placeholder entries guarantee a partial failure still returns the
        // diff information collected so far.
        let mut changes: BTreeMap<String, Change> = BTreeMap::new();
        for obj in &objects {
            let r = obj_ref_of(obj).map_err(|e| ApplyFailure::bare(e.into()))?;
            changes.insert(
                r.path_with_gv(),
                Change {
                    entry: ChangeEntry::new(r.meta, r.group_version, Action::Unknown),
                    diff: String::new(),
                },
            );
        }

        // Every dry run completes before any write; policy violations abort
        // here, with nothing applied.
        for obj in &objects {
            let (entry, diff) = self
                .diff_one(obj, opts.force, opts.inventory_policy)
                .await
                .map_err(ApplyFailure::bare)?;
            if let Some(change) = changes.get_mut(&entry.path_with_gv()) {
                change.diff = diff;
            }
        }

        if stream_cancelled(&mut stream) {
            return Ok(collect(&changes));
        }

        let applier_opts = ApplierApplyOptions {
            force: opts.force,
            force_conflicts: opts.force_conflicts,
            wait_interval: opts.wait_interval,
            wait_timeout: opts.wait_timeout,
        };
        let (change_set, apply_err) =
            match self.resource_manager.apply_all_staged(&objects, applier_opts).await {
                Ok(cs) => (cs, None),
                Err(StagedError { completed, source }) => {
                    (completed, Some(EngineError::from(source)))
                }
            };

        let mut inventory_refs: Vec<ObjRef> = match self.inventory.read().await {
            Ok(refs) => refs,
            Err(e) => return Err(ApplyFailure::bare(e.into())),
        };

        let mut merge_err: Option<EngineError> = None;
        for entry in change_set.entries {
            match entry.action {
                Action::Created | Action::Configured | Action::Unchanged | Action::Skipped => {
                    let skipped = matches!(entry.action, Action::Unchanged | Action::Skipped);
                    if let Some(change) = changes.get_mut(&entry.path_with_gv()) {
                        change.entry.action = entry.action;
                    }
                    if !inventory_refs.iter().any(|r| r.meta == entry.meta) {
                        inventory_refs
                            .push(ObjRef::new(entry.meta.clone(), entry.group_version.clone()));
                    }
                    if let Some(s) = stream.as_deref_mut() {
                        s.emit(Event::Apply { object: entry.meta.clone(), skipped, error: None })
                            .await;
                    }
                }
                // the apply path never deletes; either of these is a
                // capability bug
                Action::Deleted | Action::Unknown => {
                    merge_err = join(
                        merge_err,
                        Some(EngineError::UnexpectedAction {
                            action: entry.action,
                            subject: entry.subject.clone(),
                        }),
                    );
                }
            }
        }

        // Persist even on failure so created objects are never leaked.
        let write_err = self.inventory.write(&inventory_refs).await.err().map(EngineError::from);
        let inv_err = join(merge_err, write_err);

        if let Some(error) = join(apply_err, inv_err) {
            return Err(ApplyFailure::new(collect(&changes), error));
        }

        if opts.no_prune {
            return Ok(collect(&changes));
        }

        if stream_cancelled(&mut stream) {
            return Ok(collect(&changes));
        }

        // Prune runs last, after apply and inventory persist, never
        // interleaved.
        let prune_objs = match self.inventory.get_prune_objs(Some(&objects)).await {
            Ok(objs) => objs,
            Err(e) => {
                return Err(ApplyFailure::new(collect(&changes), EngineError::PruneLookup(e)))
            }
        };

        let mut prune_err: Option<EngineError> = None;
        for p in &prune_objs {
            if let Err(reason) = can_apply(self.inventory.id(), p, opts.inventory_policy) {
                // Abort all pruning; the apply phase stays persisted.
                return Err(ApplyFailure::bare(EngineError::PolicyViolation {
                    path: manifest_path_with_gv(p),
                    reason,
                }));
            }

            let delete_opts =
                DeleteOptions { propagation_policy: opts.delete_propagation_policy.clone() };
            match self.resource_manager.delete(p, delete_opts).await {
                Ok(entry) => {
                    inventory_refs.retain(|r| r.meta != entry.meta);
                    let diff = match deleted_diff(p) {
                        Ok(diff) => diff,
                        Err(e) => {
                            prune_err = join(prune_err, Some(e));
                            String::new()
                        }
                    };
                    if let Some(s) = stream.as_deref_mut() {
                        s.emit(Event::Prune { object: entry.meta.clone() }).await;
                    }
                    changes.insert(entry.path_with_gv(), Change { entry, diff });
                }
                Err(e) if e.is_not_found() => {
                    // Externally deleted already: just release the claim.
                    debug!(object = %manifest_path(p), "prune target already absent");
                    if let Ok(meta) = meta_of(p) {
                        inventory_refs.retain(|r| r.meta != meta);
                    }
                }
                Err(e) => {
                    warn!(object = %manifest_path(p), error = %e, "prune delete failed");
                    prune_err = join(prune_err, Some(e.into()));
                }
            }
        }

        let write_err = self.inventory.write(&inventory_refs).await.err().map(EngineError::from);
        match join(prune_err, write_err) {
            Some(error) => Err(ApplyFailure::new(collect(&changes), error)),
            None => Ok(collect(&changes)),
        }
    }
}

/// Flatten the change map, dropping placeholders for outcomes never
/// observed.
fn collect(changes: &BTreeMap<String, Change>) -> Vec<Change> {
    changes.values().filter(|c| c.entry.action != Action::Unknown).cloned().collect()
}

fn stream_cancelled(stream: &mut Option<&mut StreamCtx>) -> bool {
    stream.as_deref_mut().is_some_and(|s| s.cancelled())
}
