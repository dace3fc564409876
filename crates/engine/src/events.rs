//! Streaming apply: the apply path surfaced as a sequence of events fed by a
//! background producer task.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use konverge_applier::{ApplierError, ResourceManager, WaitOptions};
use konverge_core::{Action, Change, Manifest, ObjMeta};
use konverge_inventory::Inventory;

use crate::error::{ApplyFailure, EngineError};
use crate::{ApplyOptions, Manager};

/// One progress event from a streaming apply.
#[derive(Debug)]
pub enum Event {
    /// An object reached a terminal apply status; `skipped` is true when the
    /// cluster made no change.
    Apply { object: ObjMeta, skipped: bool, error: Option<EngineError> },
    /// A prune target was deleted.
    Prune { object: ObjMeta },
    /// First observation of an object still pending reconciliation. Never
    /// carries an error.
    Wait { object: ObjMeta },
    /// Reconciliation finished; the error is set on timeout or failure.
    Rollout { object: ObjMeta, error: Option<EngineError> },
}

/// Handle to a streaming apply running in a background task.
pub struct EventStream {
    rx: mpsc::Receiver<Event>,
    cancel: Option<oneshot::Sender<()>>,
    handle: JoinHandle<Result<Vec<Change>, ApplyFailure>>,
}

impl EventStream {
    /// Next event; `None` once the operation has finished.
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Request clean termination. Writes already issued are not rolled back;
    /// the producer stops at the next stage boundary.
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }

    /// Wait for completion and return the collected changes.
    pub async fn join(self) -> Result<Vec<Change>, ApplyFailure> {
        match self.handle.await {
            Ok(result) => result,
            Err(_) => Err(ApplyFailure::bare(EngineError::StreamAborted)),
        }
    }
}

/// Producer-side half: the event channel plus the cancellation signal.
pub(crate) struct StreamCtx {
    tx: mpsc::Sender<Event>,
    cancel: oneshot::Receiver<()>,
}

impl StreamCtx {
    pub(crate) fn cancelled(&mut self) -> bool {
        // Closed counts as cancelled: nobody is listening anymore.
        !matches!(self.cancel.try_recv(), Err(oneshot::error::TryRecvError::Empty))
    }

    pub(crate) async fn emit(&self, event: Event) {
        let _ = self.tx.send(event).await;
    }
}

impl<R, I> Manager<R, I>
where
    R: ResourceManager + Clone + 'static,
    I: Inventory + Clone + 'static,
{
    /// Run the apply path in a background task, streaming progress events:
    /// one `Apply` per object reaching a terminal status, one `Prune` per
    /// deleted prune target, then `Wait`/`Rollout` while applied objects
    /// reconcile. Objects ready on first probe emit nothing.
    pub fn apply_events(&self, objects: Vec<Manifest>, opts: ApplyOptions) -> EventStream {
        let manager = Manager::custom(self.resource_manager.clone(), self.inventory.clone());
        let (tx, rx) = mpsc::channel(64);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let handle = tokio::spawn(async move {
            let mut ctx = StreamCtx { tx, cancel: cancel_rx };
            manager.apply_streaming(&objects, opts, &mut ctx).await
        });
        EventStream { rx, cancel: Some(cancel_tx), handle }
    }
}

impl<R: ResourceManager, I: Inventory> Manager<R, I> {
    async fn apply_streaming(
        &self,
        objects: &[Manifest],
        opts: ApplyOptions,
        ctx: &mut StreamCtx,
    ) -> Result<Vec<Change>, ApplyFailure> {
        let opts = opts.normalized();
        let changes = self.apply_inner(objects, opts.clone(), Some(&mut *ctx)).await?;

        let applied: Vec<ObjMeta> = changes
            .iter()
            .filter(|c| {
                matches!(
                    c.entry.action,
                    Action::Created | Action::Configured | Action::Unchanged | Action::Skipped
                )
            })
            .map(|c| c.entry.meta.clone())
            .collect();

        self.reconcile_events(&applied, &opts, ctx).await;
        Ok(changes)
    }

    /// Poll applied objects to readiness, translating observations into
    /// `Wait` and `Rollout` events. A `Rollout` success is suppressed unless
    /// a prior `Wait` was emitted for the same object.
    async fn reconcile_events(&self, set: &[ObjMeta], opts: &ApplyOptions, ctx: &mut StreamCtx) {
        // zero-timeout wait acts as a single readiness probe
        let probe =
            WaitOptions { interval: Duration::from_millis(10), timeout: Duration::ZERO, fail_fast: true };
        let deadline = Instant::now() + opts.wait_timeout;
        let mut pending: Vec<ObjMeta> = set.to_vec();
        let mut waited: HashSet<ObjMeta> = HashSet::new();

        while !pending.is_empty() {
            if ctx.cancelled() {
                return;
            }

            let mut still_pending = Vec::new();
            for meta in pending {
                match self
                    .resource_manager
                    .wait_for_set(std::slice::from_ref(&meta), probe.clone())
                    .await
                {
                    Ok(()) => {
                        if waited.contains(&meta) {
                            ctx.emit(Event::Rollout { object: meta, error: None }).await;
                        }
                    }
                    Err(ApplierError::ReconcileTimeout { .. }) => {
                        if waited.insert(meta.clone()) {
                            ctx.emit(Event::Wait { object: meta.clone() }).await;
                        }
                        still_pending.push(meta);
                    }
                    Err(e) => {
                        ctx.emit(Event::Rollout { object: meta, error: Some(e.into()) }).await;
                    }
                }
            }

            pending = still_pending;
            if pending.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                for meta in pending {
                    let timeout = ApplierError::ReconcileTimeout { pending: vec![meta.path()] };
                    ctx.emit(Event::Rollout { object: meta, error: Some(timeout.into()) }).await;
                }
                return;
            }

            tokio::select! {
                _ = tokio::time::sleep(opts.wait_interval) => {}
                _ = &mut ctx.cancel => return,
            }
        }
    }
}
