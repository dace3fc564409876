//! Teardown: delete everything the inventory claims, then the inventory
//! itself.

use tracing::{debug, info};

use konverge_applier::{DeleteOptions, ResourceManager};
use konverge_core::manifest_path;
use konverge_inventory::Inventory;

use crate::error::EngineError;
use crate::{DestroyOptions, Manager};

impl<R: ResourceManager, I: Inventory> Manager<R, I> {
    /// Delete all objects tracked in the inventory and remove the inventory
    /// container. On the first delete failure the inventory is left intact
    /// so the operation can be retried; objects that are already gone are
    /// treated as successfully removed. A second destroy against an empty
    /// inventory is a no-op success.
    pub async fn destroy(&self, opts: DestroyOptions) -> Result<(), EngineError> {
        let all_objects = self.inventory.get_prune_objs(None).await?;
        info!(count = all_objects.len(), "destroying inventory-owned objects");

        for obj in &all_objects {
            let delete_opts =
                DeleteOptions { propagation_policy: opts.delete_propagation_policy.clone() };
            match self.resource_manager.delete(obj, delete_opts).await {
                Ok(_) => {}
                Err(e) if e.is_not_found() => {
                    debug!(object = %manifest_path(obj), "already absent");
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Empty the inventory before removing its container so a failure
        // between the two steps still reflects cluster state.
        self.inventory.write(&[]).await?;

        match self.inventory.delete().await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
