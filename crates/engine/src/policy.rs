//! Inventory-policy enforcement: may this manager take over a live object?

use konverge_core::{annotation, InventoryPolicy, Manifest, INVENTORY_ANNOTATION};

/// Check whether an object may be applied (or pruned) under the given
/// policy. `Err` carries the human-readable reason.
pub(crate) fn can_apply(
    inventory_id: &str,
    obj: &Manifest,
    policy: InventoryPolicy,
) -> Result<(), String> {
    let owner = annotation(obj, INVENTORY_ANNOTATION);
    match policy {
        InventoryPolicy::AdoptAll => Ok(()),
        InventoryPolicy::AdoptIfNoInventory => match owner {
            None => Ok(()),
            Some(o) if o == inventory_id => Ok(()),
            Some(o) => Err(format!("object is owned by inventory {o:?}")),
        },
        InventoryPolicy::MustMatch => match owner {
            Some(o) if o == inventory_id => Ok(()),
            Some(o) => Err(format!("object is owned by inventory {o:?}")),
            None => Err("object is not owned by any inventory".to_string()),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use konverge_core::set_annotation;

    fn obj(owner: Option<&str>) -> Manifest {
        let mut m = serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": "cm", "namespace": "default" },
        });
        if let Some(owner) = owner {
            set_annotation(&mut m, INVENTORY_ANNOTATION, owner);
        }
        m
    }

    #[test]
    fn must_match_requires_exact_owner() {
        assert!(can_apply("mine", &obj(Some("mine")), InventoryPolicy::MustMatch).is_ok());
        assert!(can_apply("mine", &obj(Some("other")), InventoryPolicy::MustMatch).is_err());
        assert!(can_apply("mine", &obj(None), InventoryPolicy::MustMatch).is_err());
    }

    #[test]
    fn adopt_if_no_inventory_takes_unowned() {
        assert!(can_apply("mine", &obj(None), InventoryPolicy::AdoptIfNoInventory).is_ok());
        assert!(can_apply("mine", &obj(Some("mine")), InventoryPolicy::AdoptIfNoInventory).is_ok());
        assert!(can_apply("mine", &obj(Some("other")), InventoryPolicy::AdoptIfNoInventory).is_err());
    }

    #[test]
    fn adopt_all_takes_everything() {
        assert!(can_apply("mine", &obj(Some("other")), InventoryPolicy::AdoptAll).is_ok());
        assert!(can_apply("mine", &obj(None), InventoryPolicy::AdoptAll).is_ok());
    }
}
