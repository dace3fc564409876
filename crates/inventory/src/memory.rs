//! In-memory inventory for unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use konverge_core::ObjRef;

use crate::{Inventory, InventoryError};

/// Inventory kept in process memory. Clones share state, so a test can keep a
/// handle for assertions while the manager owns another.
#[derive(Debug, Clone)]
pub struct MemoryInventory {
    id: String,
    refs: Arc<Mutex<Vec<ObjRef>>>,
}

impl MemoryInventory {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), refs: Arc::new(Mutex::new(Vec::new())) }
    }
}

#[async_trait]
impl Inventory for MemoryInventory {
    fn id(&self) -> &str {
        &self.id
    }

    async fn read(&self) -> Result<Vec<ObjRef>, InventoryError> {
        Ok(self.refs.lock().unwrap().clone())
    }

    async fn write(&self, refs: &[ObjRef]) -> Result<(), InventoryError> {
        let mut deduped: Vec<ObjRef> = Vec::with_capacity(refs.len());
        for r in refs {
            if !deduped.iter().any(|d| d.meta == r.meta) {
                deduped.push(r.clone());
            }
        }
        *self.refs.lock().unwrap() = deduped;
        Ok(())
    }

    async fn delete(&self) -> Result<(), InventoryError> {
        self.refs.lock().unwrap().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use konverge_core::ObjMeta;

    fn objref(name: &str) -> ObjRef {
        ObjRef::new(
            ObjMeta { group: "".into(), kind: "ConfigMap".into(), namespace: "default".into(), name: name.into() },
            "v1",
        )
    }

    #[tokio::test]
    async fn write_replaces_and_dedupes() {
        let inv = MemoryInventory::new("test-inventory");
        inv.write(&[objref("a"), objref("a"), objref("b")]).await.unwrap();

        let refs = inv.read().await.unwrap();
        assert_eq!(refs.len(), 2);
        assert_eq!(refs[0].meta.name, "a");
        assert_eq!(refs[1].meta.name, "b");

        inv.write(&[objref("c")]).await.unwrap();
        let refs = inv.read().await.unwrap();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].meta.name, "c");
    }

    #[tokio::test]
    async fn delete_empties_the_set() {
        let inv = MemoryInventory::new("test-inventory");
        inv.write(&[objref("a")]).await.unwrap();
        inv.delete().await.unwrap();
        assert!(inv.read().await.unwrap().is_empty());
        // deleting again stays a no-op
        inv.delete().await.unwrap();
    }
}
