//! Ownership inventory: the persisted set of object references a manager
//! claims, and the prune computation derived from it.

#![forbid(unsafe_code)]

use std::collections::HashSet;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, PostParams};
use tracing::debug;

use konverge_cluster::{is_not_found, ClusterClient, ClusterError};
use konverge_core::{meta_of, skeleton, Manifest, ManifestError, ObjMeta, ObjRef};

pub mod memory;

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("failed to fetch the inventory")]
    Read(#[source] Box<kube::Error>),

    #[error("failed to update the inventory")]
    Write(#[source] Box<kube::Error>),

    #[error("failed to delete the inventory")]
    Delete(#[source] Box<kube::Error>),

    #[error("inventory not found")]
    NotFound,

    #[error("malformed inventory entry {key:?}")]
    MalformedEntry { key: String },

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

impl InventoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, InventoryError::NotFound)
    }
}

/// The persisted manifest-ownership state of one manager identity.
///
/// Implementations must keep the set duplicate-free; `write` replaces the
/// whole set atomically.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Stable identifier stamped into the owning-inventory annotation.
    fn id(&self) -> &str;

    /// Current persisted contents; an empty set is a valid state.
    async fn read(&self) -> Result<Vec<ObjRef>, InventoryError>;

    /// Atomically replace the persisted set.
    async fn write(&self, refs: &[ObjRef]) -> Result<(), InventoryError>;

    /// Remove the persisted inventory container itself.
    async fn delete(&self) -> Result<(), InventoryError>;

    /// Skeleton objects for every inventory entry absent from `desired`.
    /// `None` selects the entire inventory (used by destroy).
    async fn get_prune_objs(
        &self,
        desired: Option<&[Manifest]>,
    ) -> Result<Vec<Manifest>, InventoryError> {
        let refs = self.read().await?;
        Ok(prune_candidates(&refs, desired)?)
    }
}

/// Inventory entries whose identity is not present in the desired set,
/// rendered as identity-only skeletons suitable for delete calls.
pub fn prune_candidates(
    refs: &[ObjRef],
    desired: Option<&[Manifest]>,
) -> Result<Vec<Manifest>, ManifestError> {
    let desired_metas: HashSet<ObjMeta> = match desired {
        Some(objs) => objs.iter().map(meta_of).collect::<Result<_, _>>()?,
        None => HashSet::new(),
    };

    Ok(refs
        .iter()
        .filter(|r| !desired_metas.contains(&r.meta))
        .map(skeleton)
        .collect())
}

/// Reference implementation: a single well-known ConfigMap whose data map
/// holds one entry per owned object, `<group>_<kind>_<namespace>_<name>` →
/// version.
#[derive(Debug, Clone)]
pub struct ConfigMapInventory {
    cluster: ClusterClient,
    namespace: String,
    name: String,
}

impl ConfigMapInventory {
    /// Open (creating if absent) the inventory ConfigMap, bootstrapping its
    /// namespace first.
    pub async fn new(
        cluster: ClusterClient,
        namespace: &str,
        name: &str,
    ) -> Result<Self, InventoryError> {
        cluster.assure_namespace(namespace).await?;
        let inv = Self {
            cluster,
            namespace: namespace.to_string(),
            name: name.to_string(),
        };
        inv.assure().await?;
        Ok(inv)
    }

    fn api(&self) -> Api<ConfigMap> {
        Api::namespaced(self.cluster.client().clone(), &self.namespace)
    }

    /// Create an empty inventory ConfigMap if none exists.
    async fn assure(&self) -> Result<(), InventoryError> {
        let api = self.api();
        match api.get_opt(&self.name).await {
            Ok(Some(_)) => Ok(()),
            Ok(None) => {
                debug!(namespace = %self.namespace, name = %self.name, "creating inventory configmap");
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    ..Default::default()
                };
                match api.create(&PostParams::default(), &cm).await {
                    Ok(_) => Ok(()),
                    Err(kube::Error::Api(ref ae)) if ae.code == 409 => Ok(()),
                    Err(e) => Err(InventoryError::Write(Box::new(e))),
                }
            }
            Err(e) => Err(InventoryError::Read(Box::new(e))),
        }
    }
}

#[async_trait]
impl Inventory for ConfigMapInventory {
    fn id(&self) -> &str {
        // The name alone, for compatibility with kubectl's inventory layout.
        &self.name
    }

    async fn read(&self) -> Result<Vec<ObjRef>, InventoryError> {
        // Self-healing: a destroyed inventory is re-created empty so a
        // subsequent apply starts from a clean slate.
        self.assure().await?;

        let cm = self
            .api()
            .get(&self.name)
            .await
            .map_err(|e| InventoryError::Read(Box::new(e)))?;

        let mut refs = Vec::new();
        for (key, version) in cm.data.unwrap_or_default() {
            refs.push(parse_entry(&key, &version)?);
        }
        Ok(refs)
    }

    async fn write(&self, refs: &[ObjRef]) -> Result<(), InventoryError> {
        let mut data = std::collections::BTreeMap::new();
        for r in refs {
            let (key, version) = encode_entry(r);
            data.insert(key, version);
        }

        let api = self.api();
        match api.get_opt(&self.name).await {
            Ok(Some(mut cm)) => {
                cm.data = Some(data);
                api.replace(&self.name, &PostParams::default(), &cm)
                    .await
                    .map_err(|e| InventoryError::Write(Box::new(e)))?;
            }
            Ok(None) => {
                let cm = ConfigMap {
                    metadata: ObjectMeta {
                        name: Some(self.name.clone()),
                        namespace: Some(self.namespace.clone()),
                        ..Default::default()
                    },
                    data: Some(data),
                    ..Default::default()
                };
                api.create(&PostParams::default(), &cm)
                    .await
                    .map_err(|e| InventoryError::Write(Box::new(e)))?;
            }
            Err(e) => return Err(InventoryError::Read(Box::new(e))),
        }
        Ok(())
    }

    async fn delete(&self) -> Result<(), InventoryError> {
        match self.api().delete(&self.name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => Err(InventoryError::NotFound),
            Err(e) => Err(InventoryError::Delete(Box::new(e))),
        }
    }
}

fn encode_entry(r: &ObjRef) -> (String, String) {
    let key = format!(
        "{}_{}_{}_{}",
        r.meta.group, r.meta.kind, r.meta.namespace, r.meta.name
    );
    (key, r.version().to_string())
}

fn parse_entry(key: &str, version: &str) -> Result<ObjRef, InventoryError> {
    let parts: Vec<&str> = key.splitn(4, '_').collect();
    let &[group, kind, namespace, name] = parts.as_slice() else {
        return Err(InventoryError::MalformedEntry { key: key.to_string() });
    };
    if kind.is_empty() || name.is_empty() {
        return Err(InventoryError::MalformedEntry { key: key.to_string() });
    }

    let group_version = if group.is_empty() {
        version.to_string()
    } else {
        format!("{group}/{version}")
    };

    Ok(ObjRef::new(
        ObjMeta {
            group: group.to_string(),
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        group_version,
    ))
}
