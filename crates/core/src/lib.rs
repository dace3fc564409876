//! Konverge core types: object identity, change records, path formatting.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};

/// Annotation key marking the inventory that owns an applied object.
pub const INVENTORY_ANNOTATION: &str = "config.k8s.io/owning-inventory";

/// An unstructured Kubernetes manifest.
pub type Manifest = serde_json::Value;

/// Errors for manifests that lack the fields required to identify an object.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ManifestError {
    #[error("manifest missing apiVersion")]
    MissingApiVersion,

    #[error("manifest missing kind")]
    MissingKind,

    #[error("manifest missing metadata.name")]
    MissingName,
}

/// Object identity: group + kind + namespace + name.
///
/// The version is deliberately absent; two versions of the same kind refer to
/// the same object. Namespace is the empty string for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjMeta {
    pub group: String,
    pub kind: String,
    pub namespace: String,
    pub name: String,
}

impl ObjMeta {
    /// `<kind>/<namespace>/<name>`, namespace omitted when empty.
    pub fn path(&self) -> String {
        format_path(&self.kind, &self.namespace, &self.name)
    }
}

impl fmt::Display for ObjMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.path())
    }
}

/// Object reference: identity plus the current groupVersion and a display
/// subject.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjRef {
    pub meta: ObjMeta,
    /// `group/version` (bare version for the core group), e.g. `apps/v1`.
    pub group_version: String,
    /// `<kind>/<namespace>/<name>`, namespace omitted when empty.
    pub subject: String,
}

impl ObjRef {
    pub fn new(meta: ObjMeta, group_version: impl Into<String>) -> Self {
        let subject = meta.path();
        Self { meta, group_version: group_version.into(), subject }
    }

    /// Bare version part of the group version.
    pub fn version(&self) -> &str {
        match self.group_version.rsplit_once('/') {
            Some((_, v)) => v,
            None => &self.group_version,
        }
    }

    /// `<group>/<version>.<kind>/<namespace>/<name>`.
    pub fn path_with_gv(&self) -> String {
        format_path_with_gv(
            &self.meta.group,
            self.version(),
            &self.meta.kind,
            &self.meta.namespace,
            &self.meta.name,
        )
    }
}

/// Terminal action taken (or that would be taken) for one object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Created,
    Configured,
    Unchanged,
    Deleted,
    Skipped,
    /// Placeholder for outcomes not yet observed; never surfaced to callers.
    Unknown,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Created => "Created",
            Action::Configured => "Configured",
            Action::Unchanged => "Unchanged",
            Action::Deleted => "Deleted",
            Action::Skipped => "Skipped",
            Action::Unknown => "Unknown",
        };
        f.write_str(s)
    }
}

/// Action variants reported by a dry-run diff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffAction {
    Created,
    Configured,
    Pruned,
    Unchanged,
}

impl fmt::Display for DiffAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DiffAction::Created => "Created",
            DiffAction::Configured => "Configured",
            DiffAction::Pruned => "Pruned",
            DiffAction::Unchanged => "Unchanged",
        };
        f.write_str(s)
    }
}

/// One per-object outcome from the resource manager.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEntry {
    pub meta: ObjMeta,
    pub group_version: String,
    pub subject: String,
    pub action: Action,
}

impl ChangeEntry {
    pub fn new(meta: ObjMeta, group_version: impl Into<String>, action: Action) -> Self {
        let subject = meta.path();
        Self { meta, group_version: group_version.into(), subject, action }
    }

    /// Canonical path used to key change maps; matches [`ObjRef::path_with_gv`].
    pub fn path_with_gv(&self) -> String {
        let version = match self.group_version.rsplit_once('/') {
            Some((_, v)) => v,
            None => &self.group_version,
        };
        format_path_with_gv(&self.meta.group, version, &self.meta.kind, &self.meta.namespace, &self.meta.name)
    }
}

/// Ordered collection of change entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub entries: Vec<ChangeEntry>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: ChangeEntry) {
        self.entries.push(entry);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A change entry together with its rendered diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub entry: ChangeEntry,
    pub diff: String,
}

/// Diff result for one object, including prune candidates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffResult {
    pub action: DiffAction,
    pub diff: String,
    pub meta: ObjMeta,
    pub group_version: String,
    pub subject: String,
}

/// Decides whether live objects owned by another (or no) inventory may be
/// taken over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InventoryPolicy {
    /// Refuse to touch any live object not already owned by this inventory.
    MustMatch,
    /// Adopt unmanaged objects; refuse objects owned by another inventory.
    #[default]
    AdoptIfNoInventory,
    /// Take over regardless of prior ownership.
    AdoptAll,
}

/// `<kind>/<namespace>/<name>`, namespace omitted when empty.
pub fn format_path(kind: &str, namespace: &str, name: &str) -> String {
    if namespace.is_empty() {
        format!("{kind}/{name}")
    } else {
        format!("{kind}/{namespace}/{name}")
    }
}

/// `<group>/<version>.<kind>/<namespace>/<name>`; group omitted when empty,
/// version defaults to `v1` when empty, namespace omitted when empty.
pub fn format_path_with_gv(
    group: &str,
    version: &str,
    kind: &str,
    namespace: &str,
    name: &str,
) -> String {
    let version = if version.is_empty() { "v1" } else { version };
    let gv = if group.is_empty() {
        version.to_string()
    } else {
        format!("{group}/{version}")
    };
    let nn = if namespace.is_empty() {
        name.to_string()
    } else {
        format!("{namespace}/{name}")
    };
    format!("{gv}.{kind}/{nn}")
}

// ---- manifest accessors -------------------------------------------------

/// Split an `apiVersion` string into (group, version).
pub fn split_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((g, v)) => (g, v),
        None => ("", api_version),
    }
}

pub fn api_version_of(manifest: &Manifest) -> Result<&str, ManifestError> {
    manifest
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or(ManifestError::MissingApiVersion)
}

pub fn kind_of(manifest: &Manifest) -> Result<&str, ManifestError> {
    manifest
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or(ManifestError::MissingKind)
}

pub fn name_of(manifest: &Manifest) -> Result<&str, ManifestError> {
    manifest
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or(ManifestError::MissingName)
}

/// Namespace, or the empty string for cluster-scoped (or unset) manifests.
pub fn namespace_of(manifest: &Manifest) -> &str {
    manifest
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

/// Extract the identity tuple from a manifest.
pub fn meta_of(manifest: &Manifest) -> Result<ObjMeta, ManifestError> {
    let (group, _) = split_api_version(api_version_of(manifest)?);
    Ok(ObjMeta {
        group: group.to_string(),
        kind: kind_of(manifest)?.to_string(),
        namespace: namespace_of(manifest).to_string(),
        name: name_of(manifest)?.to_string(),
    })
}

/// Extract a full object reference from a manifest.
pub fn obj_ref_of(manifest: &Manifest) -> Result<ObjRef, ManifestError> {
    let api_version = api_version_of(manifest)?.to_string();
    Ok(ObjRef::new(meta_of(manifest)?, api_version))
}

/// Best-effort `<kind>/<namespace>/<name>` for log and error messages.
pub fn manifest_path(manifest: &Manifest) -> String {
    let kind = kind_of(manifest).unwrap_or("<unknown>");
    let name = name_of(manifest).unwrap_or("<unknown>");
    format_path(kind, namespace_of(manifest), name)
}

/// Best-effort `<group>/<version>.<kind>/<namespace>/<name>`.
pub fn manifest_path_with_gv(manifest: &Manifest) -> String {
    let (group, version) = split_api_version(api_version_of(manifest).unwrap_or(""));
    let kind = kind_of(manifest).unwrap_or("<unknown>");
    let name = name_of(manifest).unwrap_or("<unknown>");
    format_path_with_gv(group, version, kind, namespace_of(manifest), name)
}

pub fn annotation<'a>(manifest: &'a Manifest, key: &str) -> Option<&'a str> {
    manifest
        .pointer("/metadata/annotations")
        .and_then(|a| a.get(key))
        .and_then(|v| v.as_str())
}

/// Set one annotation, creating `metadata.annotations` as needed.
pub fn set_annotation(manifest: &mut Manifest, key: &str, value: &str) {
    let Some(obj) = manifest.as_object_mut() else { return };
    let metadata = obj
        .entry("metadata")
        .or_insert_with(|| Manifest::Object(Default::default()));
    if let Some(metadata) = metadata.as_object_mut() {
        let annotations = metadata
            .entry("annotations")
            .or_insert_with(|| Manifest::Object(Default::default()));
        if let Some(annotations) = annotations.as_object_mut() {
            annotations.insert(key.to_string(), Manifest::String(value.to_string()));
        }
    }
}

/// Identity-only document (`apiVersion`, `kind`, `metadata`) used for deletes.
pub fn skeleton(r: &ObjRef) -> Manifest {
    let mut metadata = serde_json::Map::new();
    metadata.insert("name".into(), Manifest::String(r.meta.name.clone()));
    if !r.meta.namespace.is_empty() {
        metadata.insert("namespace".into(), Manifest::String(r.meta.namespace.clone()));
    }
    serde_json::json!({
        "apiVersion": r.group_version,
        "kind": r.meta.kind,
        "metadata": metadata,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn configmap(name: &str) -> Manifest {
        serde_json::json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": { "name": name, "namespace": "default" },
            "data": { "key": "value" },
        })
    }

    #[test]
    fn path_formats() {
        assert_eq!(format_path("ConfigMap", "default", "cm"), "ConfigMap/default/cm");
        assert_eq!(format_path("Namespace", "", "prod"), "Namespace/prod");

        assert_eq!(
            format_path_with_gv("apps", "v1", "Deployment", "web", "api"),
            "apps/v1.Deployment/web/api"
        );
        assert_eq!(
            format_path_with_gv("", "v1", "ConfigMap", "default", "cm"),
            "v1.ConfigMap/default/cm"
        );
        assert_eq!(
            format_path_with_gv("", "", "Namespace", "", "prod"),
            "v1.Namespace/prod"
        );
    }

    #[test]
    fn meta_and_ref_from_manifest() {
        let m = configmap("app-config");
        let meta = meta_of(&m).unwrap();
        assert_eq!(meta.group, "");
        assert_eq!(meta.kind, "ConfigMap");
        assert_eq!(meta.namespace, "default");
        assert_eq!(meta.name, "app-config");

        let r = obj_ref_of(&m).unwrap();
        assert_eq!(r.group_version, "v1");
        assert_eq!(r.subject, "ConfigMap/default/app-config");
        assert_eq!(r.path_with_gv(), "v1.ConfigMap/default/app-config");
    }

    #[test]
    fn meta_errors_on_missing_fields() {
        let m = serde_json::json!({ "kind": "ConfigMap", "metadata": { "name": "x" } });
        assert_eq!(meta_of(&m), Err(ManifestError::MissingApiVersion));

        let m = serde_json::json!({ "apiVersion": "v1", "metadata": { "name": "x" } });
        assert_eq!(meta_of(&m), Err(ManifestError::MissingKind));

        let m = serde_json::json!({ "apiVersion": "v1", "kind": "ConfigMap", "metadata": {} });
        assert_eq!(meta_of(&m), Err(ManifestError::MissingName));
    }

    #[test]
    fn change_entry_key_matches_obj_ref_key() {
        let m = serde_json::json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": { "name": "api", "namespace": "web" },
        });
        let r = obj_ref_of(&m).unwrap();
        let entry = ChangeEntry::new(r.meta.clone(), r.group_version.clone(), Action::Created);
        assert_eq!(entry.path_with_gv(), r.path_with_gv());
        assert_eq!(entry.path_with_gv(), "apps/v1.Deployment/web/api");
    }

    #[test]
    fn annotation_roundtrip() {
        let mut m = configmap("cm");
        assert_eq!(annotation(&m, INVENTORY_ANNOTATION), None);
        set_annotation(&mut m, INVENTORY_ANNOTATION, "inv-1");
        assert_eq!(annotation(&m, INVENTORY_ANNOTATION), Some("inv-1"));
        // overwrite keeps a single entry
        set_annotation(&mut m, INVENTORY_ANNOTATION, "inv-2");
        assert_eq!(annotation(&m, INVENTORY_ANNOTATION), Some("inv-2"));
    }

    #[test]
    fn skeleton_carries_identity_only() {
        let r = ObjRef::new(
            ObjMeta {
                group: "apps".into(),
                kind: "Deployment".into(),
                namespace: "web".into(),
                name: "api".into(),
            },
            "apps/v1",
        );
        let sk = skeleton(&r);
        assert_eq!(sk["apiVersion"], "apps/v1");
        assert_eq!(sk["kind"], "Deployment");
        assert_eq!(sk["metadata"]["name"], "api");
        assert_eq!(sk["metadata"]["namespace"], "web");
        assert!(sk.get("spec").is_none());

        // cluster-scoped skeletons omit the namespace key entirely
        let r = ObjRef::new(
            ObjMeta { group: "".into(), kind: "Namespace".into(), namespace: "".into(), name: "prod".into() },
            "v1",
        );
        let sk = skeleton(&r);
        assert!(sk["metadata"].get("namespace").is_none());
    }
}
