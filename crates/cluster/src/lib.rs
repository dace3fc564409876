//! Cluster connection: kube client, discovery cache, error classification.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{
    api::{Api, PostParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    Client,
};
use tracing::debug;

use konverge_core::{api_version_of, kind_of, namespace_of, split_api_version, Manifest, ManifestError, ObjMeta};

#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("connecting to cluster")]
    Connect(#[source] Box<kube::Error>),

    #[error("running api discovery")]
    Discovery(#[source] Box<kube::Error>),

    #[error("unknown resource type: {gvk}")]
    UnknownResourceType { gvk: String },

    #[error("ensuring namespace {namespace} exists")]
    AssureNamespace {
        namespace: String,
        #[source]
        source: Box<kube::Error>,
    },

    #[error(transparent)]
    Manifest(#[from] ManifestError),
}

/// A connection to one cluster: kube client plus a GVK → `ApiResource`
/// discovery cache owned by this instance.
///
/// The cache is instance state on purpose; nothing ambient is mutated and
/// dropping the client releases the underlying connection pool.
#[derive(Clone)]
pub struct ClusterClient {
    client: Client,
    cache: Arc<RwLock<HashMap<String, (ApiResource, bool)>>>,
}

impl std::fmt::Debug for ClusterClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterClient")
            .field("default_namespace", &self.client.default_namespace())
            .finish_non_exhaustive()
    }
}

impl ClusterClient {
    /// Connect using the ambient kubeconfig / in-cluster environment.
    pub async fn connect() -> Result<Self, ClusterError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ClusterError::Connect(Box::new(e)))?;
        Ok(Self::new(client))
    }

    /// Wrap an already-configured client.
    pub fn new(client: Client) -> Self {
        Self { client, cache: Arc::new(RwLock::new(HashMap::new())) }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Namespace of the current context, used when namespaced manifests omit
    /// `metadata.namespace`.
    pub fn default_namespace(&self) -> &str {
        self.client.default_namespace()
    }

    /// Resolve a GVK to its `ApiResource` and scope (`true` = namespaced).
    pub async fn api_resource(
        &self,
        gvk: &GroupVersionKind,
    ) -> Result<(ApiResource, bool), ClusterError> {
        let key = gvk_key(&gvk.group, &gvk.version, &gvk.kind);
        if let Some(hit) = self.cache.read().unwrap().get(&key).cloned() {
            return Ok(hit);
        }

        self.refresh_discovery().await?;

        self.cache
            .read()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or(ClusterError::UnknownResourceType { gvk: key })
    }

    /// Resolve by group + kind alone, picking the server's preferred version.
    /// Needed when only an [`ObjMeta`] is known (readiness polling).
    pub async fn api_resource_for_kind(
        &self,
        group: &str,
        kind: &str,
    ) -> Result<(ApiResource, bool), ClusterError> {
        if let Some(hit) = self.lookup_kind(group, kind) {
            return Ok(hit);
        }

        self.refresh_discovery().await?;

        self.lookup_kind(group, kind).ok_or(ClusterError::UnknownResourceType {
            gvk: format!("{group}/{kind}"),
        })
    }

    /// Dynamic API for a manifest, resolved to the right scope and namespace.
    pub async fn api_for(&self, manifest: &Manifest) -> Result<Api<DynamicObject>, ClusterError> {
        let (group, version) = split_api_version(api_version_of(manifest)?);
        let gvk = GroupVersionKind {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind_of(manifest)?.to_string(),
        };
        let (ar, namespaced) = self.api_resource(&gvk).await?;
        Ok(self.dynamic_api(&ar, namespaced, namespace_of(manifest)))
    }

    /// Dynamic API for an identity tuple (no version known).
    pub async fn api_for_meta(&self, meta: &ObjMeta) -> Result<Api<DynamicObject>, ClusterError> {
        let (ar, namespaced) = self.api_resource_for_kind(&meta.group, &meta.kind).await?;
        Ok(self.dynamic_api(&ar, namespaced, &meta.namespace))
    }

    fn dynamic_api(&self, ar: &ApiResource, namespaced: bool, namespace: &str) -> Api<DynamicObject> {
        if namespaced {
            let ns = if namespace.is_empty() { self.default_namespace() } else { namespace };
            Api::namespaced_with(self.client.clone(), ns, ar)
        } else {
            Api::all_with(self.client.clone(), ar)
        }
    }

    /// Create the namespace if it does not exist yet. Idempotent; a racing
    /// create from another client is treated as success.
    pub async fn assure_namespace(&self, namespace: &str) -> Result<(), ClusterError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let wrap = |e: kube::Error| ClusterError::AssureNamespace {
            namespace: namespace.to_string(),
            source: Box::new(e),
        };

        if api.get_opt(namespace).await.map_err(wrap)?.is_some() {
            return Ok(());
        }

        debug!(namespace = %namespace, "creating namespace");
        let ns = Namespace {
            metadata: ObjectMeta { name: Some(namespace.to_string()), ..Default::default() },
            ..Default::default()
        };
        match api.create(&PostParams::default(), &ns).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ref ae)) if ae.code == 409 => Ok(()),
            Err(e) => Err(wrap(e)),
        }
    }

    fn lookup_kind(&self, group: &str, kind: &str) -> Option<(ApiResource, bool)> {
        self.cache
            .read()
            .unwrap()
            .values()
            .find(|(ar, _)| ar.group == group && ar.kind == kind)
            .cloned()
    }

    async fn refresh_discovery(&self) -> Result<(), ClusterError> {
        debug!("running api discovery");
        let discovery = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|e| ClusterError::Discovery(Box::new(e)))?;

        let mut cache = self.cache.write().unwrap();
        for g in discovery.groups() {
            for (ar, caps) in g.recommended_resources() {
                let namespaced = matches!(caps.scope, Scope::Namespaced);
                cache.insert(gvk_key(&ar.group, &ar.version, &ar.kind), (ar.clone(), namespaced));
            }
        }
        Ok(())
    }
}

fn gvk_key(group: &str, version: &str, kind: &str) -> String {
    if group.is_empty() {
        format!("{version}/{kind}")
    } else {
        format!("{group}/{version}/{kind}")
    }
}

/// True when the error is the API server saying the object does not exist.
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Classify a transport failure as retryable.
///
/// Covers API server timeouts and internal errors plus connection-level
/// failures anywhere in the source chain. Everything else is terminal. The
/// engine itself never retries; this is for callers that want to.
pub fn is_retryable(err: &kube::Error) -> bool {
    if let kube::Error::Api(ae) = err {
        return matches!(ae.code, 408 | 429 | 500 | 503 | 504)
            || matches!(ae.reason.as_str(), "Timeout" | "ServerTimeout" | "InternalError");
    }

    let mut source = std::error::Error::source(err);
    while let Some(e) = source {
        if let Some(io) = e.downcast_ref::<std::io::Error>() {
            use std::io::ErrorKind;
            return matches!(
                io.kind(),
                ErrorKind::UnexpectedEof
                    | ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
                    | ErrorKind::TimedOut
            );
        }
        source = e.source();
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".into(),
            message: format!("{reason} ({code})"),
            reason: reason.into(),
            code,
        })
    }

    #[test]
    fn gvk_keys_omit_empty_group() {
        assert_eq!(gvk_key("", "v1", "ConfigMap"), "v1/ConfigMap");
        assert_eq!(gvk_key("apps", "v1", "Deployment"), "apps/v1/Deployment");
    }

    #[test]
    fn not_found_classification() {
        assert!(is_not_found(&api_error(404, "NotFound")));
        assert!(!is_not_found(&api_error(409, "Conflict")));
    }

    #[test]
    fn retryable_api_errors() {
        assert!(is_retryable(&api_error(500, "InternalError")));
        assert!(is_retryable(&api_error(503, "ServiceUnavailable")));
        assert!(is_retryable(&api_error(504, "Timeout")));
        assert!(is_retryable(&api_error(408, "Timeout")));
        assert!(is_retryable(&api_error(429, "TooManyRequests")));
    }

    #[test]
    fn terminal_api_errors() {
        assert!(!is_retryable(&api_error(404, "NotFound")));
        assert!(!is_retryable(&api_error(403, "Forbidden")));
        assert!(!is_retryable(&api_error(409, "Conflict")));
        assert!(!is_retryable(&api_error(422, "Invalid")));
    }
}
