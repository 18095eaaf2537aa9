//! Spindle kubehub – cluster access for the deploy pipeline.
//!
//! Pipeline stages only see [`ClusterClient`]; the kube-backed implementation
//! lives in [`client`] and an in-memory one for tests in [`mock`].

#![forbid(unsafe_code)]

use std::time::Duration;

use serde::{Deserialize, Serialize};
use spindle_core::{Error, Manifest, Result};

pub mod client;
pub mod discovery;
pub mod mock;
pub mod patch;
pub mod selector;

pub use client::{Connection, KubeCluster};
pub use discovery::{CacheKey, DiscoveryCache, RestMapping};
pub use mock::{MockCall, MockCluster};
pub use patch::{merge_patch, pointer, PatchBody, PatchOp};
pub use selector::LabelSelector;

/// Addressable coordinates of a served kind (GVR plus kind and scope).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ResourceDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    /// Plural resource name (`deployments`).
    pub resource: String,
    pub namespaced: bool,
}

impl ResourceDescriptor {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    pub fn gvk_key(&self) -> String {
        format!("{}/{}", self.api_version(), self.kind)
    }

    /// Descriptor built from the static kind tables when discovery is unavailable.
    pub fn from_kind_table(api_version: Option<&str>, kind: &str) -> Self {
        let (group, version) = split_api_version(api_version.unwrap_or("v1"));
        Self {
            group,
            version,
            kind: kind.to_string(),
            resource: spindle_core::kinds::default_plural(kind),
            namespaced: !spindle_core::kinds::is_cluster_scoped(kind),
        }
    }
}

pub fn split_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Deletion propagation policy.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Propagation {
    Foreground,
    Background,
    Orphan,
}

/// Cluster operations the pipeline consumes. Every error is already enriched
/// with the kind/name/namespace it concerns.
#[async_trait::async_trait]
pub trait ClusterClient: Send + Sync {
    /// One-time discovery warm-up.
    async fn discover(&self) -> Result<()>;

    async fn resource_for(&self, api_version: Option<&str>, kind: &str) -> Result<ResourceDescriptor>;

    /// Fetch a live object; a missing object is [`Error::NotFound`].
    async fn get(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<Manifest>;

    async fn list_resource(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Manifest>>;

    async fn list(&self, kind: &str, namespace: Option<&str>, label_selector: Option<&str>) -> Result<Vec<Manifest>> {
        let resource = self.resource_for(None, kind).await?;
        self.list_resource(&resource, namespace, label_selector).await
    }

    /// Create or update; returns the live object.
    async fn apply(&self, manifest: &Manifest) -> Result<Manifest>;

    async fn replace(&self, manifest: &Manifest) -> Result<Manifest>;

    async fn patch(&self, kind: &str, name: &str, namespace: Option<&str>, body: &PatchBody) -> Result<Manifest>;

    async fn delete(&self, kind: &str, name: &str, namespace: Option<&str>, propagation: Propagation) -> Result<()>;
}

/// Bound applied to the version-resolution and pod-cascade listings.
pub fn list_timeout() -> Duration {
    let secs = std::env::var("SPINDLE_LIST_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(10);
    Duration::from_secs(secs)
}

/// `list` bounded by [`list_timeout`].
pub async fn list_bounded(
    client: &dyn ClusterClient,
    kind: &str,
    namespace: Option<&str>,
    label_selector: Option<&str>,
) -> Result<Vec<Manifest>> {
    let timeout = list_timeout();
    match tokio::time::timeout(timeout, client.list(kind, namespace, label_selector)).await {
        Ok(res) => res,
        Err(_) => Err(Error::upstream(
            format!("listing {} in {}", kind, namespace.unwrap_or("(cluster)")),
            anyhow::anyhow!("timed out after {}s", timeout.as_secs()),
        )),
    }
}
