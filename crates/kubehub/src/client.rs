//! kube-rs backed [`ClusterClient`].

use std::sync::Arc;

use anyhow::Context;
use kube::{
    api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client, Config,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as Json};
use spindle_core::{Error, Manifest, Result};
use tracing::{debug, info};

use crate::discovery::{CacheKey, DiscoveryCache, RestMapping};
use crate::{ClusterClient, PatchBody, Propagation, ResourceDescriptor};

/// How to reach a cluster. Without `host` the ambient kube config is used.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Connection {
    #[serde(default)]
    pub host: Option<String>,
    /// Base64 PEM bundle, as in kubeconfig `certificate-authority-data`.
    #[serde(default)]
    pub ca_data: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub insecure: bool,
}

pub struct KubeCluster {
    client: Client,
    cache: Arc<DiscoveryCache>,
    key: CacheKey,
    field_manager: String,
}

impl KubeCluster {
    pub async fn connect(conn: &Connection, cache: Arc<DiscoveryCache>) -> anyhow::Result<Self> {
        let (config, key) = match conn.host.as_deref() {
            Some(host) => {
                let kc: Kubeconfig = serde_json::from_value(json!({
                    "apiVersion": "v1",
                    "kind": "Config",
                    "clusters": [{"name": "spindle", "cluster": {
                        "server": host,
                        "certificate-authority-data": conn.ca_data,
                        "insecure-skip-tls-verify": conn.insecure,
                    }}],
                    "users": [{"name": "spindle", "user": {"token": conn.token}}],
                    "contexts": [{"name": "spindle", "context": {"cluster": "spindle", "user": "spindle"}}],
                    "current-context": "spindle",
                }))
                .context("building kubeconfig for account")?;
                let config = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                    .await
                    .context("loading kubeconfig for account")?;
                let key = CacheKey::new(host, conn.ca_data.as_deref().map(str::as_bytes), conn.token.as_deref());
                (config, key)
            }
            None => {
                let config = Config::infer().await.context("inferring kube config")?;
                let ca: Vec<u8> = config.root_cert.iter().flatten().flatten().copied().collect();
                let key = CacheKey::new(&config.cluster_url.to_string(), Some(&ca), None);
                (config, key)
            }
        };
        info!(host = %key.host, "connecting to cluster");
        let client = Client::try_from(config).context("building kube client")?;
        Ok(Self::from_client(client, key, cache))
    }

    pub fn from_client(client: Client, key: CacheKey, cache: Arc<DiscoveryCache>) -> Self {
        Self { client, cache, key, field_manager: "spindle".to_string() }
    }

    async fn mapping(&self) -> Result<Arc<RestMapping>> {
        let client = self.client.clone();
        self.cache
            .get_or_load(&self.key, || async move {
                let discovery = Discovery::new(client)
                    .run()
                    .await
                    .map_err(|e| Error::upstream("running discovery", e))?;
                let mut out = Vec::new();
                for group in discovery.groups() {
                    for (ar, caps) in group.recommended_resources() {
                        out.push(ResourceDescriptor {
                            group: ar.group.clone(),
                            version: ar.version.clone(),
                            kind: ar.kind.clone(),
                            resource: ar.plural.clone(),
                            namespaced: matches!(caps.scope, Scope::Namespaced),
                        });
                    }
                }
                Ok(out)
            })
            .await
    }

    fn api_resource(r: &ResourceDescriptor) -> ApiResource {
        ApiResource {
            group: r.group.clone(),
            version: r.version.clone(),
            api_version: r.api_version(),
            kind: r.kind.clone(),
            plural: r.resource.clone(),
        }
    }

    /// Api for a single object; namespaced kinds require a namespace.
    fn object_api(&self, r: &ResourceDescriptor, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let ar = Self::api_resource(r);
        if r.namespaced {
            match namespace {
                Some(ns) => Ok(Api::namespaced_with(self.client.clone(), ns, &ar)),
                None => Err(Error::Validation(format!("namespace required for namespaced kind {}", r.kind))),
            }
        } else {
            Ok(Api::all_with(self.client.clone(), &ar))
        }
    }

    fn list_api(&self, r: &ResourceDescriptor, namespace: Option<&str>) -> Api<DynamicObject> {
        let ar = Self::api_resource(r);
        match (r.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            _ => Api::all_with(self.client.clone(), &ar),
        }
    }
}

fn describe(kind: &str, name: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{} {} in {}", kind, name, ns),
        None => format!("{} {}", kind, name),
    }
}

fn map_kube_err(e: kube::Error, what: String) -> Error {
    match &e {
        kube::Error::Api(ae) if ae.code == 404 => Error::NotFound(format!("{} not found", what)),
        _ => Error::upstream(what, e),
    }
}

fn to_manifest(obj: &DynamicObject, r: &ResourceDescriptor) -> Result<Manifest> {
    let mut v = serde_json::to_value(obj).map_err(|e| Error::upstream("serializing DynamicObject", e))?;
    if let Some(map) = v.as_object_mut() {
        // list items come back without type meta
        map.entry("apiVersion").or_insert_with(|| Json::String(r.api_version()));
        map.entry("kind").or_insert_with(|| Json::String(r.kind.clone()));
        if let Some(meta) = map.get_mut("metadata").and_then(|m| m.as_object_mut()) {
            meta.remove("managedFields");
        }
    }
    Manifest::new(v)
}

#[async_trait::async_trait]
impl ClusterClient for KubeCluster {
    async fn discover(&self) -> Result<()> {
        let mapping = self.mapping().await?;
        debug!(host = %self.key.host, resources = mapping.len(), "discovery ready");
        Ok(())
    }

    async fn resource_for(&self, api_version: Option<&str>, kind: &str) -> Result<ResourceDescriptor> {
        let mapping = self.mapping().await?;
        mapping
            .lookup(api_version, kind)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("kind {} is not served by {}", kind, self.key.host)))
    }

    async fn get(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<Manifest> {
        let r = self.resource_for(None, kind).await?;
        let api = self.object_api(&r, namespace)?;
        let what = describe(kind, name, namespace);
        match api.get_opt(name).await {
            Ok(Some(obj)) => to_manifest(&obj, &r),
            Ok(None) => Err(Error::NotFound(format!("{} not found", what))),
            Err(e) => Err(map_kube_err(e, format!("getting {}", what))),
        }
    }

    async fn list_resource(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Manifest>> {
        let api = self.list_api(resource, namespace);
        let lp = match label_selector {
            Some(sel) => ListParams::default().labels(sel),
            None => ListParams::default(),
        };
        let list = api.list(&lp).await.map_err(|e| {
            Error::upstream(format!("listing {} in {}", resource.kind, namespace.unwrap_or("(all)")), e)
        })?;
        debug!(kind = %resource.kind, ns = ?namespace, count = list.items.len(), "listed");
        list.items.iter().map(|o| to_manifest(o, resource)).collect()
    }

    async fn apply(&self, manifest: &Manifest) -> Result<Manifest> {
        let r = self.resource_for(Some(manifest.api_version()), manifest.kind()).await?;
        let api = self.object_api(&r, manifest.namespace())?;
        let pp = PatchParams::apply(&self.field_manager).force();
        let obj = api
            .patch(manifest.name(), &pp, &Patch::Apply(manifest.as_value()))
            .await
            .map_err(|e| Error::upstream(format!("applying {}", manifest.describe()), e))?;
        to_manifest(&obj, &r)
    }

    async fn replace(&self, manifest: &Manifest) -> Result<Manifest> {
        let r = self.resource_for(Some(manifest.api_version()), manifest.kind()).await?;
        let api = self.object_api(&r, manifest.namespace())?;
        let what = manifest.describe();
        let existing = api.get(manifest.name()).await.map_err(|e| map_kube_err(e, format!("getting {}", what)))?;
        let mut body = manifest.clone();
        if let Some(rv) = existing.metadata.resource_version {
            body.map_at_mut(&["metadata"]).insert("resourceVersion".into(), Json::String(rv));
        }
        let obj: DynamicObject = serde_json::from_value(body.into_value())
            .map_err(|e| Error::Validation(format!("{} is not a valid object: {}", what, e)))?;
        let out = api
            .replace(manifest.name(), &PostParams::default(), &obj)
            .await
            .map_err(|e| Error::upstream(format!("replacing {}", what), e))?;
        to_manifest(&out, &r)
    }

    async fn patch(&self, kind: &str, name: &str, namespace: Option<&str>, body: &PatchBody) -> Result<Manifest> {
        let r = self.resource_for(None, kind).await?;
        let api = self.object_api(&r, namespace)?;
        let merge = body.to_merge();
        let obj = api
            .patch(name, &PatchParams::default(), &Patch::Merge(&merge))
            .await
            .map_err(|e| map_kube_err(e, format!("patching {}", describe(kind, name, namespace))))?;
        to_manifest(&obj, &r)
    }

    async fn delete(&self, kind: &str, name: &str, namespace: Option<&str>, propagation: Propagation) -> Result<()> {
        let r = self.resource_for(None, kind).await?;
        let api = self.object_api(&r, namespace)?;
        let dp = match propagation {
            Propagation::Foreground => DeleteParams::foreground(),
            Propagation::Background => DeleteParams::background(),
            Propagation::Orphan => DeleteParams::orphan(),
        };
        api.delete(name, &dp)
            .await
            .map_err(|e| map_kube_err(e, format!("deleting {}", describe(kind, name, namespace))))?;
        Ok(())
    }
}
