//! Discovery cache: REST mappings per cluster host, invalidated when the
//! credentials used for that host change.
//!
//! The cache is an explicit component owned by whoever composes the
//! process; clients receive it by `Arc`. Each host has its own async slot so
//! a slow discovery against one host never blocks another, while concurrent
//! first loads against the same host wait for a single discovery run.

use std::future::Future;
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};

use metrics::counter;
use rustc_hash::{FxHashMap, FxHasher};
use spindle_core::Result;
use tracing::{debug, info};

use crate::ResourceDescriptor;

/// Host plus a fingerprint of the credential material used to reach it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub host: String,
    pub fingerprint: u64,
}

impl CacheKey {
    pub fn new(host: &str, ca_data: Option<&[u8]>, token: Option<&str>) -> Self {
        let mut h = FxHasher::default();
        ca_data.unwrap_or_default().hash(&mut h);
        token.unwrap_or_default().hash(&mut h);
        Self { host: host.to_string(), fingerprint: h.finish() }
    }
}

/// Kind → resource mapping for one cluster.
#[derive(Debug, Clone, Default)]
pub struct RestMapping {
    by_gvk: FxHashMap<String, ResourceDescriptor>,
    by_kind: FxHashMap<String, ResourceDescriptor>,
}

impl RestMapping {
    pub fn from_resources(resources: Vec<ResourceDescriptor>) -> Self {
        let mut me = Self::default();
        for r in resources {
            let kind_key = r.kind.to_ascii_lowercase();
            // core group wins when a kind is served by several groups
            let replace = match me.by_kind.get(&kind_key) {
                Some(existing) => r.group.is_empty() && !existing.group.is_empty(),
                None => true,
            };
            if replace {
                me.by_kind.insert(kind_key, r.clone());
            }
            me.by_gvk.insert(r.gvk_key().to_ascii_lowercase(), r);
        }
        me
    }

    /// Exact apiVersion/kind match first, then any served version of `kind`.
    pub fn lookup(&self, api_version: Option<&str>, kind: &str) -> Option<&ResourceDescriptor> {
        if let Some(av) = api_version.filter(|s| !s.is_empty()) {
            let key = format!("{}/{}", av, kind).to_ascii_lowercase();
            if let Some(r) = self.by_gvk.get(&key) {
                return Some(r);
            }
        }
        self.by_kind.get(&kind.to_ascii_lowercase())
    }

    pub fn len(&self) -> usize {
        self.by_gvk.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_gvk.is_empty()
    }
}

struct Slot {
    fingerprint: u64,
    mapping: Arc<RestMapping>,
}

type HostSlot = Arc<tokio::sync::Mutex<Option<Slot>>>;

#[derive(Default)]
pub struct DiscoveryCache {
    hosts: Mutex<FxHashMap<String, HostSlot>>,
}

impl DiscoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, host: &str) -> HostSlot {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts.entry(host.to_string()).or_default().clone()
    }

    /// Return the cached mapping for `key`, running `load` when the host is
    /// uncached or was cached under a different credential fingerprint.
    pub async fn get_or_load<F, Fut>(&self, key: &CacheKey, load: F) -> Result<Arc<RestMapping>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<ResourceDescriptor>>>,
    {
        let slot = self.slot(&key.host);
        let mut guard = slot.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.fingerprint == key.fingerprint {
                debug!(host = %key.host, "discovery cache hit");
                return Ok(cached.mapping.clone());
            }
            info!(host = %key.host, "credentials changed; discarding cached discovery");
        }
        counter!("discovery_cache_miss_total", 1u64);
        let mapping = Arc::new(RestMapping::from_resources(load().await?));
        info!(host = %key.host, resources = mapping.len(), "discovery cached");
        *guard = Some(Slot { fingerprint: key.fingerprint, mapping: mapping.clone() });
        Ok(mapping)
    }

    pub fn invalidate(&self, host: &str) {
        let mut hosts = self.hosts.lock().unwrap_or_else(|e| e.into_inner());
        hosts.remove(host);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn resources() -> Vec<ResourceDescriptor> {
        vec![
            ResourceDescriptor::from_kind_table(Some("apps/v1"), "Deployment"),
            ResourceDescriptor::from_kind_table(Some("events.k8s.io/v1"), "Event"),
            ResourceDescriptor::from_kind_table(Some("v1"), "Event"),
        ]
    }

    #[test]
    fn lookup_prefers_exact_then_core() {
        let m = RestMapping::from_resources(resources());
        assert_eq!(m.lookup(None, "deployment").unwrap().group, "apps");
        assert_eq!(m.lookup(None, "Event").unwrap().group, "");
        assert_eq!(m.lookup(Some("events.k8s.io/v1"), "Event").unwrap().group, "events.k8s.io");
        assert!(m.lookup(None, "Widget").is_none());
    }

    #[test]
    fn fingerprint_tracks_credentials() {
        let a = CacheKey::new("https://k8s", Some(&b"ca"[..]), Some("t1"));
        let b = CacheKey::new("https://k8s", Some(&b"ca"[..]), Some("t2"));
        let c = CacheKey::new("https://k8s", Some(&b"ca"[..]), Some("t1"));
        assert_ne!(a.fingerprint, b.fingerprint);
        assert_eq!(a, c);
        // field boundaries count: moving bytes between CA and token changes the key
        let d = CacheKey::new("https://k8s", Some(&b"cat"[..]), Some("1"));
        assert_ne!(a.fingerprint, d.fingerprint);
        assert_ne!(a.fingerprint, CacheKey::new("https://k8s", None, Some("t1")).fingerprint);
    }

    #[tokio::test]
    async fn reloads_only_on_credential_change() {
        let cache = DiscoveryCache::new();
        let counter = AtomicUsize::new(0);
        let loads = &counter;
        let load = || async move {
            loads.fetch_add(1, Ordering::SeqCst);
            Ok::<_, spindle_core::Error>(resources())
        };
        let k1 = CacheKey::new("https://k8s", None, Some("t1"));
        cache.get_or_load(&k1, load).await.unwrap();
        cache.get_or_load(&k1, load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 1);

        let k2 = CacheKey::new("https://k8s", None, Some("rotated"));
        cache.get_or_load(&k2, load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 2);

        let other = CacheKey::new("https://other", None, Some("t1"));
        cache.get_or_load(&other, load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 3);

        cache.invalidate("https://k8s");
        cache.get_or_load(&k2, load).await.unwrap();
        assert_eq!(loads.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn failed_load_leaves_slot_empty() {
        let cache = DiscoveryCache::new();
        let key = CacheKey::new("https://k8s", None, None);
        let res = cache
            .get_or_load(&key, || async { Err(spindle_core::Error::upstream("discovery", anyhow::anyhow!("down"))) })
            .await;
        assert!(res.is_err());
        let ok = cache.get_or_load(&key, || async { Ok::<_, spindle_core::Error>(resources()) }).await.unwrap();
        assert_eq!(ok.len(), 3);
    }
}
