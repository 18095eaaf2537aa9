//! In-memory [`ClusterClient`] used by tests across the workspace.
//!
//! Objects are keyed by (kind, namespace, name) with kinds compared
//! case-insensitively. Created objects receive a uuid and a synthetic,
//! strictly increasing creationTimestamp so ordering by timestamp string
//! matches insertion order.

use std::sync::Mutex;

use rustc_hash::FxHashSet;
use serde_json::{json, Value as Json};
use spindle_core::{Error, Manifest, Result};

use crate::patch::merge_patch;
use crate::selector::LabelSelector;
use crate::{ClusterClient, PatchBody, Propagation, ResourceDescriptor};

/// Mutating call observed by the mock, in call order.
#[derive(Debug, Clone, PartialEq)]
pub enum MockCall {
    Apply { kind: String, name: String, namespace: Option<String> },
    Replace { kind: String, name: String, namespace: Option<String> },
    Patch { kind: String, name: String, namespace: Option<String>, body: PatchBody },
    Delete { kind: String, name: String, namespace: Option<String>, propagation: Propagation },
}

impl MockCall {
    pub fn name(&self) -> &str {
        match self {
            MockCall::Apply { name, .. }
            | MockCall::Replace { name, .. }
            | MockCall::Patch { name, .. }
            | MockCall::Delete { name, .. } => name,
        }
    }
}

#[derive(Default)]
struct State {
    objects: Vec<Manifest>,
    calls: Vec<MockCall>,
    failing: FxHashSet<(String, String)>,
    clock: u64,
}

impl State {
    fn position(&self, kind: &str, name: &str, namespace: Option<&str>) -> Option<usize> {
        self.objects
            .iter()
            .position(|o| o.kind().eq_ignore_ascii_case(kind) && o.name() == name && o.namespace() == namespace)
    }

    fn check(&self, op: &str, kind: &str) -> Result<()> {
        if self.failing.contains(&(op.to_string(), kind.to_ascii_lowercase())) {
            return Err(Error::upstream(format!("{} {}", op, kind), anyhow::anyhow!("injected failure")));
        }
        Ok(())
    }

    fn stamp(&mut self, m: &mut Manifest) {
        let tick = self.clock;
        self.clock += 1;
        let meta = m.map_at_mut(&["metadata"]);
        meta.entry("uid").or_insert_with(|| Json::String(uuid::Uuid::new_v4().to_string()));
        meta.entry("creationTimestamp").or_insert_with(|| {
            Json::String(format!("2030-01-01T{:02}:{:02}:{:02}Z", tick / 3600 % 24, tick / 60 % 60, tick % 60))
        });
        meta.entry("generation").or_insert(json!(1));
    }
}

#[derive(Default)]
pub struct MockCluster {
    state: Mutex<State>,
}

fn describe(kind: &str, name: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{} {} in {}", kind, name, ns),
        None => format!("{} {}", kind, name),
    }
}

impl MockCluster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_objects(objects: impl IntoIterator<Item = Manifest>) -> Self {
        let me = Self::new();
        for o in objects {
            me.insert(o);
        }
        me
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Seed an object without recording a call. Missing uid, creationTimestamp
    /// and generation are filled in.
    pub fn insert(&self, mut m: Manifest) -> Manifest {
        let mut st = self.lock();
        st.stamp(&mut m);
        match st.position(m.kind(), m.name(), m.namespace()) {
            Some(i) => st.objects[i] = m.clone(),
            None => st.objects.push(m.clone()),
        }
        m
    }

    /// Make every `op` (`get`, `list`, `apply`, `replace`, `patch`, `delete`)
    /// against `kind` fail with an upstream error.
    pub fn fail_on(&self, op: &str, kind: &str) {
        self.lock().failing.insert((op.to_string(), kind.to_ascii_lowercase()));
    }

    pub fn find(&self, kind: &str, name: &str, namespace: Option<&str>) -> Option<Manifest> {
        let st = self.lock();
        st.position(kind, name, namespace).map(|i| st.objects[i].clone())
    }

    pub fn objects(&self) -> Vec<Manifest> {
        self.lock().objects.clone()
    }

    pub fn calls(&self) -> Vec<MockCall> {
        self.lock().calls.clone()
    }
}

#[async_trait::async_trait]
impl ClusterClient for MockCluster {
    async fn discover(&self) -> Result<()> {
        Ok(())
    }

    async fn resource_for(&self, api_version: Option<&str>, kind: &str) -> Result<ResourceDescriptor> {
        Ok(ResourceDescriptor::from_kind_table(api_version, kind))
    }

    async fn get(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<Manifest> {
        let st = self.lock();
        st.check("get", kind)?;
        st.position(kind, name, namespace)
            .map(|i| st.objects[i].clone())
            .ok_or_else(|| Error::NotFound(format!("{} not found", describe(kind, name, namespace))))
    }

    async fn list_resource(
        &self,
        resource: &ResourceDescriptor,
        namespace: Option<&str>,
        label_selector: Option<&str>,
    ) -> Result<Vec<Manifest>> {
        let selector = LabelSelector::parse(label_selector.unwrap_or(""))?;
        let st = self.lock();
        st.check("list", &resource.kind)?;
        Ok(st
            .objects
            .iter()
            .filter(|o| o.kind().eq_ignore_ascii_case(&resource.kind))
            .filter(|o| namespace.is_none() || o.namespace() == namespace)
            .filter(|o| selector.matches(&o.labels()))
            .cloned()
            .collect())
    }

    async fn apply(&self, manifest: &Manifest) -> Result<Manifest> {
        let mut st = self.lock();
        st.check("apply", manifest.kind())?;
        st.calls.push(MockCall::Apply {
            kind: manifest.kind().to_string(),
            name: manifest.name().to_string(),
            namespace: manifest.namespace().map(str::to_string),
        });
        let mut m = manifest.clone();
        if let Some(i) = st.position(m.kind(), m.name(), m.namespace()) {
            let prev = &st.objects[i];
            let meta = json!({
                "uid": prev.uid(),
                "creationTimestamp": prev.creation_timestamp(),
                "generation": prev.generation().unwrap_or(1) + 1,
            });
            merge_patch(m.map_at_mut(&[]).entry("metadata").or_insert(Json::Null), &meta);
            st.objects[i] = m.clone();
        } else {
            st.stamp(&mut m);
            st.objects.push(m.clone());
        }
        Ok(m)
    }

    async fn replace(&self, manifest: &Manifest) -> Result<Manifest> {
        let mut st = self.lock();
        st.check("replace", manifest.kind())?;
        let (kind, name, namespace) = (manifest.kind(), manifest.name(), manifest.namespace());
        let i = st
            .position(kind, name, namespace)
            .ok_or_else(|| Error::NotFound(format!("{} not found", describe(kind, name, namespace))))?;
        st.calls.push(MockCall::Replace {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
        });
        let prev = &st.objects[i];
        let meta = json!({
            "uid": prev.uid(),
            "creationTimestamp": prev.creation_timestamp(),
            "generation": prev.generation().unwrap_or(1) + 1,
        });
        let mut m = manifest.clone();
        merge_patch(m.map_at_mut(&[]).entry("metadata").or_insert(Json::Null), &meta);
        st.objects[i] = m.clone();
        Ok(m)
    }

    async fn patch(&self, kind: &str, name: &str, namespace: Option<&str>, body: &PatchBody) -> Result<Manifest> {
        let mut st = self.lock();
        st.check("patch", kind)?;
        let i = st
            .position(kind, name, namespace)
            .ok_or_else(|| Error::NotFound(format!("{} not found", describe(kind, name, namespace))))?;
        st.calls.push(MockCall::Patch {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            body: body.clone(),
        });
        let mut doc = st.objects[i].as_value().clone();
        merge_patch(&mut doc, &body.to_merge());
        let patched = Manifest::new(doc)?;
        st.objects[i] = patched.clone();
        Ok(patched)
    }

    async fn delete(&self, kind: &str, name: &str, namespace: Option<&str>, propagation: Propagation) -> Result<()> {
        let mut st = self.lock();
        st.check("delete", kind)?;
        let i = st
            .position(kind, name, namespace)
            .ok_or_else(|| Error::NotFound(format!("{} not found", describe(kind, name, namespace))))?;
        st.calls.push(MockCall::Delete {
            kind: kind.to_string(),
            name: name.to_string(),
            namespace: namespace.map(str::to_string),
            propagation,
        });
        st.objects.remove(i);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cm(name: &str, ns: &str) -> Manifest {
        Manifest::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {"name": name, "namespace": ns, "labels": {"app.kubernetes.io/managed-by": "spinnaker"}}
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn apply_stamps_and_preserves_identity() {
        let mock = MockCluster::new();
        let first = mock.apply(&cm("a", "default")).await.unwrap();
        let uid = first.uid().unwrap().to_string();
        assert!(!first.creation_timestamp().is_empty());

        let again = mock.apply(&cm("a", "default")).await.unwrap();
        assert_eq!(again.uid(), Some(uid.as_str()));
        assert_eq!(again.generation(), Some(2));
        assert_eq!(mock.objects().len(), 1);
        assert_eq!(mock.calls().len(), 2);
    }

    #[tokio::test]
    async fn replace_swaps_body_and_keeps_uid() {
        let mock = MockCluster::new();
        let mut labelled = cm("a", "default");
        labelled.set_label("stale", "yes");
        let first = mock.apply(&labelled).await.unwrap();

        let out = mock.replace(&cm("a", "default")).await.unwrap();
        assert_eq!(out.uid(), first.uid());
        assert_eq!(out.label("stale"), None);
        assert!(matches!(mock.calls()[1], MockCall::Replace { .. }));
        assert!(mock.replace(&cm("b", "default")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn timestamps_sort_in_insertion_order() {
        let mock = MockCluster::new();
        let a = mock.insert(cm("a", "default"));
        let b = mock.insert(cm("b", "default"));
        assert!(a.creation_timestamp() < b.creation_timestamp());
    }

    #[tokio::test]
    async fn list_filters_namespace_and_selector() {
        let mock = MockCluster::with_objects([cm("a", "default"), cm("b", "other")]);
        let mut unmanaged = cm("c", "default");
        unmanaged.set_label("app.kubernetes.io/managed-by", "helm");
        mock.insert(unmanaged);

        let all = mock.list("configmap", None, None).await.unwrap();
        assert_eq!(all.len(), 3);
        let managed = mock
            .list("ConfigMap", Some("default"), Some(spindle_core::annotations::MANAGED_BY_SELECTOR))
            .await
            .unwrap();
        assert_eq!(managed.iter().map(|m| m.name()).collect::<Vec<_>>(), vec!["a"]);
    }

    #[tokio::test]
    async fn missing_objects_are_not_found() {
        let mock = MockCluster::new();
        let err = mock.get("Service", "lb", Some("default")).await.unwrap_err();
        assert!(err.is_not_found());
        let err = mock.delete("Service", "lb", Some("default"), Propagation::Foreground).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn patch_merges_fields() {
        let mock = MockCluster::with_objects([cm("a", "default")]);
        let body = PatchBody::Fields(vec![crate::PatchOp::Add {
            path: crate::pointer(&["metadata", "labels", "lb"]),
            value: json!("web"),
        }]);
        let out = mock.patch("ConfigMap", "a", Some("default"), &body).await.unwrap();
        assert_eq!(out.label("lb"), Some("web"));
        assert_eq!(out.label("app.kubernetes.io/managed-by"), Some("spinnaker"));
    }

    #[tokio::test]
    async fn injected_failures() {
        let mock = MockCluster::new();
        mock.fail_on("list", "Pod");
        assert!(crate::list_bounded(&mock, "Pod", Some("default"), None).await.is_err());
        assert!(mock.list("ConfigMap", None, None).await.is_ok());
    }
}
