//! Spindle version resolver.
//!
//! Versioned manifests get an immutable `-vNNN` suffix. The next number is
//! derived from what is live in the cluster at call time; there is no
//! central sequence, so concurrent deploys to one cluster key can race.

#![forbid(unsafe_code)]

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use spindle_core::annotations::{
    self, cluster_key, cluster_keys_match, ARTIFACT_VERSION, MANAGED_BY_SELECTOR, MONIKER_CLUSTER, MONIKER_SEQUENCE,
    STRATEGY_VERSIONED,
};
use spindle_core::{kinds, Manifest, Result};
use spindle_kubehub::{list_bounded, ClusterClient};
use tracing::{debug, info};

pub mod history;

pub const MAX_VERSION: u32 = 999;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpinnakerVersion {
    /// `v%03d`
    pub long: String,
    pub short: String,
}

impl SpinnakerVersion {
    pub fn new(n: u32) -> Self {
        Self { long: format!("v{:03}", n), short: n.to_string() }
    }
}

impl fmt::Display for SpinnakerVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.long)
    }
}

/// The versioning annotation decides when present; otherwise the kind does.
pub fn is_versioned(m: &Manifest) -> bool {
    match m.annotation(STRATEGY_VERSIONED) {
        Some(v) => v == "true",
        None => kinds::versioned_by_default(m.kind()),
    }
}

/// Next version after `current`. Non-numeric input counts as 0; past 999 wraps to 0.
pub fn increment(current: &str) -> SpinnakerVersion {
    let n: i64 = current.trim().parse().unwrap_or(0);
    let next = n + 1;
    if next > MAX_VERSION as i64 || next < 0 {
        SpinnakerVersion::new(0)
    } else {
        SpinnakerVersion::new(next as u32)
    }
}

/// Newest live object in `cluster` carrying a sequence label. Newest is
/// decided by comparing creationTimestamp strings.
pub async fn newest_version(
    client: &dyn ClusterClient,
    kind: &str,
    namespace: Option<&str>,
    cluster: &str,
) -> Result<Option<Manifest>> {
    let items = list_bounded(client, kind, namespace, Some(MANAGED_BY_SELECTOR))
        .await
        .map_err(|e| e.context(format!("resolving version of {}", cluster)))?;
    let newest = items
        .into_iter()
        .filter(|o| o.annotation(MONIKER_CLUSTER).map(|c| cluster_keys_match(c, cluster)).unwrap_or(false))
        .filter(|o| o.label(MONIKER_SEQUENCE).is_some())
        .max_by(|a, b| a.creation_timestamp().cmp(b.creation_timestamp()));
    Ok(newest)
}

/// Sequence of the newest live version in `cluster`, or `"-1"` when none.
pub async fn current_version(
    client: &dyn ClusterClient,
    kind: &str,
    namespace: Option<&str>,
    cluster: &str,
) -> Result<String> {
    let newest = newest_version(client, kind, namespace, cluster).await?;
    let current = newest
        .as_ref()
        .and_then(|o| o.annotation(MONIKER_SEQUENCE))
        .unwrap_or("-1")
        .to_string();
    debug!(cluster = %cluster, newest = ?newest.as_ref().map(|o| o.name()), current = %current, "current version");
    Ok(current)
}

/// Rename to `<name>-<long>` and stamp version annotations and labels on the
/// manifest and, for workload controllers, on its pod template.
pub fn apply_version(m: &mut Manifest, v: &SpinnakerVersion) {
    let name = format!("{}-{}", m.name(), v.long);
    m.set_name(&name);
    let pairs = [(ARTIFACT_VERSION, &v.long), (MONIKER_SEQUENCE, &v.short)];
    for (k, val) in pairs {
        m.set_annotation(k, val);
        m.set_label(k, val);
    }
    if kinds::is_workload_controller(m.kind()) {
        if let Some(path) = kinds::pod_template_path(m.kind()) {
            for section in ["annotations", "labels"] {
                let mut p: Vec<&str> = path.to_vec();
                p.extend(["metadata", section]);
                let map = m.map_at_mut(&p);
                for (k, val) in pairs {
                    map.insert(k.to_string(), serde_json::Value::String(val.to_string()));
                }
            }
        }
    }
}

/// Resolve and stamp the next version when `m` is versioned. The cluster key
/// comes from the moniker annotation, else from kind and current name.
pub async fn assign_version(client: &dyn ClusterClient, m: &mut Manifest) -> Result<Option<SpinnakerVersion>> {
    if !is_versioned(m) {
        return Ok(None);
    }
    let cluster = m
        .annotation(MONIKER_CLUSTER)
        .map(str::to_string)
        .unwrap_or_else(|| cluster_key(m.kind(), m.name()));
    let current = current_version(client, m.kind(), m.namespace(), &cluster).await?;
    let next = increment(&current);
    info!(manifest = %m.describe(), cluster = %cluster, from = %current, to = %next, "assigning version");
    apply_version(m, &next);
    Ok(Some(next))
}

static VERSION_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"-v[0-9]{3,}$").unwrap());

/// Strip a trailing `-vNNN` (three or more digits, lower-case `v`).
pub fn name_without_version(name: &str) -> &str {
    match VERSION_SUFFIX.find(name) {
        Some(m) => &name[..m.start()],
        None => name,
    }
}

/// Logical artifact name for a possibly-versioned manifest.
pub fn logical_name(m: &Manifest) -> &str {
    m.annotation(annotations::ARTIFACT_NAME).unwrap_or_else(|| name_without_version(m.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spindle_kubehub::MockCluster;

    fn rs(name: &str, cluster: &str, seq: Option<&str>, ts: &str) -> Manifest {
        let mut m = Manifest::new(json!({
            "apiVersion": "apps/v1",
            "kind": "ReplicaSet",
            "metadata": {
                "name": name,
                "namespace": "default",
                "creationTimestamp": ts,
                "labels": {"app.kubernetes.io/managed-by": "spinnaker"},
                "annotations": {"moniker.spinnaker.io/cluster": cluster}
            }
        }))
        .unwrap();
        if let Some(s) = seq {
            m.set_label(MONIKER_SEQUENCE, s);
            m.set_annotation(MONIKER_SEQUENCE, s);
        }
        m
    }

    #[test]
    fn increment_wraps() {
        assert_eq!(increment("1"), SpinnakerVersion { long: "v002".into(), short: "2".into() });
        assert_eq!(increment("999"), SpinnakerVersion { long: "v000".into(), short: "0".into() });
        assert_eq!(increment("-1"), SpinnakerVersion::new(0));
        assert_eq!(increment("abc"), SpinnakerVersion::new(1));
    }

    #[test]
    fn strips_only_long_lowercase_suffix() {
        assert_eq!(name_without_version("test-name-v000"), "test-name");
        assert_eq!(name_without_version("test-name-v1234"), "test-name");
        assert_eq!(name_without_version("test-name-v1"), "test-name-v1");
        assert_eq!(name_without_version("test-name-V001"), "test-name-V001");
        // Arabic-Indic digits are not a version suffix
        assert_eq!(name_without_version("test-name-v\u{0661}\u{0662}\u{0663}"), "test-name-v\u{0661}\u{0662}\u{0663}");
    }

    #[test]
    fn versioned_classification() {
        let mut cm = Manifest::new(json!({"kind": "ConfigMap", "metadata": {"name": "c"}})).unwrap();
        assert!(is_versioned(&cm));
        cm.set_annotation(STRATEGY_VERSIONED, "false");
        assert!(!is_versioned(&cm));
        let mut dep = Manifest::new(json!({"kind": "Deployment", "metadata": {"name": "d"}})).unwrap();
        assert!(!is_versioned(&dep));
        dep.set_annotation(STRATEGY_VERSIONED, "true");
        assert!(is_versioned(&dep));
    }

    #[test]
    fn apply_version_stamps_template() {
        let mut m = Manifest::new(json!({
            "kind": "ReplicaSet",
            "metadata": {"name": "web"},
            "spec": {"template": {"metadata": {"labels": {"app": "web"}}}}
        }))
        .unwrap();
        apply_version(&mut m, &SpinnakerVersion::new(3));
        assert_eq!(m.name(), "web-v003");
        assert_eq!(m.annotation(ARTIFACT_VERSION), Some("v003"));
        assert_eq!(m.label(MONIKER_SEQUENCE), Some("3"));
        assert_eq!(m.pointer("/spec/template/metadata/labels/app"), Some(&json!("web")));
        assert_eq!(m.pointer("/spec/template/metadata/labels/moniker.spinnaker.io~1sequence"), Some(&json!("3")));
        assert_eq!(
            m.pointer("/spec/template/metadata/annotations/artifact.spinnaker.io~1version"),
            Some(&json!("v003"))
        );
    }

    #[tokio::test]
    async fn current_version_reads_newest_by_timestamp_string() {
        let mock = MockCluster::with_objects([
            rs("web-v004", "replicaSet web", Some("4"), "2024-01-01T00:00:00Z"),
            rs("web-v007", "replicaSet web", Some("7"), "2024-03-01T00:00:00Z"),
            rs("web-v005", "replicaSet web", Some("5"), "2024-02-01T00:00:00Z"),
            rs("web-v009", "replicaSet web", None, "2025-01-01T00:00:00Z"),
            rs("api-v010", "replicaSet api", Some("10"), "2025-01-01T00:00:00Z"),
        ]);
        let cur = current_version(&mock, "ReplicaSet", Some("default"), "replicaSet web").await.unwrap();
        assert_eq!(cur, "7");
        let none = current_version(&mock, "ReplicaSet", Some("default"), "replicaSet other").await.unwrap();
        assert_eq!(none, "-1");
    }

    #[tokio::test]
    async fn assign_version_uses_cluster_annotation() {
        let mock = MockCluster::with_objects([rs("web-v001", "replicaSet web", Some("1"), "2024-01-01T00:00:00Z")]);
        let mut m = Manifest::new(json!({
            "kind": "ReplicaSet",
            "metadata": {"name": "web", "namespace": "default", "annotations": {"moniker.spinnaker.io/cluster": "replicaSet web"}}
        }))
        .unwrap();
        let v = assign_version(&mock, &mut m).await.unwrap();
        assert_eq!(v, Some(SpinnakerVersion::new(2)));
        assert_eq!(m.name(), "web-v002");
        assert_eq!(logical_name(&m), "web");

        let mut dep = Manifest::new(json!({"kind": "Deployment", "metadata": {"name": "d"}})).unwrap();
        assert_eq!(assign_version(&mock, &mut dep).await.unwrap(), None);
        assert_eq!(dep.name(), "d");
    }
}
