//! Annotation and label keys written onto deployed manifests, and the moniker
//! helpers that stamp them.

use crate::kinds;
use crate::Manifest;

pub const ARTIFACT_LOCATION: &str = "artifact.spinnaker.io/location";
pub const ARTIFACT_NAME: &str = "artifact.spinnaker.io/name";
pub const ARTIFACT_TYPE: &str = "artifact.spinnaker.io/type";
pub const ARTIFACT_VERSION: &str = "artifact.spinnaker.io/version";
pub const MONIKER_APPLICATION: &str = "moniker.spinnaker.io/application";
pub const MONIKER_CLUSTER: &str = "moniker.spinnaker.io/cluster";
pub const MONIKER_SEQUENCE: &str = "moniker.spinnaker.io/sequence";
pub const TRAFFIC_LOAD_BALANCERS: &str = "traffic.spinnaker.io/load-balancers";
pub const STRATEGY_MAX_VERSION_HISTORY: &str = "strategy.spinnaker.io/max-version-history";
pub const STRATEGY_VERSIONED: &str = "strategy.spinnaker.io/versioned";
pub const STRATEGY_USE_SOURCE_CAPACITY: &str = "strategy.spinnaker.io/use-source-capacity";
pub const STRATEGY_RECREATE: &str = "strategy.spinnaker.io/recreate";
pub const STRATEGY_REPLACE: &str = "strategy.spinnaker.io/replace";

pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";
pub const LABEL_NAME: &str = "app.kubernetes.io/name";
pub const MANAGED_BY_SPINNAKER: &str = "spinnaker";

/// Read filter applied to every list the pipeline issues.
pub const MANAGED_BY_SELECTOR: &str = "app.kubernetes.io/managed-by in (spinnaker, spinnaker-operator)";

/// `replicaSet` from `ReplicaSet`.
pub fn lower_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) => c.to_lowercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Cluster key (`"<kind> <name>"`) grouping version and traffic history.
pub fn cluster_key(kind: &str, name: &str) -> String {
    format!("{} {}", lower_first(kind), name)
}

/// Compare two cluster keys, ignoring case on the kind part only.
pub fn cluster_keys_match(a: &str, b: &str) -> bool {
    match (a.split_once(' '), b.split_once(' ')) {
        (Some((ka, na)), Some((kb, nb))) => ka.eq_ignore_ascii_case(kb) && na == nb,
        _ => a == b,
    }
}

/// Artifact type recorded for a manifest of `kind` (`kubernetes/deployment`).
pub fn artifact_type_for_kind(kind: &str) -> String {
    format!("kubernetes/{}", lower_first(kind))
}

/// Stamp moniker annotations and managed-by labels, on the manifest and on its
/// pod template so the pods it creates are found by [`MANAGED_BY_SELECTOR`].
/// The cluster key is derived from the manifest's current (pre-version) name,
/// so call this before versioning.
pub fn annotate(m: &mut Manifest, application: &str) {
    let kind = m.kind().to_string();
    let name = m.name().to_string();
    let location = m.namespace().unwrap_or("").to_string();
    let pairs = [
        (ARTIFACT_LOCATION, location),
        (ARTIFACT_NAME, name.clone()),
        (ARTIFACT_TYPE, artifact_type_for_kind(&kind)),
        (MONIKER_APPLICATION, application.to_string()),
        (MONIKER_CLUSTER, cluster_key(&kind, &name)),
    ];
    let template = kinds::pod_template_path(&kind);
    for (k, v) in pairs.iter() {
        m.set_annotation(k, v);
        if let Some(path) = template {
            let mut p: Vec<&str> = path.to_vec();
            p.extend(["metadata", "annotations"]);
            m.map_at_mut(&p).insert((*k).to_string(), serde_json::Value::String(v.clone()));
        }
    }
    m.set_label(LABEL_MANAGED_BY, MANAGED_BY_SPINNAKER);
    if m.label(LABEL_NAME).is_none() && !application.is_empty() {
        m.set_label(LABEL_NAME, application);
    }
    if let Some(path) = template {
        let mut p: Vec<&str> = path.to_vec();
        p.extend(["metadata", "labels"]);
        let labels = m.map_at_mut(&p);
        labels.insert(LABEL_MANAGED_BY.to_string(), serde_json::Value::String(MANAGED_BY_SPINNAKER.to_string()));
        if !labels.contains_key(LABEL_NAME) && !application.is_empty() {
            labels.insert(LABEL_NAME.to_string(), serde_json::Value::String(application.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn cluster_key_lowers_first_letter() {
        assert_eq!(cluster_key("Deployment", "app"), "deployment app");
        assert_eq!(cluster_key("ReplicaSet", "web"), "replicaSet web");
        assert!(cluster_keys_match("ReplicaSet web", "replicaset web"));
        assert!(!cluster_keys_match("replicaSet web", "replicaSet Web"));
    }

    #[test]
    fn annotate_stamps_metadata_and_template() {
        let mut m = Manifest::new(json!({
            "kind": "Deployment",
            "metadata": {"name": "app", "namespace": "default"},
            "spec": {"template": {"metadata": {"labels": {"app": "x"}}}}
        }))
        .unwrap();
        annotate(&mut m, "shop");
        assert_eq!(m.annotation(ARTIFACT_LOCATION), Some("default"));
        assert_eq!(m.annotation(MONIKER_CLUSTER), Some("deployment app"));
        assert_eq!(m.annotation(ARTIFACT_TYPE), Some("kubernetes/deployment"));
        assert_eq!(m.label(LABEL_MANAGED_BY), Some("spinnaker"));
        assert_eq!(m.label(LABEL_NAME), Some("shop"));
        assert_eq!(
            m.pointer("/spec/template/metadata/annotations/moniker.spinnaker.io~1application"),
            Some(&json!("shop"))
        );
        assert_eq!(
            m.pointer("/spec/template/metadata/labels"),
            Some(&json!({"app": "x", "app.kubernetes.io/managed-by": "spinnaker", "app.kubernetes.io/name": "shop"}))
        );
    }

    #[test]
    fn annotate_keeps_existing_template_name_label() {
        let mut m = Manifest::new(json!({
            "kind": "ReplicaSet",
            "metadata": {"name": "web"},
            "spec": {"template": {"metadata": {"labels": {"app.kubernetes.io/name": "web"}}}}
        }))
        .unwrap();
        annotate(&mut m, "shop");
        assert_eq!(m.pointer("/spec/template/metadata/labels/app.kubernetes.io~1name"), Some(&json!("web")));
        assert_eq!(m.label(LABEL_NAME), Some("shop"));

        let mut cm = Manifest::new(json!({"kind": "ConfigMap", "metadata": {"name": "c"}})).unwrap();
        annotate(&mut cm, "");
        assert_eq!(cm.label(LABEL_MANAGED_BY), Some("spinnaker"));
        assert_eq!(cm.pointer("/spec"), None);
    }
}
