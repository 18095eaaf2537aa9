use metrics::counter;
use spindle_core::annotations::MANAGED_BY_SELECTOR;
use spindle_core::{kinds, Manifest, Result};
use spindle_kubehub::{list_bounded, ClusterClient, PatchBody};
use tracing::{debug, info, warn};

use crate::labels::{attach, patch_ops, Mode};
use crate::{load_balancers, resolve, service_selector, Selector};

/// Patch the selector onto (or off) the running pods owned by `target`.
/// Returns the number of pods patched.
pub async fn cascade(client: &dyn ClusterClient, target: &Manifest, selector: &Selector, mode: Mode) -> Result<usize> {
    if !kinds::owns_pods(target.kind()) || selector.is_empty() {
        return Ok(0);
    }
    let Some(uid) = target.uid() else {
        warn!(workload = %target.describe(), "no uid; cannot match owned pods");
        return Ok(0);
    };
    let pods = list_bounded(client, "Pod", target.namespace(), Some(MANAGED_BY_SELECTOR))
        .await
        .map_err(|e| e.context(format!("listing pods of {}", target.describe())))?;
    let body = PatchBody::Fields(patch_ops("Pod", selector, mode)?);
    let mut patched = 0;
    for pod in pods.iter().filter(|p| p.owner_uids().contains(&uid)) {
        client
            .patch("Pod", pod.name(), pod.namespace(), &body)
            .await
            .map_err(|e| e.context(pod.describe()))?;
        patched += 1;
    }
    counter!("traffic_pods_patched_total", patched as u64);
    debug!(workload = %target.describe(), pods = patched, ?mode, "cascaded to pods");
    Ok(patched)
}

/// Enable or disable traffic on a live workload: patch its labels for every
/// annotated load balancer, then cascade to its pods. Returns the number of
/// load balancers processed.
pub async fn set_traffic(client: &dyn ClusterClient, target: &Manifest, mode: Mode) -> Result<usize> {
    let lbs = load_balancers(target).map_err(|e| e.context(target.describe()))?;
    if lbs.is_empty() {
        info!(workload = %target.describe(), "no load balancers annotated");
        return Ok(0);
    }
    for lb in &lbs {
        let service = resolve(client, &[], lb, target.namespace()).await.map_err(|e| e.context(target.describe()))?;
        let selector = service_selector(&service);
        match mode {
            // validate disjointness against the live labels before patching
            Mode::Attach => attach(&mut target.clone(), &selector).map_err(|e| e.context(format!("enabling {}", lb)))?,
            Mode::Detach if selector.is_empty() => continue,
            Mode::Detach => {}
        }
        let body = PatchBody::Fields(patch_ops(target.kind(), &selector, mode)?);
        client
            .patch(target.kind(), target.name(), target.namespace(), &body)
            .await
            .map_err(|e| e.context(target.describe()))?;
        let pods = cascade(client, target, &selector, mode).await?;
        info!(workload = %target.describe(), lb = %lb, pods, ?mode, "traffic updated");
    }
    Ok(lbs.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spindle_core::annotations::TRAFFIC_LOAD_BALANCERS;
    use spindle_kubehub::{MockCall, MockCluster};

    fn pod(name: &str, owner: &str, extra: &[(&str, &str)]) -> Manifest {
        let mut m = Manifest::new(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": name,
                "namespace": "default",
                "labels": {"app.kubernetes.io/managed-by": "spinnaker"},
                "ownerReferences": [{"uid": owner}]
            }
        }))
        .unwrap();
        for (k, v) in extra {
            m.set_label(k, v);
        }
        m
    }

    fn setup(rs_labels: serde_json::Value) -> (MockCluster, Manifest) {
        let mock = MockCluster::new();
        mock.insert(
            Manifest::new(json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": {"name": "lb", "namespace": "default"},
                "spec": {"selector": {"lb": "web"}}
            }))
            .unwrap(),
        );
        let rs = mock.insert(
            Manifest::new(json!({
                "apiVersion": "apps/v1",
                "kind": "ReplicaSet",
                "metadata": {
                    "name": "web-v001",
                    "namespace": "default",
                    "uid": "rs-uid",
                    "annotations": {TRAFFIC_LOAD_BALANCERS: "[\"service lb\"]"}
                },
                "spec": {"template": {"metadata": {"labels": rs_labels}}}
            }))
            .unwrap(),
        );
        mock.insert(pod("web-v001-a", "rs-uid", &[]));
        mock.insert(pod("web-v001-b", "rs-uid", &[]));
        mock.insert(pod("other", "other-uid", &[]));
        (mock, rs)
    }

    fn patched(mock: &MockCluster) -> Vec<String> {
        mock.calls()
            .iter()
            .filter(|c| matches!(c, MockCall::Patch { .. }))
            .map(|c| c.name().to_string())
            .collect()
    }

    #[tokio::test]
    async fn enable_patches_target_and_owned_pods_only() {
        let (mock, rs) = setup(json!({"app": "web"}));
        assert_eq!(set_traffic(&mock, &rs, Mode::Attach).await.unwrap(), 1);
        assert_eq!(patched(&mock), vec!["web-v001", "web-v001-a", "web-v001-b"]);
        let live = mock.find("Pod", "web-v001-a", Some("default")).unwrap();
        assert_eq!(live.label("lb"), Some("web"));
        assert_eq!(live.label("app.kubernetes.io/managed-by"), Some("spinnaker"));
        let untouched = mock.find("Pod", "other", Some("default")).unwrap();
        assert_eq!(untouched.label("lb"), None);
    }

    #[tokio::test]
    async fn disable_removes_selector_from_pods() {
        let (mock, rs) = setup(json!({"app": "web", "lb": "web"}));
        mock.insert(pod("web-v001-a", "rs-uid", &[("lb", "web")]));
        set_traffic(&mock, &rs, Mode::Detach).await.unwrap();
        let live = mock.find("Pod", "web-v001-a", Some("default")).unwrap();
        assert_eq!(live.label("lb"), None);
        let rs_live = mock.find("ReplicaSet", "web-v001", Some("default")).unwrap();
        assert_eq!(rs_live.pointer("/spec/template/metadata/labels"), Some(&json!({"app": "web"})));
    }

    #[tokio::test]
    async fn enable_rejects_overlap_before_patching() {
        let (mock, rs) = setup(json!({"lb": "canary"}));
        assert!(set_traffic(&mock, &rs, Mode::Attach).await.is_err());
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn deployments_do_not_cascade() {
        let mock = MockCluster::new();
        let dep = Manifest::new(json!({"kind": "Deployment", "metadata": {"name": "d", "uid": "rs-uid"}})).unwrap();
        let sel: Selector = [("lb".to_string(), "web".to_string())].into_iter().collect();
        mock.fail_on("list", "Pod");
        assert_eq!(cascade(&mock, &dep, &sel, Mode::Attach).await.unwrap(), 0);
    }
}
