//! Operations on live resources. Every mutation is recorded in the audit
//! sink under a fresh task id.

use metrics::counter;
use serde_json::{json, Value as Json};
use spindle_core::{kinds, Error, Manifest, Result};
use spindle_kubehub::{pointer, PatchBody, PatchOp, Propagation};
use spindle_persist::TaskType;
use spindle_status::StatusResult;
use spindle_traffic::{set_traffic, Mode};
use tracing::info;

use crate::Deployer;

pub const RESTARTED_AT: &str = "kubectl.kubernetes.io/restartedAt";

const RESTARTABLE: &[&str] = &["Deployment", "StatefulSet", "DaemonSet"];

impl Deployer {
    fn check_scope(&self, kind: &str, namespace: Option<&str>) -> Result<()> {
        if kinds::is_cluster_scoped(kind) {
            return self.account.check_namespace(None);
        }
        if namespace.is_none() {
            return Err(Error::Validation(format!("namespace required for namespaced kind {}", kind)));
        }
        self.account.check_namespace(namespace)
    }

    async fn live(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<Manifest> {
        self.check_scope(kind, namespace)?;
        self.client.get(kind, name, namespace).await
    }

    pub async fn status(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<StatusResult> {
        let live = self.live(kind, name, namespace).await?;
        Ok(self.status.evaluate_manifest(&live))
    }

    pub async fn delete(&self, kind: &str, name: &str, namespace: Option<&str>, propagation: Propagation) -> Result<()> {
        let live = self.live(kind, name, namespace).await?;
        self.client.delete(kind, name, namespace, propagation).await?;
        let task = self.task();
        self.audit(&task, TaskType::Delete, &live).await?;
        counter!("ops_total", 1u64, "op" => "delete");
        info!(task = %task.id, workload = %live.describe(), ?propagation, "deleted");
        Ok(())
    }

    pub async fn scale(&self, kind: &str, name: &str, namespace: Option<&str>, replicas: i64) -> Result<Manifest> {
        if replicas < 0 {
            return Err(Error::Validation(format!("replicas must be non-negative, got {}", replicas)));
        }
        self.check_scope(kind, namespace)?;
        let body = PatchBody::Merge(json!({"spec": {"replicas": replicas}}));
        let live = self.client.patch(kind, name, namespace, &body).await?;
        let task = self.task();
        self.audit(&task, TaskType::Scale, &live).await?;
        counter!("ops_total", 1u64, "op" => "scale");
        info!(task = %task.id, workload = %live.describe(), replicas, "scaled");
        Ok(live)
    }

    /// Stamp the pod template with a restart time so the controller rolls
    /// every pod.
    pub async fn rolling_restart(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<Manifest> {
        let template = match kinds::pod_template_path(kind) {
            Some(path) if RESTARTABLE.iter().any(|k| k.eq_ignore_ascii_case(kind)) => path,
            _ => return Err(Error::Validation(format!("kind {} does not support rolling restart", kind))),
        };
        self.check_scope(kind, namespace)?;
        let mut path = template.to_vec();
        path.extend(["metadata", "annotations", RESTARTED_AT]);
        let now = chrono::Utc::now().to_rfc3339();
        let body = PatchBody::Fields(vec![PatchOp::Add { path: pointer(&path), value: Json::String(now) }]);
        let live = self.client.patch(kind, name, namespace, &body).await?;
        let task = self.task();
        self.audit(&task, TaskType::RollingRestart, &live).await?;
        counter!("ops_total", 1u64, "op" => "rolling_restart");
        info!(task = %task.id, workload = %live.describe(), "restarted");
        Ok(live)
    }

    pub async fn enable(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<usize> {
        self.set_traffic(kind, name, namespace, Mode::Attach).await
    }

    pub async fn disable(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<usize> {
        self.set_traffic(kind, name, namespace, Mode::Detach).await
    }

    async fn set_traffic(&self, kind: &str, name: &str, namespace: Option<&str>, mode: Mode) -> Result<usize> {
        let live = self.live(kind, name, namespace).await?;
        let lbs = set_traffic(self.client.as_ref(), &live, mode).await?;
        let task_type = match mode {
            Mode::Attach => TaskType::Enable,
            Mode::Detach => TaskType::Disable,
        };
        let task = self.task();
        self.audit(&task, task_type, &live).await?;
        counter!("ops_total", 1u64, "op" => task_type.as_str());
        info!(task = %task.id, workload = %live.describe(), lbs, op = %task_type, "traffic changed");
        Ok(lbs)
    }

    /// Trim the version history of the cluster `name` belongs to.
    pub async fn prune(&self, kind: &str, name: &str, namespace: Option<&str>) -> Result<Vec<String>> {
        let live = self.live(kind, name, namespace).await?;
        let task = self.task();
        let deleted = spindle_version::history::prune(self.client.as_ref(), self.audit.as_ref(), &task, &live).await?;
        info!(task = %task.id, workload = %live.describe(), deleted = deleted.len(), "prune finished");
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::Account;
    use spindle_kubehub::{MockCall, MockCluster};
    use spindle_persist::MemoryAuditSink;

    fn deployment() -> Manifest {
        Manifest::new(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {"name": "web", "namespace": "shop"},
            "spec": {"replicas": 2, "template": {"metadata": {"labels": {"app": "web"}}}}
        }))
        .unwrap()
    }

    fn setup(account: Account) -> (Arc<MockCluster>, Arc<MemoryAuditSink>, Deployer) {
        let mock = Arc::new(MockCluster::with_objects([deployment()]));
        let audit = Arc::new(MemoryAuditSink::new());
        let d = Deployer::new(account, mock.clone(), audit.clone());
        (mock, audit, d)
    }

    #[tokio::test]
    async fn scale_patches_replicas_and_audits() {
        let (mock, audit, d) = setup(Account::new("a"));
        let live = d.scale("Deployment", "web", Some("shop"), 5).await.unwrap();
        assert_eq!(live.pointer("/spec/replicas"), Some(&json!(5)));
        let recs = audit.records();
        assert_eq!(recs.len(), 1);
        assert_eq!(recs[0].task_type, TaskType::Scale);
        assert_eq!(recs[0].resource, "deployments");
        assert!(d.scale("Deployment", "web", Some("shop"), -1).await.is_err());
        assert_eq!(mock.calls().len(), 1);
    }

    #[tokio::test]
    async fn restart_stamps_template_annotation() {
        let (_mock, audit, d) = setup(Account::new("a"));
        let live = d.rolling_restart("Deployment", "web", Some("shop")).await.unwrap();
        let stamped = live.pointer(&pointer(&["spec", "template", "metadata", "annotations", RESTARTED_AT]));
        assert!(stamped.and_then(|v| v.as_str()).is_some());
        assert_eq!(live.pointer("/spec/template/metadata/labels/app"), Some(&json!("web")));
        assert_eq!(audit.records()[0].task_type, TaskType::RollingRestart);

        let e = d.rolling_restart("ConfigMap", "web", Some("shop")).await.unwrap_err();
        assert!(matches!(e, Error::Validation(_)));
    }

    #[tokio::test]
    async fn delete_uses_propagation() {
        let (mock, audit, d) = setup(Account::new("a"));
        d.delete("Deployment", "web", Some("shop"), Propagation::Orphan).await.unwrap();
        assert!(matches!(mock.calls()[0], MockCall::Delete { propagation: Propagation::Orphan, .. }));
        assert!(mock.find("Deployment", "web", Some("shop")).is_none());
        assert_eq!(audit.records()[0].task_type, TaskType::Delete);

        let e = d.delete("Deployment", "web", Some("shop"), Propagation::Foreground).await.unwrap_err();
        assert!(e.is_not_found());
        assert_eq!(audit.records().len(), 1);
    }

    #[tokio::test]
    async fn scope_is_checked_before_cluster_calls() {
        let (mock, audit, d) = setup(Account::new("a").with_namespaces(&["other"]));
        assert!(matches!(d.scale("Deployment", "web", Some("shop"), 1).await, Err(Error::Scope(_))));
        assert!(matches!(d.status("Deployment", "web", None).await, Err(Error::Validation(_))));
        assert!(matches!(d.delete("Namespace", "shop", None, Propagation::Background).await, Err(Error::Scope(_))));
        assert!(mock.calls().is_empty());
        assert!(audit.records().is_empty());
    }

    #[tokio::test]
    async fn status_reads_live_object() {
        let (mock, _audit, d) = setup(Account::new("a"));
        let r = d.status("Deployment", "web", Some("shop")).await.unwrap();
        assert!(!r.stable.state);
        mock.insert(
            Manifest::new(json!({
                "apiVersion": "apps/v1",
                "kind": "Deployment",
                "metadata": {"name": "web", "namespace": "shop", "generation": 1},
                "spec": {"replicas": 1},
                "status": {"observedGeneration": 1, "replicas": 1, "updatedReplicas": 1, "availableReplicas": 1, "readyReplicas": 1}
            }))
            .unwrap(),
        );
        assert!(d.status("Deployment", "web", Some("shop")).await.unwrap().is_stable());
    }
}
