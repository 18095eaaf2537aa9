//! Spindle deploy pipeline.
//!
//! A [`DeployRequest`] is normalized, namespaced and scope-checked as a whole
//! before the first cluster call. Each manifest then goes through annotation,
//! source capacity, versioning, artifact binding and load-balancer
//! attachment, is written with its [`Strategy`], and leaves an audit record
//! plus an artifact later manifests can bind to.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use spindle_artifact::{bind_artifacts, Artifact};
use spindle_core::annotations::{annotate, lower_first};
use spindle_core::order::{flatten_lists, sort_by_priority};
use spindle_core::{Error, Manifest, Result};
use spindle_kubehub::ClusterClient;
use spindle_persist::{AuditSink, Task, TaskType};
use spindle_status::StatusRegistry;
use spindle_traffic::{attach_load_balancers, TrafficManagement};
use tracing::{debug, info, warn};

pub mod account;
pub mod ops;
pub mod strategy;

pub use account::{Account, Accounts};
pub use strategy::Strategy;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Moniker {
    #[serde(default)]
    pub app: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployRequest {
    pub manifests: Vec<Json>,
    #[serde(default)]
    pub namespace_override: Option<String>,
    #[serde(default)]
    pub moniker: Moniker,
    #[serde(default)]
    pub traffic_management: TrafficManagement,
    #[serde(default)]
    pub required_artifacts: Vec<Artifact>,
    #[serde(default)]
    pub optional_artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeployResult {
    pub task_id: String,
    pub manifests: Vec<Manifest>,
    pub created_artifacts: Vec<Artifact>,
    /// Namespace (empty for cluster-scoped) to `"<kind> <name>"` entries.
    pub manifest_names_by_namespace: BTreeMap<String, Vec<String>>,
}

/// Parse raw documents, expand `List`s one level and order by kind priority.
pub fn normalize(docs: Vec<Json>) -> Result<Vec<Manifest>> {
    let manifests = docs.into_iter().map(Manifest::new).collect::<Result<Vec<_>>>()?;
    Ok(sort_by_priority(flatten_lists(manifests)?))
}

/// Everything one account needs to deploy and operate on live resources.
pub struct Deployer {
    account: Account,
    client: Arc<dyn ClusterClient>,
    audit: Arc<dyn AuditSink>,
    status: StatusRegistry,
}

impl Deployer {
    pub fn new(account: Account, client: Arc<dyn ClusterClient>, audit: Arc<dyn AuditSink>) -> Self {
        Self { account, client, audit, status: StatusRegistry::with_builtins() }
    }

    pub fn with_status_registry(mut self, status: StatusRegistry) -> Self {
        self.status = status;
        self
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    fn task(&self) -> Task {
        Task::new(&self.account.name)
    }

    /// Resolve the served resource for the audit record; falls back to the
    /// static plural table when discovery has nothing.
    async fn audit(&self, task: &Task, task_type: TaskType, m: &Manifest) -> Result<()> {
        let mut rec = task.record(task_type, m);
        match self.client.resource_for(Some(m.api_version()).filter(|v| !v.is_empty()), m.kind()).await {
            Ok(r) => rec = rec.with_resource(&r.resource),
            Err(e) => debug!(manifest = %m.describe(), error = %e, "resource lookup failed; using default plural"),
        }
        self.audit
            .create(&rec)
            .map_err(|e| Error::Persistence(e.context(format!("auditing {} of {}", task_type, m.describe()))))
    }

    pub async fn deploy(&self, req: &DeployRequest) -> Result<DeployResult> {
        let started = Instant::now();
        let task = self.task();
        let mut manifests = normalize(req.manifests.clone())?;
        for m in manifests.iter_mut() {
            self.account
                .resolve_namespace(m, req.namespace_override.as_deref())
                .map_err(|e| e.context(m.describe()))?;
            Strategy::of(m)?;
        }
        info!(task = %task.id, account = %self.account.name, manifests = manifests.len(), "deploy started");

        // services in the batch take precedence over live ones when attaching
        let batch = manifests.clone();
        let mut artifacts: Vec<Artifact> =
            req.required_artifacts.iter().chain(req.optional_artifacts.iter()).cloned().collect();
        let mut result = DeployResult { task_id: task.id.clone(), ..Default::default() };

        for mut m in manifests {
            let identity = m.describe();
            let produced = self
                .deploy_one(&task, req, &batch, &artifacts, &mut m)
                .await
                .map_err(|e| e.context(&identity))?;
            result
                .manifest_names_by_namespace
                .entry(m.namespace().unwrap_or_default().to_string())
                .or_default()
                .push(format!("{} {}", lower_first(m.kind()), m.name()));
            artifacts.push(produced.clone());
            result.created_artifacts.push(produced);
            result.manifests.push(m);
        }
        histogram!("deploy_latency_ms", started.elapsed().as_secs_f64() * 1000.0);
        info!(task = %task.id, deployed = result.manifests.len(), "deploy finished");
        Ok(result)
    }

    async fn deploy_one(
        &self,
        task: &Task,
        req: &DeployRequest,
        batch: &[Manifest],
        artifacts: &[Artifact],
        m: &mut Manifest,
    ) -> Result<Artifact> {
        annotate(m, &req.moniker.app);
        let attach = req.traffic_management.apply_to(m)?;
        let strategy = Strategy::of(m)?;
        strategy::copy_source_capacity(self.client.as_ref(), m).await?;
        let pre_version_name = m.name().to_string();
        if let Some(v) = spindle_version::assign_version(self.client.as_ref(), m).await? {
            debug!(manifest = %m.describe(), version = %v.long, "versioned");
        }
        let bound = bind_artifacts(m, artifacts, &self.account.name);
        if attach {
            attach_load_balancers(self.client.as_ref(), batch, m).await?;
        } else if !spindle_traffic::load_balancers(m)?.is_empty() {
            warn!(manifest = %m.describe(), "traffic disabled by request; load balancers not attached");
        }
        let applied = strategy::write(self.client.as_ref(), strategy, m).await?;
        self.audit(task, TaskType::Deploy, &applied).await?;
        counter!("deploy_manifests_total", 1u64, "kind" => m.kind().to_string());
        info!(manifest = %applied.describe(), bound, ?strategy, "applied");
        let produced = Artifact::produced(&applied, &pre_version_name, &self.account.name);
        *m = applied;
        Ok(produced)
    }
}
