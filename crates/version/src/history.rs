//! Version-history pruning: keep at most `max-version-history` live versions
//! per cluster key, deleting the oldest first.

use metrics::counter;
use spindle_core::annotations::{cluster_keys_match, MANAGED_BY_SELECTOR, MONIKER_CLUSTER, STRATEGY_MAX_VERSION_HISTORY};
use spindle_core::{Error, Manifest, Result};
use spindle_kubehub::{ClusterClient, Propagation};
use spindle_persist::{AuditSink, Task, TaskType};
use tracing::{debug, info};

/// Positive `strategy.spinnaker.io/max-version-history`, if any.
pub fn max_version_history(m: &Manifest) -> Option<usize> {
    m.annotation(STRATEGY_MAX_VERSION_HISTORY)?.trim().parse::<usize>().ok().filter(|n| *n > 0)
}

/// Delete versions of `manifest`'s cluster beyond its history limit. Returns
/// the deleted names, oldest first.
pub async fn prune(
    client: &dyn ClusterClient,
    audit: &dyn AuditSink,
    task: &Task,
    manifest: &Manifest,
) -> Result<Vec<String>> {
    let Some(max) = max_version_history(manifest) else {
        return Ok(Vec::new());
    };
    let Some(cluster) = manifest.annotation(MONIKER_CLUSTER) else {
        debug!(manifest = %manifest.describe(), "no cluster annotation; skipping prune");
        return Ok(Vec::new());
    };
    let items = client
        .list(manifest.kind(), manifest.namespace(), Some(MANAGED_BY_SELECTOR))
        .await
        .map_err(|e| e.context(format!("pruning {}", cluster)))?;
    let mut versions: Vec<Manifest> = items
        .into_iter()
        .filter(|o| o.annotation(MONIKER_CLUSTER).map(|c| cluster_keys_match(c, cluster)).unwrap_or(false))
        .collect();
    if versions.len() <= max {
        debug!(cluster = %cluster, live = versions.len(), max, "within version history");
        return Ok(Vec::new());
    }
    versions.sort_by(|a, b| a.creation_timestamp().cmp(b.creation_timestamp()));
    let excess = versions.len() - max;
    let mut deleted = Vec::with_capacity(excess);
    for old in versions.iter().take(excess) {
        client
            .delete(old.kind(), old.name(), old.namespace(), Propagation::Foreground)
            .await
            .map_err(|e| e.context(old.describe()))?;
        audit
            .create(&task.record(TaskType::Cleanup, old))
            .map_err(|e| Error::Persistence(e.context(format!("auditing cleanup of {}", old.describe()))))?;
        counter!("prune_deleted_total", 1u64);
        info!(cluster = %cluster, deleted = %old.name(), "pruned old version");
        deleted.push(old.name().to_string());
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use spindle_kubehub::{MockCall, MockCluster};
    use spindle_persist::MemoryAuditSink;

    fn version(name: &str, ts: &str) -> Manifest {
        Manifest::new(json!({
            "apiVersion": "v1",
            "kind": "ConfigMap",
            "metadata": {
                "name": name,
                "namespace": "default",
                "creationTimestamp": ts,
                "labels": {"app.kubernetes.io/managed-by": "spinnaker"},
                "annotations": {"moniker.spinnaker.io/cluster": "configMap cfg"}
            }
        }))
        .unwrap()
    }

    fn current(max: &str) -> Manifest {
        let mut m = version("cfg-v003", "");
        m.set_annotation(STRATEGY_MAX_VERSION_HISTORY, max);
        m
    }

    #[tokio::test]
    async fn deletes_only_the_oldest_excess() {
        let mock = MockCluster::with_objects([
            version("cfg-v002", "2024-02-01T00:00:00Z"),
            version("cfg-v001", "2024-01-01T00:00:00Z"),
            version("cfg-v003", "2024-03-01T00:00:00Z"),
        ]);
        let audit = MemoryAuditSink::new();
        let task = Task::with_id("prod", "t1");
        let deleted = prune(&mock, &audit, &task, &current("2")).await.unwrap();
        assert_eq!(deleted, vec!["cfg-v001"]);
        assert_eq!(
            mock.calls(),
            vec![MockCall::Delete {
                kind: "ConfigMap".into(),
                name: "cfg-v001".into(),
                namespace: Some("default".into()),
                propagation: Propagation::Foreground,
            }]
        );
        let records = audit.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_type, TaskType::Cleanup);
        assert_eq!(records[0].name, "cfg-v001");
    }

    #[tokio::test]
    async fn at_limit_deletes_nothing() {
        let mock = MockCluster::with_objects([
            version("cfg-v001", "2024-01-01T00:00:00Z"),
            version("cfg-v002", "2024-02-01T00:00:00Z"),
        ]);
        let audit = MemoryAuditSink::new();
        let deleted = prune(&mock, &audit, &Task::new("prod"), &current("2")).await.unwrap();
        assert!(deleted.is_empty());
        assert!(mock.calls().is_empty());
    }

    #[tokio::test]
    async fn skips_without_cluster_or_positive_max() {
        let mock = MockCluster::with_objects([
            version("cfg-v001", "2024-01-01T00:00:00Z"),
            version("cfg-v002", "2024-02-01T00:00:00Z"),
        ]);
        mock.fail_on("list", "ConfigMap");
        let audit = MemoryAuditSink::new();
        let task = Task::new("prod");

        let mut no_cluster = current("1");
        no_cluster.map_at_mut(&["metadata", "annotations"]).remove(MONIKER_CLUSTER);
        assert!(prune(&mock, &audit, &task, &no_cluster).await.unwrap().is_empty());
        assert!(prune(&mock, &audit, &task, &current("0")).await.unwrap().is_empty());
        assert!(prune(&mock, &audit, &task, &current("many")).await.unwrap().is_empty());
        assert!(prune(&mock, &audit, &task, &current("1")).await.is_err());
    }
}
