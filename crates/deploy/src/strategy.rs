//! Per-manifest deploy strategy, read from the `strategy.spinnaker.io/*`
//! annotations.
//!
//! `recreate` deletes the live object and waits for it to disappear before
//! applying; `replace` swaps the whole live object for the manifest instead of
//! server-side applying it. `use-source-capacity` copies `spec.replicas` from
//! the object being taken over so a redeploy does not reset a scaled workload.

use std::time::Duration;

use serde_json::Value as Json;
use spindle_core::annotations::{
    cluster_key, MONIKER_CLUSTER, STRATEGY_RECREATE, STRATEGY_REPLACE, STRATEGY_USE_SOURCE_CAPACITY,
};
use spindle_core::{Error, Manifest, Result};
use spindle_kubehub::{list_timeout, ClusterClient, Propagation};
use tracing::{debug, info};

const SCALABLE: &[&str] = &["Deployment", "ReplicaSet", "StatefulSet"];
const DELETE_POLL: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Apply,
    Recreate,
    Replace,
}

fn flag(m: &Manifest, key: &str) -> bool {
    m.annotation(key) == Some("true")
}

impl Strategy {
    pub fn of(m: &Manifest) -> Result<Self> {
        match (flag(m, STRATEGY_RECREATE), flag(m, STRATEGY_REPLACE)) {
            (true, true) => Err(Error::Validation(format!(
                "{} sets both {} and {}",
                m.describe(),
                STRATEGY_RECREATE,
                STRATEGY_REPLACE
            ))),
            (true, false) => Ok(Strategy::Recreate),
            (false, true) => Ok(Strategy::Replace),
            (false, false) => Ok(Strategy::Apply),
        }
    }
}

async fn get_live(
    client: &dyn ClusterClient,
    kind: &str,
    name: &str,
    namespace: Option<&str>,
) -> Result<Option<Manifest>> {
    match client.get(kind, name, namespace).await {
        Ok(m) => Ok(Some(m)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// The live object `m` takes over from: the newest version of its cluster
/// when versioned, else the live object of the same name.
async fn source(client: &dyn ClusterClient, m: &Manifest) -> Result<Option<Manifest>> {
    if spindle_version::is_versioned(m) {
        let cluster = m
            .annotation(MONIKER_CLUSTER)
            .map(str::to_string)
            .unwrap_or_else(|| cluster_key(m.kind(), m.name()));
        return spindle_version::newest_version(client, m.kind(), m.namespace(), &cluster).await;
    }
    get_live(client, m.kind(), m.name(), m.namespace()).await
}

/// Copy `spec.replicas` from the source onto `m` when it asks for source
/// capacity. Call before versioning renames `m`. Returns the copied count.
pub async fn copy_source_capacity(client: &dyn ClusterClient, m: &mut Manifest) -> Result<Option<i64>> {
    if !flag(m, STRATEGY_USE_SOURCE_CAPACITY) || !SCALABLE.iter().any(|k| k.eq_ignore_ascii_case(m.kind())) {
        return Ok(None);
    }
    let Some(src) = source(client, m).await? else {
        debug!(manifest = %m.describe(), "no source to take capacity from");
        return Ok(None);
    };
    let Some(replicas) = src.pointer("/spec/replicas").and_then(Json::as_i64) else {
        return Ok(None);
    };
    m.map_at_mut(&["spec"]).insert("replicas".to_string(), Json::from(replicas));
    info!(manifest = %m.describe(), source = %src.name(), replicas, "using source capacity");
    Ok(Some(replicas))
}

async fn poll_until_gone(client: &dyn ClusterClient, m: &Manifest) -> Result<()> {
    while get_live(client, m.kind(), m.name(), m.namespace()).await?.is_some() {
        tokio::time::sleep(DELETE_POLL).await;
    }
    Ok(())
}

async fn wait_gone(client: &dyn ClusterClient, m: &Manifest) -> Result<()> {
    let timeout = list_timeout();
    match tokio::time::timeout(timeout, poll_until_gone(client, m)).await {
        Ok(res) => res,
        Err(_) => Err(Error::upstream(
            format!("waiting for {} to be deleted", m.describe()),
            anyhow::anyhow!("timed out after {}s", timeout.as_secs()),
        )),
    }
}

/// Write `m` to the cluster the way `strategy` asks. Both non-default
/// strategies fall back to apply when nothing is live under that name.
pub async fn write(client: &dyn ClusterClient, strategy: Strategy, m: &Manifest) -> Result<Manifest> {
    match strategy {
        Strategy::Apply => client.apply(m).await,
        Strategy::Replace => match get_live(client, m.kind(), m.name(), m.namespace()).await? {
            Some(_) => client.replace(m).await,
            None => client.apply(m).await,
        },
        Strategy::Recreate => {
            if get_live(client, m.kind(), m.name(), m.namespace()).await?.is_some() {
                client.delete(m.kind(), m.name(), m.namespace(), Propagation::Background).await?;
                wait_gone(client, m).await?;
                info!(manifest = %m.describe(), "deleted for recreate");
            }
            client.apply(m).await
        }
    }
}
