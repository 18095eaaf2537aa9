//! Spindle traffic engine.
//!
//! A load balancer is a Service whose selector is mirrored onto the labels of
//! a workload's pods. Attaching adds the selector labels, detaching removes
//! them; live workloads also have their running pods patched.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use spindle_core::annotations::TRAFFIC_LOAD_BALANCERS;
use spindle_core::manifest::string_map;
use spindle_core::{Error, Manifest, Result};
use spindle_kubehub::ClusterClient;
use tracing::{debug, info};

mod cascade;
mod labels;

pub use cascade::{cascade, set_traffic};
pub use labels::{attach, detach, labels_path, patch_ops, Mode};

/// Label selector of a load balancer.
pub type Selector = BTreeMap<String, String>;

/// Parsed `"<kind> <name>"` token from the load-balancers annotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadBalancerRef {
    pub kind: String,
    pub name: String,
}

impl LoadBalancerRef {
    pub fn parse(token: &str) -> Result<Self> {
        let (kind, name) = token
            .trim()
            .split_once(' ')
            .map(|(k, n)| (k.trim(), n.trim()))
            .filter(|(k, n)| !k.is_empty() && !n.is_empty() && !n.contains(' '))
            .ok_or_else(|| {
                Error::Validation(format!("load balancer {:?} is not of the form \"<kind> <name>\"", token))
            })?;
        if !kind.eq_ignore_ascii_case("service") {
            return Err(Error::Validation(format!(
                "load balancer kind {:?} is not supported; only service load balancers are",
                kind
            )));
        }
        Ok(Self { kind: kind.to_string(), name: name.to_string() })
    }
}

impl fmt::Display for LoadBalancerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.name)
    }
}

/// Load balancers named by the `traffic.spinnaker.io/load-balancers` annotation.
pub fn load_balancers(m: &Manifest) -> Result<Vec<LoadBalancerRef>> {
    let Some(raw) = m.annotation(TRAFFIC_LOAD_BALANCERS) else {
        return Ok(Vec::new());
    };
    let tokens: Vec<String> = serde_json::from_str(raw).map_err(|e| {
        Error::Validation(format!("{} must be a JSON array of strings: {}", TRAFFIC_LOAD_BALANCERS, e))
    })?;
    tokens.iter().map(|t| LoadBalancerRef::parse(t)).collect()
}

pub fn service_selector(service: &Manifest) -> Selector {
    string_map(service.pointer("/spec/selector"))
}

/// Find the Service behind `lb`: first in the in-flight batch, then live.
pub async fn resolve(
    client: &dyn ClusterClient,
    batch: &[Manifest],
    lb: &LoadBalancerRef,
    namespace: Option<&str>,
) -> Result<Manifest> {
    if let Some(m) = batch
        .iter()
        .find(|m| m.kind().eq_ignore_ascii_case(&lb.kind) && m.name() == lb.name && m.namespace() == namespace)
    {
        debug!(lb = %lb, "load balancer found in request");
        return Ok(m.clone());
    }
    client.get("Service", &lb.name, namespace).await.map_err(|e| {
        if e.is_not_found() {
            Error::NotFound(format!("load balancer {} does not exist", lb))
        } else {
            e.context(format!("resolving load balancer {}", lb))
        }
    })
}

/// Attach every annotated load balancer to `m` in place. Returns the number
/// of load balancers attached.
pub async fn attach_load_balancers(client: &dyn ClusterClient, batch: &[Manifest], m: &mut Manifest) -> Result<usize> {
    let lbs = load_balancers(m)?;
    for lb in &lbs {
        let service = resolve(client, batch, lb, m.namespace()).await?;
        let selector = service_selector(&service);
        attach(m, &selector).map_err(|e| e.context(format!("attaching {}", lb)))?;
        info!(manifest = %m.describe(), lb = %lb, keys = selector.len(), "attached load balancer");
    }
    Ok(lbs.len())
}

/// Traffic management block of a deploy request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficManagement {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub options: TrafficOptions,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrafficOptions {
    #[serde(default = "default_enable_traffic")]
    pub enable_traffic: bool,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub services: Vec<String>,
}

fn default_enable_traffic() -> bool {
    true
}

impl Default for TrafficOptions {
    fn default() -> Self {
        Self { enable_traffic: true, namespace: None, services: Vec::new() }
    }
}

impl TrafficManagement {
    /// Stamp the requested services onto ReplicaSets. Returns whether the
    /// pipeline should attach load balancers to `m`.
    pub fn apply_to(&self, m: &mut Manifest) -> Result<bool> {
        if !self.enabled {
            return Ok(true);
        }
        if !self.options.services.is_empty() && m.kind().eq_ignore_ascii_case("ReplicaSet") {
            for s in &self.options.services {
                LoadBalancerRef::parse(s)?;
            }
            let raw = serde_json::to_string(&self.options.services)
                .map_err(|e| Error::Validation(format!("encoding services: {}", e)))?;
            m.set_annotation(TRAFFIC_LOAD_BALANCERS, &raw);
        }
        Ok(self.options.enable_traffic)
    }
}
