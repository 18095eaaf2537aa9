//! Spindle rollout status.
//!
//! Status is a pure function of the live document. Known kinds dispatch to a
//! built-in rule through [`StatusRegistry`]; anything else falls back to the
//! rules loaded from the custom-kind configuration file.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::counter;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use spindle_core::Manifest;
use tracing::{debug, info};

pub mod builtin;
pub mod custom;

pub use custom::{CustomKindRules, StatusCheck};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Facet {
    pub state: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl Facet {
    fn ok() -> Self {
        Self { state: true, message: String::new() }
    }

    fn set(state: bool, message: impl Into<String>) -> Self {
        Self { state, message: message.into() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResult {
    pub stable: Facet,
    pub available: Facet,
    pub paused: Facet,
    pub failed: Facet,
}

impl Default for StatusResult {
    fn default() -> Self {
        Self { stable: Facet::ok(), available: Facet::ok(), paused: Facet::default(), failed: Facet::default() }
    }
}

impl StatusResult {
    pub fn stable() -> Self {
        Self::default()
    }

    pub fn unstable(mut self, message: impl Into<String>) -> Self {
        self.stable = Facet::set(false, message);
        self
    }

    pub fn unavailable(mut self, message: impl Into<String>) -> Self {
        self.available = Facet::set(false, message);
        self
    }

    pub fn paused(mut self, message: impl Into<String>) -> Self {
        self.paused = Facet::set(true, message);
        self
    }

    pub fn failed(mut self, message: impl Into<String>) -> Self {
        self.failed = Facet::set(true, message);
        self
    }

    /// No status block at all yet.
    pub fn none_reported() -> Self {
        Self::default().unstable("No status reported yet").unavailable("No availability reported")
    }

    pub fn is_stable(&self) -> bool {
        self.stable.state && !self.failed.state
    }
}

pub trait StatusRule: Send + Sync {
    fn status(&self, doc: &Json) -> StatusResult;
}

impl<F> StatusRule for F
where
    F: Fn(&Json) -> StatusResult + Send + Sync,
{
    fn status(&self, doc: &Json) -> StatusResult {
        self(doc)
    }
}

/// Kind → rule, with an optional fallback for unregistered kinds.
#[derive(Default, Clone)]
pub struct StatusRegistry {
    rules: FxHashMap<String, Arc<dyn StatusRule>>,
    fallback: Option<Arc<dyn StatusRule>>,
}

impl StatusRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtins() -> Self {
        let mut r = Self::new();
        r.register("Deployment", builtin::deployment);
        r.register("ReplicaSet", builtin::replica_set);
        r.register("StatefulSet", builtin::stateful_set);
        r.register("DaemonSet", builtin::daemon_set);
        r.register("Job", builtin::job);
        r.register("Pod", builtin::pod);
        r.register("HorizontalPodAutoscaler", builtin::horizontal_pod_autoscaler);
        r
    }

    /// Built-ins plus custom rules from `SPINDLE_STATUS_RULES_PATH`, when set.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut r = Self::with_builtins();
        if let Ok(path) = std::env::var("SPINDLE_STATUS_RULES_PATH") {
            let rules = CustomKindRules::load(&path)?;
            info!(path = %path, kinds = rules.len(), "custom status rules loaded");
            r = r.with_custom_rules(rules);
        }
        Ok(r)
    }

    pub fn register(&mut self, kind: &str, rule: impl StatusRule + 'static) {
        self.rules.insert(kind.to_ascii_lowercase(), Arc::new(rule));
    }

    pub fn with_custom_rules(mut self, rules: CustomKindRules) -> Self {
        self.fallback = Some(Arc::new(rules));
        self
    }

    pub fn evaluate(&self, doc: &Json) -> StatusResult {
        let kind = doc.get("kind").and_then(|k| k.as_str()).unwrap_or("");
        let rule = self.rules.get(&kind.to_ascii_lowercase()).or(self.fallback.as_ref());
        let result = match rule {
            Some(rule) => rule.status(doc),
            None => StatusResult::default(),
        };
        counter!("status_eval_total", 1u64, "kind" => kind.to_string());
        debug!(kind = %kind, stable = result.stable.state, failed = result.failed.state, "status evaluated");
        result
    }

    pub fn evaluate_manifest(&self, m: &Manifest) -> StatusResult {
        self.evaluate(m.as_value())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_are_ok_and_not_failed() {
        let r = StatusResult::default();
        assert!(r.stable.state && r.available.state);
        assert!(!r.paused.state && !r.failed.state);
        assert!(r.is_stable());
    }

    #[test]
    fn dispatch_is_case_insensitive_with_fallback() {
        let mut reg = StatusRegistry::new();
        reg.register("Widget", |_: &Json| StatusResult::default().unstable("spinning"));
        let r = reg.evaluate(&json!({"kind": "widget"}));
        assert_eq!(r.stable.message, "spinning");
        assert_eq!(reg.evaluate(&json!({"kind": "Gadget"})), StatusResult::default());

        let reg = reg.with_custom_rules(
            CustomKindRules::from_yaml_str("Gadget:\n  statusChecks:\n  - {fieldPath: phase, comparedValue: Ready, operator: EQ}\n")
                .unwrap(),
        );
        let r = reg.evaluate(&json!({"kind": "Gadget", "status": {"phase": "Broken"}}));
        assert!(r.failed.state);
    }

    #[test]
    fn builtins_registered() {
        let reg = StatusRegistry::with_builtins();
        let r = reg.evaluate(&json!({
            "kind": "Deployment",
            "metadata": {"generation": 5},
            "spec": {"replicas": 3},
            "status": {"observedGeneration": 4, "replicas": 3, "updatedReplicas": 3, "availableReplicas": 3, "readyReplicas": 3}
        }));
        assert!(!r.stable.state);
        assert_eq!(r.stable.message, "Waiting for status generation to match updated object generation");
    }
}
