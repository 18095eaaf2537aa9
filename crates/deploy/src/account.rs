//! Accounts: one cluster connection plus the namespaces it may touch.
//!
//! Accounts file (YAML or JSON):
//!
//! ```yaml
//! accounts:
//! - name: prod
//!   host: https://10.0.0.1:6443
//!   token: ...
//!   defaultNamespace: web
//!   namespaces: [web, jobs]
//! ```

use anyhow::Context;
use serde::{Deserialize, Serialize};
use spindle_core::{kinds, Error, Manifest, Result};
use spindle_kubehub::Connection;

fn default_namespace() -> String {
    "default".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub name: String,
    #[serde(flatten)]
    pub connection: Connection,
    #[serde(default = "default_namespace")]
    pub default_namespace: String,
    /// Allowed namespaces. Empty means the account is cluster-wide.
    #[serde(default)]
    pub namespaces: Vec<String>,
}

impl Account {
    /// Cluster-wide account on the ambient kube config.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            connection: Connection::default(),
            default_namespace: default_namespace(),
            namespaces: Vec::new(),
        }
    }

    pub fn with_namespaces(mut self, namespaces: &[&str]) -> Self {
        self.namespaces = namespaces.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn is_namespace_scoped(&self) -> bool {
        !self.namespaces.is_empty()
    }

    pub fn check_namespace(&self, namespace: Option<&str>) -> Result<()> {
        if !self.is_namespace_scoped() {
            return Ok(());
        }
        match namespace {
            Some(ns) if self.namespaces.iter().any(|n| n == ns) => Ok(()),
            Some(ns) => Err(Error::Scope(format!(
                "account {} may only use namespaces {:?}, not {}",
                self.name, self.namespaces, ns
            ))),
            None => Err(Error::Scope(format!(
                "account {} is namespace-scoped and cannot touch cluster-scoped resources",
                self.name
            ))),
        }
    }

    /// Settle the namespace of `m`: `override_ns`, else the manifest's own,
    /// else the account default. Cluster-scoped kinds lose any namespace.
    pub fn resolve_namespace(&self, m: &mut Manifest, override_ns: Option<&str>) -> Result<()> {
        if kinds::is_cluster_scoped(m.kind()) {
            if self.is_namespace_scoped() {
                return Err(Error::Scope(format!(
                    "account {} is namespace-scoped and cannot deploy cluster-scoped kind {}",
                    self.name,
                    m.kind()
                )));
            }
            m.set_namespace(None);
            return Ok(());
        }
        let ns = override_ns
            .filter(|s| !s.is_empty())
            .or(m.namespace().filter(|s| !s.is_empty()))
            .unwrap_or(self.default_namespace.as_str())
            .to_string();
        self.check_namespace(Some(&ns))?;
        m.set_namespace(Some(&ns));
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Accounts {
    #[serde(default)]
    pub accounts: Vec<Account>,
}

impl Accounts {
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path).with_context(|| format!("reading accounts {}", path))?;
        Self::from_yaml_str(&raw).with_context(|| format!("parsing accounts {}", path))
    }

    pub fn from_yaml_str(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(raw)?)
    }

    pub fn get(&self, name: &str) -> Result<&Account> {
        self.accounts
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::NotFound(format!("account {} is not configured", name)))
    }
}
