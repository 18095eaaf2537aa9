//! Spindle artifact binder.
//!
//! Artifacts name things a manifest refers to (images, config maps, secrets,
//! other deployed workloads). Binding rewrites those references in place;
//! discovery walks the same templates to list what a manifest refers to.

#![forbid(unsafe_code)]

use std::fmt;

use serde::{Deserialize, Serialize};
use spindle_core::{annotations, Manifest};

mod binder;
mod template;

pub use binder::{bind_artifacts, find_artifacts};
pub use template::{compile, Step};

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ArtifactType {
    DockerImage,
    ConfigMap,
    Secret,
    Deployment,
    ReplicaSet,
    /// Any other type string, kept verbatim (`kubernetes/service`).
    Other(String),
}

impl ArtifactType {
    pub fn as_str(&self) -> &str {
        match self {
            ArtifactType::DockerImage => "docker/image",
            ArtifactType::ConfigMap => "kubernetes/configMap",
            ArtifactType::Secret => "kubernetes/secret",
            ArtifactType::Deployment => "kubernetes/deployment",
            ArtifactType::ReplicaSet => "kubernetes/replicaSet",
            ArtifactType::Other(s) => s,
        }
    }

    /// `kubernetes/<lowerFirst kind>` for a deployed manifest kind.
    pub fn for_kind(kind: &str) -> Self {
        Self::from(annotations::artifact_type_for_kind(kind))
    }
}

impl From<String> for ArtifactType {
    fn from(s: String) -> Self {
        match s.as_str() {
            "docker/image" => ArtifactType::DockerImage,
            "kubernetes/configMap" => ArtifactType::ConfigMap,
            "kubernetes/secret" => ArtifactType::Secret,
            "kubernetes/deployment" => ArtifactType::Deployment,
            "kubernetes/replicaSet" => ArtifactType::ReplicaSet,
            _ => ArtifactType::Other(s),
        }
    }
}

impl From<ArtifactType> for String {
    fn from(t: ArtifactType) -> Self {
        t.as_str().to_string()
    }
}

impl fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
    #[serde(default)]
    pub account: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    pub reference: String,
    #[serde(rename = "type")]
    pub kind: ArtifactType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default)]
    pub metadata: ArtifactMetadata,
}

impl Artifact {
    pub fn new(kind: ArtifactType, name: &str, reference: &str, account: &str) -> Self {
        Self {
            name: name.to_string(),
            reference: reference.to_string(),
            kind,
            location: None,
            metadata: ArtifactMetadata { account: account.to_string() },
        }
    }

    /// Artifact recorded for a manifest the pipeline applied: later manifests
    /// referring to `pre_version_name` bind to the name actually deployed.
    pub fn produced(manifest: &Manifest, pre_version_name: &str, account: &str) -> Self {
        let mut a = Self::new(ArtifactType::for_kind(manifest.kind()), pre_version_name, manifest.name(), account);
        a.location = manifest.namespace().map(str::to_string);
        a
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_strings() {
        assert_eq!(ArtifactType::from("docker/image".to_string()), ArtifactType::DockerImage);
        assert_eq!(ArtifactType::for_kind("ReplicaSet"), ArtifactType::ReplicaSet);
        assert_eq!(ArtifactType::for_kind("Service").as_str(), "kubernetes/service");
    }

    #[test]
    fn deserializes_request_shape() {
        let a: Artifact = serde_json::from_value(json!({
            "name": "gcr.io/app",
            "reference": "gcr.io/app:1.2",
            "type": "docker/image",
            "metadata": {"account": "prod"}
        }))
        .unwrap();
        assert_eq!(a.kind, ArtifactType::DockerImage);
        assert_eq!(a.metadata.account, "prod");
        assert_eq!(serde_json::to_value(&a).unwrap()["type"], json!("docker/image"));
    }

    #[test]
    fn produced_artifact_points_at_versioned_name() {
        let m = Manifest::new(json!({
            "kind": "ConfigMap",
            "metadata": {"name": "cfg-v003", "namespace": "default"}
        }))
        .unwrap();
        let a = Artifact::produced(&m, "cfg", "prod");
        assert_eq!(a.kind, ArtifactType::ConfigMap);
        assert_eq!(a.name, "cfg");
        assert_eq!(a.reference, "cfg-v003");
        assert_eq!(a.location.as_deref(), Some("default"));
    }
}
