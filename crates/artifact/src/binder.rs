use metrics::counter;
use once_cell::sync::Lazy;
use spindle_core::Manifest;
use tracing::debug;

use crate::template::{collect, compile, rewrite, Step};
use crate::{Artifact, ArtifactType};

const POD_SPECS: [&str; 2] = ["spec", "spec.template.spec"];

const IMAGE_FIELDS: [&str; 2] = ["containers[].image", "initContainers[].image"];

const CONFIG_MAP_FIELDS: [&str; 4] = [
    "volumes[].configMap.name",
    "volumes[].projected.sources[].configMap.name",
    "containers[].env[].valueFrom.configMapKeyRef.name",
    "containers[].envFrom[].configMapRef.name",
];

const SECRET_FIELDS: [&str; 4] = [
    "volumes[].secret.secretName",
    "volumes[].projected.sources[].secret.name",
    "containers[].env[].valueFrom.secretKeyRef.name",
    "containers[].envFrom[].secretRef.name",
];

struct Template {
    kind: ArtifactType,
    steps: Vec<Step>,
    /// Walked by [`find_artifacts`].
    discoverable: bool,
}

fn pod_templates(kind: ArtifactType, fields: &[&str], discoverable: impl Fn(&str) -> bool) -> Vec<Template> {
    let mut out = Vec::new();
    for prefix in POD_SPECS {
        for field in fields {
            out.push(Template {
                kind: kind.clone(),
                steps: compile(&format!("{}.{}", prefix, field)),
                discoverable: discoverable(field),
            });
        }
    }
    out
}

static TEMPLATES: Lazy<Vec<Template>> = Lazy::new(|| {
    let mut t = Vec::new();
    t.extend(pod_templates(ArtifactType::DockerImage, &IMAGE_FIELDS, |_| true));
    t.extend(pod_templates(ArtifactType::ConfigMap, &CONFIG_MAP_FIELDS, |f| f == "volumes[].configMap.name"));
    t.extend(pod_templates(ArtifactType::Secret, &SECRET_FIELDS, |f| f == "volumes[].secret.secretName"));
    for (kind, guard) in [(ArtifactType::Deployment, "deployment"), (ArtifactType::ReplicaSet, "replicaSet")] {
        t.push(Template {
            kind,
            steps: compile(&format!("spec.scaleTargetRef.name?kind={}", guard)),
            discoverable: false,
        });
    }
    t
});

/// Rewrite references to `artifacts` owned by `account`; returns the number of
/// fields rewritten. Artifacts from other accounts are never bound.
pub fn bind_artifacts(manifest: &mut Manifest, artifacts: &[Artifact], account: &str) -> usize {
    let Some(root) = manifest.pointer_mut("") else { return 0 };
    let mut total = 0;
    for a in artifacts {
        if a.metadata.account != account {
            continue;
        }
        let n: usize = TEMPLATES
            .iter()
            .filter(|t| t.kind == a.kind)
            .map(|t| rewrite(root, &t.steps, &a.name, &a.reference))
            .sum();
        if n > 0 {
            debug!(artifact = %a.name, reference = %a.reference, kind = %a.kind, replaced = n, "bound artifact");
        }
        total += n;
    }
    if total > 0 {
        counter!("artifact_bindings_total", total as u64);
    }
    total
}

/// Docker artifact name: cut at the first `@`, else the last `:`.
fn docker_name(reference: &str) -> &str {
    if let Some(i) = reference.find('@') {
        &reference[..i]
    } else if let Some(i) = reference.rfind(':') {
        &reference[..i]
    } else {
        reference
    }
}

/// Artifacts a manifest refers to through its images and volumes, in
/// discovery order without duplicates.
pub fn find_artifacts(manifest: &Manifest) -> Vec<Artifact> {
    let mut out: Vec<Artifact> = Vec::new();
    for t in TEMPLATES.iter().filter(|t| t.discoverable) {
        let mut refs = Vec::new();
        collect(manifest.as_value(), &t.steps, &mut refs);
        for reference in refs {
            if out.iter().any(|a| a.kind == t.kind && a.reference == reference) {
                continue;
            }
            let name = match t.kind {
                ArtifactType::DockerImage => docker_name(reference),
                _ => reference,
            };
            out.push(Artifact::new(t.kind.clone(), name, reference, ""));
        }
    }
    out
}
