//! Static kind tables: deploy priority, scope, pod ownership and pod-template
//! location. Classification never consults live cluster data.

/// Priority assigned to kinds missing from [`PRIORITIES`]; sorts last.
pub const UNKNOWN_PRIORITY: u32 = 1000;

const PRIORITIES: &[(&str, u32)] = &[
    ("Namespace", 0),
    ("Role", 20),
    ("ClusterRole", 20),
    ("RoleBinding", 30),
    ("ClusterRoleBinding", 30),
    ("CustomResourceDefinition", 30),
    ("ServiceAccount", 40),
    ("StorageClass", 40),
    ("PersistentVolume", 40),
    ("MutatingWebhookConfiguration", 40),
    ("ValidatingWebhookConfiguration", 40),
    ("ConfigMap", 50),
    ("Secret", 50),
    ("PersistentVolumeClaim", 50),
    ("Service", 70),
    ("Ingress", 70),
    ("NetworkPolicy", 70),
    ("APIService", 80),
    ("PodDisruptionBudget", 90),
    ("Pod", 100),
    ("Deployment", 100),
    ("ReplicaSet", 100),
    ("StatefulSet", 100),
    ("DaemonSet", 100),
    ("Job", 100),
    ("CronJob", 100),
    ("HorizontalPodAutoscaler", 110),
];

const CLUSTER_SCOPED: &[&str] = &[
    "Namespace",
    "Node",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
    "StorageClass",
    "PersistentVolume",
    "PriorityClass",
    "PodSecurityPolicy",
    "APIService",
    "MutatingWebhookConfiguration",
    "ValidatingWebhookConfiguration",
];

const POD_OWNERS: &[&str] = &["CronJob", "DaemonSet", "Job", "ReplicaSet", "StatefulSet"];

const VERSIONED_BY_DEFAULT: &[&str] = &["Pod", "ReplicaSet", "ConfigMap", "Secret"];

const WORKLOAD_CONTROLLERS: &[&str] = &["Deployment", "ReplicaSet", "StatefulSet", "DaemonSet"];

const POD_TEMPLATE: &[&str] = &["spec", "template"];
const CRONJOB_POD_TEMPLATE: &[&str] = &["spec", "jobTemplate", "spec", "template"];

fn contains(table: &[&str], kind: &str) -> bool {
    table.iter().any(|k| k.eq_ignore_ascii_case(kind))
}

pub fn priority(kind: &str) -> u32 {
    PRIORITIES
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(kind))
        .map(|(_, p)| *p)
        .unwrap_or(UNKNOWN_PRIORITY)
}

pub fn is_cluster_scoped(kind: &str) -> bool {
    contains(CLUSTER_SCOPED, kind)
}

/// Kinds whose pods carry an owner reference back to the resource itself.
pub fn owns_pods(kind: &str) -> bool {
    contains(POD_OWNERS, kind)
}

pub fn versioned_by_default(kind: &str) -> bool {
    contains(VERSIONED_BY_DEFAULT, kind)
}

/// Controllers whose pod template also receives version annotations.
pub fn is_workload_controller(kind: &str) -> bool {
    contains(WORKLOAD_CONTROLLERS, kind)
}

pub fn is_list(kind: &str) -> bool {
    kind.eq_ignore_ascii_case("List")
}

/// Path to the pod template object for controller kinds.
pub fn pod_template_path(kind: &str) -> Option<&'static [&'static str]> {
    if contains(WORKLOAD_CONTROLLERS, kind) || kind.eq_ignore_ascii_case("Job") {
        Some(POD_TEMPLATE)
    } else if kind.eq_ignore_ascii_case("CronJob") {
        Some(CRONJOB_POD_TEMPLATE)
    } else {
        None
    }
}

/// Best-effort plural resource name used when discovery has no entry.
pub fn default_plural(kind: &str) -> String {
    let lower = kind.to_ascii_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with('x') {
        format!("{}es", lower)
    } else if let Some(stem) = lower.strip_suffix('y') {
        if stem.ends_with(|c: char| "aeiou".contains(c)) {
            format!("{}s", lower)
        } else {
            format!("{}ies", stem)
        }
    } else {
        format!("{}s", lower)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priorities_are_case_insensitive() {
        assert_eq!(priority("namespace"), 0);
        assert_eq!(priority("Role"), 20);
        assert_eq!(priority("clusterrolebinding"), 30);
        assert_eq!(priority("ConfigMap"), 50);
        assert_eq!(priority("Service"), 70);
        assert_eq!(priority("Deployment"), 100);
        assert_eq!(priority("HorizontalPodAutoscaler"), 110);
        assert_eq!(priority("Certificate"), UNKNOWN_PRIORITY);
    }

    #[test]
    fn scope_and_ownership_tables() {
        assert!(is_cluster_scoped("clusterRole"));
        assert!(!is_cluster_scoped("Role"));
        assert!(owns_pods("ReplicaSet"));
        assert!(!owns_pods("Deployment"));
        assert!(versioned_by_default("secret"));
        assert!(!versioned_by_default("Deployment"));
    }

    #[test]
    fn plural_guesses() {
        assert_eq!(default_plural("Deployment"), "deployments");
        assert_eq!(default_plural("Ingress"), "ingresses");
        assert_eq!(default_plural("NetworkPolicy"), "networkpolicies");
        assert_eq!(default_plural("Gateway"), "gateways");
    }
}
