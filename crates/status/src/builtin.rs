//! Built-in status rules for core workload kinds.

use serde_json::Value as Json;

use crate::StatusResult;

const GENERATION_PENDING: &str = "Waiting for status generation to match updated object generation";

fn int(doc: &Json, ptr: &str) -> Option<i64> {
    doc.pointer(ptr).and_then(|v| v.as_i64())
}

fn str_at<'a>(doc: &'a Json, ptr: &str) -> Option<&'a str> {
    doc.pointer(ptr).and_then(|v| v.as_str())
}

fn conditions(doc: &Json) -> &[Json] {
    doc.pointer("/status/conditions").and_then(|v| v.as_array()).map(Vec::as_slice).unwrap_or(&[])
}

fn generation_pending(doc: &Json) -> bool {
    int(doc, "/metadata/generation") != int(doc, "/status/observedGeneration")
}

/// Replica counts checked in order; `None` skips that check.
struct Replicas {
    desired: i64,
    scheduled: Option<i64>,
    updated: Option<i64>,
    available: Option<i64>,
    ready: Option<i64>,
}

impl Replicas {
    fn check(&self) -> StatusResult {
        let r = StatusResult::default();
        if self.scheduled.is_some_and(|n| n < self.desired) {
            return r.unstable("Waiting for all replicas to be scheduled");
        }
        if self.updated.is_some_and(|n| n < self.desired) {
            return r.unstable("Waiting for all replicas to be updated");
        }
        if self.available.is_some_and(|n| n < self.desired) {
            let msg = "Waiting for all replicas to be available";
            return r.unstable(msg).unavailable(msg);
        }
        if self.ready.is_some_and(|n| n < self.desired) {
            let msg = "Waiting for all replicas to be ready";
            return r.unstable(msg).unavailable(msg);
        }
        r
    }
}

fn desired_replicas(doc: &Json) -> i64 {
    int(doc, "/spec/replicas").unwrap_or(1)
}

pub fn deployment(doc: &Json) -> StatusResult {
    if generation_pending(doc) {
        return StatusResult::default().unstable(GENERATION_PENDING);
    }
    let mut result = Replicas {
        desired: desired_replicas(doc),
        scheduled: int(doc, "/status/replicas").or(Some(0)),
        updated: int(doc, "/status/updatedReplicas").or(Some(0)),
        available: int(doc, "/status/availableReplicas").or(Some(0)),
        ready: int(doc, "/status/readyReplicas").or(Some(0)),
    }
    .check();
    // paused and failed are reported alongside the replica checks
    let reason = |c: &Json| c.get("reason").and_then(|r| r.as_str()).unwrap_or("").to_ascii_lowercase();
    let message = |c: &Json| c.get("message").and_then(|m| m.as_str()).unwrap_or("").to_string();
    for c in conditions(doc) {
        let r = reason(c);
        if r == "deploymentpaused" {
            result = result.paused(message(c));
        } else if r == "progressdeadlineexceeded" && c.get("type").and_then(|t| t.as_str()) == Some("Progressing") {
            result = result.failed(message(c));
        }
    }
    result
}

pub fn replica_set(doc: &Json) -> StatusResult {
    if generation_pending(doc) {
        return StatusResult::default().unstable(GENERATION_PENDING);
    }
    Replicas {
        desired: desired_replicas(doc),
        scheduled: int(doc, "/status/fullyLabeledReplicas").or(Some(0)),
        updated: None,
        available: int(doc, "/status/availableReplicas").or(Some(0)),
        ready: int(doc, "/status/readyReplicas").or(Some(0)),
    }
    .check()
}

pub fn stateful_set(doc: &Json) -> StatusResult {
    if doc.get("status").map(|s| s.is_null()).unwrap_or(true) {
        return StatusResult::none_reported();
    }
    if generation_pending(doc) {
        return StatusResult::default().unstable(GENERATION_PENDING);
    }
    let on_delete = str_at(doc, "/spec/updateStrategy/type") == Some("OnDelete");
    let result = Replicas {
        desired: desired_replicas(doc),
        scheduled: int(doc, "/status/replicas").or(Some(0)),
        updated: if on_delete { None } else { int(doc, "/status/updatedReplicas").or(Some(0)) },
        available: int(doc, "/status/availableReplicas"),
        ready: int(doc, "/status/readyReplicas").or(Some(0)),
    }
    .check();
    if !result.stable.state || on_delete {
        return result;
    }
    let current = str_at(doc, "/status/currentRevision");
    let update = str_at(doc, "/status/updateRevision");
    if update.is_some() && current != update {
        return result.unstable("Waiting for the updated revision to become current");
    }
    result
}

pub fn daemon_set(doc: &Json) -> StatusResult {
    if generation_pending(doc) {
        return StatusResult::default().unstable(GENERATION_PENDING);
    }
    if str_at(doc, "/spec/updateStrategy/type").unwrap_or("RollingUpdate") == "RollingUpdate" {
        return StatusResult::default();
    }
    Replicas {
        desired: int(doc, "/status/desiredNumberScheduled").unwrap_or(0),
        scheduled: int(doc, "/status/currentNumberScheduled").or(Some(0)),
        updated: int(doc, "/status/updatedNumberScheduled").or(Some(0)),
        available: int(doc, "/status/numberAvailable").or(Some(0)),
        ready: int(doc, "/status/numberReady").or(Some(0)),
    }
    .check()
}

pub fn job(doc: &Json) -> StatusResult {
    let completions = int(doc, "/spec/completions").unwrap_or(1);
    let succeeded = int(doc, "/status/succeeded").unwrap_or(0);
    if succeeded < completions {
        if let Some(c) = conditions(doc).iter().find(|c| c.get("type").and_then(|t| t.as_str()) == Some("Failed")) {
            let msg = c.get("message").and_then(|m| m.as_str()).unwrap_or("Job failed").to_string();
            return StatusResult::default().unstable("Job failed").failed(msg);
        }
        return StatusResult::default().unstable("Waiting for jobs to finish");
    }
    StatusResult::default()
}

pub fn pod(doc: &Json) -> StatusResult {
    match str_at(doc, "/status/phase") {
        Some("Failed") => {
            let msg = str_at(doc, "/status/message").or(str_at(doc, "/status/reason")).unwrap_or("Pod failed");
            StatusResult::default().unstable("Pod failed").unavailable("Pod failed").failed(msg)
        }
        Some("Pending") => StatusResult::default().unstable("Pod is pending"),
        None => StatusResult::none_reported(),
        _ => StatusResult::default(),
    }
}

pub fn horizontal_pod_autoscaler(doc: &Json) -> StatusResult {
    let current = int(doc, "/status/currentReplicas").unwrap_or(0);
    let desired = int(doc, "/status/desiredReplicas").unwrap_or(0);
    if current == desired {
        return StatusResult::default();
    }
    let direction = if current > desired { "down" } else { "up" };
    let msg = format!(
        "Waiting for HPA to complete a scale {}, current: {} desired: {}",
        direction, current, desired
    );
    StatusResult::default().unstable(msg.clone()).unavailable(msg)
}
