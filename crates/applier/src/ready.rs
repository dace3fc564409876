//! Per-kind readiness predicate over unstructured objects.
//!
//! A light rendition of the kstatus conventions: replica accounting for
//! workload kinds (with an `observedGeneration` guard so a stale status never
//! reads as ready), condition checks for everything that publishes a `Ready`
//! condition, and bare existence for inert kinds.

use konverge_core::Manifest;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    InProgress(String),
    Failed(String),
}

/// Evaluate readiness of a live object.
pub fn check(obj: &Manifest) -> Readiness {
    let kind = obj.get("kind").and_then(|v| v.as_str()).unwrap_or("");

    if stale_status(obj) {
        return Readiness::InProgress("status generation is stale".to_string());
    }

    match kind {
        "Deployment" => check_deployment(obj),
        "StatefulSet" => check_statefulset(obj),
        "ReplicaSet" => check_replicaset(obj),
        "DaemonSet" => check_daemonset(obj),
        "Pod" => check_pod(obj),
        "Job" => check_job(obj),
        "PersistentVolumeClaim" => check_pvc(obj),
        "Namespace" => check_namespace(obj),
        "Service" => check_service(obj),
        _ => check_generic(obj),
    }
}

fn stale_status(obj: &Manifest) -> bool {
    let generation = obj.pointer("/metadata/generation").and_then(|v| v.as_u64());
    let observed = obj.pointer("/status/observedGeneration").and_then(|v| v.as_u64());
    matches!((generation, observed), (Some(g), Some(o)) if o < g)
}

fn status_u64(obj: &Manifest, field: &str) -> u64 {
    obj.pointer(&format!("/status/{field}")).and_then(|v| v.as_u64()).unwrap_or(0)
}

fn condition<'a>(obj: &'a Manifest, cond_type: &str) -> Option<&'a Manifest> {
    obj.pointer("/status/conditions")?
        .as_array()?
        .iter()
        .find(|c| c.get("type").and_then(|t| t.as_str()) == Some(cond_type))
}

fn condition_status<'a>(obj: &'a Manifest, cond_type: &str) -> Option<&'a str> {
    condition(obj, cond_type)?.get("status")?.as_str()
}

fn condition_reason<'a>(obj: &'a Manifest, cond_type: &str) -> &'a str {
    condition(obj, cond_type)
        .and_then(|c| c.get("reason"))
        .and_then(|r| r.as_str())
        .unwrap_or("unknown")
}

fn check_deployment(obj: &Manifest) -> Readiness {
    if condition_reason(obj, "Progressing") == "ProgressDeadlineExceeded" {
        return Readiness::Failed("progress deadline exceeded".to_string());
    }

    let want = obj.pointer("/spec/replicas").and_then(|v| v.as_u64()).unwrap_or(1);
    let updated = status_u64(obj, "updatedReplicas");
    let ready = status_u64(obj, "readyReplicas");
    // availableReplicas only counts pods past minReadySeconds, which is what
    // makes wait honor the declared minimum ready period.
    let available = status_u64(obj, "availableReplicas");

    if updated >= want && ready >= want && available >= want {
        Readiness::Ready
    } else {
        Readiness::InProgress(format!("{available}/{want} replicas available"))
    }
}

fn check_statefulset(obj: &Manifest) -> Readiness {
    let want = obj.pointer("/spec/replicas").and_then(|v| v.as_u64()).unwrap_or(1);
    let ready = status_u64(obj, "readyReplicas");
    let updated = status_u64(obj, "updatedReplicas");
    if ready >= want && updated >= want {
        Readiness::Ready
    } else {
        Readiness::InProgress(format!("{ready}/{want} replicas ready"))
    }
}

fn check_replicaset(obj: &Manifest) -> Readiness {
    let want = obj.pointer("/spec/replicas").and_then(|v| v.as_u64()).unwrap_or(1);
    let ready = status_u64(obj, "readyReplicas");
    let available = status_u64(obj, "availableReplicas");
    if ready >= want && available >= want {
        Readiness::Ready
    } else {
        Readiness::InProgress(format!("{ready}/{want} replicas ready"))
    }
}

fn check_daemonset(obj: &Manifest) -> Readiness {
    let desired = status_u64(obj, "desiredNumberScheduled");
    let available = status_u64(obj, "numberAvailable");
    if available >= desired {
        Readiness::Ready
    } else {
        Readiness::InProgress(format!("{available}/{desired} pods available"))
    }
}

fn check_pod(obj: &Manifest) -> Readiness {
    match obj.pointer("/status/phase").and_then(|v| v.as_str()) {
        Some("Succeeded") => Readiness::Ready,
        Some("Failed") => Readiness::Failed("pod failed".to_string()),
        Some("Running") if condition_status(obj, "Ready") == Some("True") => Readiness::Ready,
        phase => Readiness::InProgress(format!("pod phase {}", phase.unwrap_or("unknown"))),
    }
}

fn check_job(obj: &Manifest) -> Readiness {
    if condition_status(obj, "Complete") == Some("True") {
        return Readiness::Ready;
    }
    if condition_status(obj, "Failed") == Some("True") {
        return Readiness::Failed(condition_reason(obj, "Failed").to_string());
    }
    Readiness::InProgress("job not complete".to_string())
}

fn check_pvc(obj: &Manifest) -> Readiness {
    match obj.pointer("/status/phase").and_then(|v| v.as_str()) {
        Some("Bound") => Readiness::Ready,
        phase => Readiness::InProgress(format!("claim phase {}", phase.unwrap_or("unknown"))),
    }
}

fn check_namespace(obj: &Manifest) -> Readiness {
    match obj.pointer("/status/phase").and_then(|v| v.as_str()) {
        None | Some("Active") => Readiness::Ready,
        Some(phase) => Readiness::InProgress(format!("namespace phase {phase}")),
    }
}

fn check_service(obj: &Manifest) -> Readiness {
    let is_lb = obj.pointer("/spec/type").and_then(|v| v.as_str()) == Some("LoadBalancer");
    if !is_lb {
        return Readiness::Ready;
    }
    let has_ingress = obj
        .pointer("/status/loadBalancer/ingress")
        .and_then(|v| v.as_array())
        .is_some_and(|a| !a.is_empty());
    if has_ingress {
        Readiness::Ready
    } else {
        Readiness::InProgress("load balancer not provisioned".to_string())
    }
}

fn check_generic(obj: &Manifest) -> Readiness {
    // No status at all: the kind has nothing to reconcile, existing is ready.
    if obj.get("status").is_none() {
        return Readiness::Ready;
    }
    match condition_status(obj, "Ready") {
        Some("True") | None => Readiness::Ready,
        Some(_) => Readiness::InProgress(condition_reason(obj, "Ready").to_string()),
    }
}
