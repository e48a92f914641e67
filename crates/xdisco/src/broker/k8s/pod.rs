//! Pod <-> `Server` translation via annotations (`broker/k8s/pod_build.go`).
//!
//! `addr` is written and read as a single pre-joined string, matching
//! `xdisco/v1/addr` in the annotation schema; `Ports` is left empty for
//! orchestrator-derived servers (spec §9 — callers must not call
//! `private_address`/`local_address`/`public_address` on these without
//! splitting `host` themselves first).

use chrono::Utc;
use k8s_openapi::api::core::v1::Pod;
use std::collections::HashMap;

use crate::error::{Result, XdiscoError};
use crate::server::{Server, State};

const ANNOTATION_KEYSPACE: &str = "xdisco/v1/";

/// Stamps `s`'s identity onto `pod`'s annotations, failing if the pod's
/// first container has no usable port.
pub fn update_pod(pod: &mut Pod, s: &Server) -> Result<()> {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| ports.first())
        .map(|p| p.container_port)
        .filter(|p| *p > 0)
        .ok_or_else(|| {
            XdiscoError::InvalidServer(format!(
                "invalid port of container in pod {}",
                pod.metadata.name.clone().unwrap_or_default()
            ))
        })?;

    let annotations = pod.metadata.annotations.get_or_insert_with(Default::default);
    annotations.insert(format!("{ANNOTATION_KEYSPACE}kind"), s.kind.clone());
    annotations.insert(format!("{ANNOTATION_KEYSPACE}addr"), s.host.clone());
    annotations.insert(format!("{ANNOTATION_KEYSPACE}status"), s.status.to_string());
    Ok(())
}

/// Reconstructs a `Server` from a pod's `xdisco/v1/`-prefixed annotations
/// and labels. Returns `None` for pods never registered through this crate
/// (invalid/missing kind or id).
pub fn pod_as_server(pod: &Pod) -> Option<Server> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod.metadata.namespace.clone().unwrap_or_default();
    let annotations = pod.metadata.annotations.clone().unwrap_or_default();

    let mut cleaned: HashMap<String, String> = HashMap::new();
    for (k, v) in &annotations {
        if let Some(stripped) = k.strip_prefix(ANNOTATION_KEYSPACE) {
            cleaned.insert(stripped.to_string(), v.clone());
        }
    }

    let kind = cleaned.get("kind").cloned().unwrap_or_default();
    let addr = cleaned.get("addr").cloned().unwrap_or_default();
    let status = cleaned
        .get("status")
        .and_then(|v| match v.as_str() {
            "running" => Some(State::Running),
            "stopping" => Some(State::Stopping),
            "stopped" => Some(State::Stopped),
            _ => None,
        })
        .unwrap_or(State::Running);

    let created_at = pod
        .metadata
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);

    let mut s = Server::new(name.clone(), kind.clone(), addr);
    s.labels = pod.metadata.labels.clone().unwrap_or_default();
    s.annotations = cleaned;
    s.status = status;
    s.created_at = created_at;
    if !s.is_valid() {
        return None;
    }
    s.set_key(format!("/k8s/{namespace}/{kind}/{name}"));
    Some(s)
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod_with_annotations(annotations: HashMap<String, String>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("pod-a".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn annotation_round_trip_leaves_ports_empty() {
        let mut annotations = HashMap::new();
        annotations.insert("xdisco/v1/kind".to_string(), "test".to_string());
        annotations.insert("xdisco/v1/addr".to_string(), "127.0.0.1:11".to_string());
        annotations.insert("xdisco/v1/status".to_string(), "running".to_string());
        let pod = pod_with_annotations(annotations);

        let s = pod_as_server(&pod).expect("valid server");
        assert_eq!(s.kind, "test");
        assert_eq!(s.host, "127.0.0.1:11");
        assert_eq!(s.status, State::Running);
        assert!(s.ports.is_empty());
        assert_eq!(s.annotations.get("kind").map(String::as_str), Some("test"));
    }

    #[test]
    fn missing_kind_is_invalid() {
        let pod = pod_with_annotations(HashMap::new());
        assert!(pod_as_server(&pod).is_none());
    }
}
