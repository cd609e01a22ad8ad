//! Minimal deserialized views of the orchestrator resources the identity
//! cache consumes. Only the fields the cache reads are declared.

use std::collections::BTreeMap;

use serde::Deserialize;

/// Label on an EndpointSlice naming its parent service.
pub const SERVICE_NAME_LABEL: &str = "kubernetes.io/service-name";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
    #[serde(default)]
    pub resource_version: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Pod {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: PodStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodStatus {
    #[serde(default, rename = "podIP")]
    pub pod_ip: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ReplicaSet {
    #[serde(default)]
    pub metadata: ObjectMeta,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EndpointSlice {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub endpoints: Vec<EndpointEntry>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointEntry {
    #[serde(default)]
    pub addresses: Vec<String>,
    #[serde(default)]
    pub target_ref: Option<TargetRef>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetRef {
    pub kind: String,
    pub name: String,
}

/// A `list` response envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct List<T> {
    #[serde(default)]
    pub metadata: ListMeta,
    #[serde(default = "Vec::new")]
    pub items: Vec<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    #[serde(default)]
    pub resource_version: String,
}

/// One line of a watch response stream.
#[derive(Debug, Clone, Deserialize)]
pub struct WatchEvent<T> {
    #[serde(rename = "type")]
    pub event_type: String,
    pub object: T,
}

impl EndpointSlice {
    /// Parent service name from the slice's well-known label, if present.
    pub fn service_name(&self) -> Option<&str> {
        self.metadata
            .labels
            .get(SERVICE_NAME_LABEL)
            .map(String::as_str)
            .filter(|s| !s.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pod_deserialize() {
        let json = r#"{
            "metadata": {
                "name": "p1",
                "namespace": "default",
                "ownerReferences": [{"kind": "ReplicaSet", "name": "p1-rs-abc12"}],
                "resourceVersion": "12345"
            },
            "status": {"podIP": "10.0.0.5"}
        }"#;
        let pod: Pod = serde_json::from_str(json).unwrap();
        assert_eq!(pod.metadata.name, "p1");
        assert_eq!(pod.status.pod_ip, "10.0.0.5");
        assert_eq!(pod.metadata.owner_references[0].kind, "ReplicaSet");
    }

    #[test]
    fn test_endpoint_slice_service_label() {
        let json = r#"{
            "metadata": {
                "name": "frontend-svc-abc",
                "namespace": "default",
                "labels": {"kubernetes.io/service-name": "frontend-svc"}
            },
            "endpoints": [
                {"addresses": ["10.0.0.5"], "targetRef": {"kind": "Pod", "name": "p1"}}
            ]
        }"#;
        let slice: EndpointSlice = serde_json::from_str(json).unwrap();
        assert_eq!(slice.service_name(), Some("frontend-svc"));
        assert_eq!(slice.endpoints[0].addresses, vec!["10.0.0.5"]);
    }

    #[test]
    fn test_watch_event_deserialize() {
        let json = r#"{"type": "ADDED", "object": {"metadata": {"name": "p2"}, "status": {}}}"#;
        let ev: WatchEvent<Pod> = serde_json::from_str(json).unwrap();
        assert_eq!(ev.event_type, "ADDED");
        assert_eq!(ev.object.metadata.name, "p2");
    }
}
