use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Transport protocol of a captured flow.
/// Values must match the protocol byte emitted by the connection probe
/// (IPPROTO_TCP=6, IPPROTO_UDP=17).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Protocol {
    #[serde(rename = "TCP")]
    Tcp,
    #[serde(rename = "UDP")]
    Udp,
}

impl Protocol {
    /// Returns the canonical label used in storage documents.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Tcp => "TCP",
            Self::Udp => "UDP",
        }
    }

    /// Convert from the kernel protocol number. Anything that is not UDP
    /// is reported as TCP, matching what the probes can actually emit.
    pub fn from_u8(v: u8) -> Self {
        if v == 17 {
            Self::Udp
        } else {
            Self::Tcp
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// HTTP request method as encoded by the request probe.
/// Values must match the method byte in `http_event`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum HttpMethod {
    #[serde(rename = "UNKNOWN")]
    Unknown = 0,
    #[serde(rename = "GET")]
    Get = 1,
    #[serde(rename = "POST")]
    Post = 2,
    #[serde(rename = "PUT")]
    Put = 3,
    #[serde(rename = "DELETE")]
    Delete = 4,
    #[serde(rename = "PATCH")]
    Patch = 5,
    #[serde(rename = "HEAD")]
    Head = 6,
    #[serde(rename = "OPTIONS")]
    Options = 7,
}

impl HttpMethod {
    /// Returns the canonical method name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Patch => "PATCH",
            Self::Head => "HEAD",
            Self::Options => "OPTIONS",
        }
    }

    /// Convert from the probe's method byte. Unrecognised values map to
    /// `Unknown` rather than failing the decode.
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Get,
            2 => Self::Post,
            3 => Self::Put,
            4 => Self::Delete,
            5 => Self::Patch,
            6 => Self::Head,
            7 => Self::Options,
            _ => Self::Unknown,
        }
    }

    /// Convert from the canonical method name.
    pub fn from_str(name: &str) -> Self {
        match name {
            "GET" => Self::Get,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "PATCH" => Self::Patch,
            "HEAD" => Self::Head,
            "OPTIONS" => Self::Options,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for HttpMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A network peer with optional Kubernetes identity. The identity fields
/// start empty and are filled by the agent's identity cache when the IP
/// is known to belong to a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    pub ip: String,
    pub port: u16,
    #[serde(default)]
    pub pod: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub workload: String,
    #[serde(default)]
    pub workload_kind: String,
    #[serde(default)]
    pub service: String,
}

impl Endpoint {
    /// An endpoint with address only, before enrichment.
    pub fn from_addr(ip: String, port: u16) -> Self {
        Self {
            ip,
            port,
            ..Default::default()
        }
    }
}

/// One completed L4 flow, emitted by the connection probe on close.
/// Immutable after emission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub node: String,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub duration_ns: u64,
    pub retransmits: u32,
    pub protocol: Protocol,
}

/// One L7 HTTP/gRPC exchange, correlated by the request probe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub node: String,
    pub source: Endpoint,
    pub destination: Endpoint,
    pub method: HttpMethod,
    pub path: String,
    pub status_code: u16,
    pub latency_ns: u64,
    #[serde(default = "default_request_protocol")]
    pub protocol: String,
}

fn default_request_protocol() -> String {
    "HTTP".to_string()
}

/// A directed service-to-service edge aggregated over a trailing window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyLink {
    pub parent: String,
    pub child: String,
    pub call_count: u64,
    pub error_count: u64,
    pub p99_latency_ns: u64,
}

/// A single aggregated metric sample. Labels always carry `service`;
/// latency points add `quantile`, traffic points add `direction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_from_u8() {
        assert_eq!(Protocol::from_u8(6), Protocol::Tcp);
        assert_eq!(Protocol::from_u8(17), Protocol::Udp);
        assert_eq!(Protocol::from_u8(0), Protocol::Tcp);
    }

    #[test]
    fn test_http_method_roundtrip() {
        for raw in 0..=7u8 {
            let m = HttpMethod::from_u8(raw);
            assert_eq!(m as u8, raw);
            assert_eq!(HttpMethod::from_str(m.as_str()), m);
        }
        assert_eq!(HttpMethod::from_u8(99), HttpMethod::Unknown);
        assert_eq!(HttpMethod::from_str("TRACE"), HttpMethod::Unknown);
    }

    #[test]
    fn test_endpoint_serializes_camel_case() {
        let ep = Endpoint {
            ip: "10.0.0.5".to_string(),
            port: 8080,
            pod: "p1".to_string(),
            namespace: "default".to_string(),
            workload: "frontend".to_string(),
            workload_kind: "Deployment".to_string(),
            service: "frontend-svc".to_string(),
        };
        let json = serde_json::to_value(&ep).unwrap();
        assert_eq!(json["workloadKind"], "Deployment");
        assert_eq!(json["service"], "frontend-svc");
    }

    #[test]
    fn test_connection_event_json_roundtrip() {
        let ev = ConnectionEvent {
            timestamp: Utc::now(),
            node: "node-1".to_string(),
            source: Endpoint::from_addr("10.0.0.1".to_string(), 44310),
            destination: Endpoint::from_addr("10.0.0.2".to_string(), 80),
            bytes_sent: 1024,
            bytes_recv: 4096,
            duration_ns: 1_500_000,
            retransmits: 2,
            protocol: Protocol::Tcp,
        };
        let json = serde_json::to_string(&ev).unwrap();
        let back: ConnectionEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
        assert!(json.contains("\"protocol\":\"TCP\""));
    }
}
