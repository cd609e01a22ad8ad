//! Wire types for the `nefi.v1` gRPC surface.
//!
//! The message structs and service code are maintained by hand (matching
//! `proto/nefi/v1/nefi.proto`) so that builds do not depend on protoc.
//! Regenerating with tonic-build must produce wire-compatible output.

use chrono::{DateTime, Utc};
use prost::Message;

use crate::model::{ConnectionEvent, Endpoint, HttpMethod, Protocol, RequestEvent};

#[derive(Clone, PartialEq, Message)]
pub struct EndpointProto {
    #[prost(string, tag = "1")]
    pub ip: String,
    #[prost(uint32, tag = "2")]
    pub port: u32,
    #[prost(string, tag = "3")]
    pub pod: String,
    #[prost(string, tag = "4")]
    pub namespace: String,
    #[prost(string, tag = "5")]
    pub workload: String,
    #[prost(string, tag = "6")]
    pub workload_kind: String,
    #[prost(string, tag = "7")]
    pub service: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectionEventProto {
    #[prost(int64, tag = "1")]
    pub timestamp_ns: i64,
    #[prost(string, tag = "2")]
    pub node: String,
    #[prost(message, optional, tag = "3")]
    pub source: Option<EndpointProto>,
    #[prost(message, optional, tag = "4")]
    pub destination: Option<EndpointProto>,
    #[prost(uint64, tag = "5")]
    pub bytes_sent: u64,
    #[prost(uint64, tag = "6")]
    pub bytes_recv: u64,
    #[prost(uint64, tag = "7")]
    pub duration_ns: u64,
    #[prost(uint32, tag = "8")]
    pub retransmits: u32,
    #[prost(string, tag = "9")]
    pub protocol: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct HttpRequestEventProto {
    #[prost(int64, tag = "1")]
    pub timestamp_ns: i64,
    #[prost(string, tag = "2")]
    pub node: String,
    #[prost(message, optional, tag = "3")]
    pub source: Option<EndpointProto>,
    #[prost(message, optional, tag = "4")]
    pub destination: Option<EndpointProto>,
    #[prost(string, tag = "5")]
    pub method: String,
    #[prost(string, tag = "6")]
    pub path: String,
    #[prost(uint32, tag = "7")]
    pub status_code: u32,
    #[prost(uint64, tag = "8")]
    pub latency_ns: u64,
    #[prost(string, tag = "9")]
    pub protocol: String,
}

/// One batch of events from a single agent. `node` applies to any event
/// whose own `node` field is blank.
#[derive(Clone, PartialEq, Message)]
pub struct EventBatch {
    #[prost(string, tag = "1")]
    pub node: String,
    #[prost(message, repeated, tag = "2")]
    pub connections: Vec<ConnectionEventProto>,
    #[prost(message, repeated, tag = "3")]
    pub http_requests: Vec<HttpRequestEventProto>,
}

/// End-of-stream acknowledgement.
#[derive(Clone, PartialEq, Message)]
pub struct StreamResponse {
    #[prost(uint64, tag = "1")]
    pub accepted: u64,
    #[prost(string, tag = "2")]
    pub error: String,
}

// ---------------------------------------------------------------------------
// Model -> proto
// ---------------------------------------------------------------------------

fn endpoint_to_proto(ep: &Endpoint) -> EndpointProto {
    EndpointProto {
        ip: ep.ip.clone(),
        port: u32::from(ep.port),
        pod: ep.pod.clone(),
        namespace: ep.namespace.clone(),
        workload: ep.workload.clone(),
        workload_kind: ep.workload_kind.clone(),
        service: ep.service.clone(),
    }
}

fn timestamp_ns(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_nanos_opt().unwrap_or_default()
}

pub fn connection_to_proto(ev: &ConnectionEvent) -> ConnectionEventProto {
    ConnectionEventProto {
        timestamp_ns: timestamp_ns(ev.timestamp),
        node: ev.node.clone(),
        source: Some(endpoint_to_proto(&ev.source)),
        destination: Some(endpoint_to_proto(&ev.destination)),
        bytes_sent: ev.bytes_sent,
        bytes_recv: ev.bytes_recv,
        duration_ns: ev.duration_ns,
        retransmits: ev.retransmits,
        protocol: ev.protocol.as_str().to_string(),
    }
}

pub fn request_to_proto(ev: &RequestEvent) -> HttpRequestEventProto {
    HttpRequestEventProto {
        timestamp_ns: timestamp_ns(ev.timestamp),
        node: ev.node.clone(),
        source: Some(endpoint_to_proto(&ev.source)),
        destination: Some(endpoint_to_proto(&ev.destination)),
        method: ev.method.as_str().to_string(),
        path: ev.path.clone(),
        status_code: u32::from(ev.status_code),
        latency_ns: ev.latency_ns,
        protocol: ev.protocol.clone(),
    }
}

// ---------------------------------------------------------------------------
// Proto -> model
// ---------------------------------------------------------------------------

fn endpoint_from_proto(ep: Option<&EndpointProto>) -> Endpoint {
    let Some(ep) = ep else {
        return Endpoint::default();
    };
    Endpoint {
        ip: ep.ip.clone(),
        port: ep.port as u16,
        pod: ep.pod.clone(),
        namespace: ep.namespace.clone(),
        workload: ep.workload.clone(),
        workload_kind: ep.workload_kind.clone(),
        service: ep.service.clone(),
    }
}

/// Decode a connection event, defaulting a blank per-event node to the
/// batch-level node.
pub fn connection_from_proto(ev: &ConnectionEventProto, batch_node: &str) -> ConnectionEvent {
    let node = if ev.node.is_empty() {
        batch_node.to_string()
    } else {
        ev.node.clone()
    };
    ConnectionEvent {
        timestamp: DateTime::from_timestamp_nanos(ev.timestamp_ns),
        node,
        source: endpoint_from_proto(ev.source.as_ref()),
        destination: endpoint_from_proto(ev.destination.as_ref()),
        bytes_sent: ev.bytes_sent,
        bytes_recv: ev.bytes_recv,
        duration_ns: ev.duration_ns,
        retransmits: ev.retransmits,
        protocol: if ev.protocol == "UDP" {
            Protocol::Udp
        } else {
            Protocol::Tcp
        },
    }
}

/// Decode a request event, defaulting a blank per-event node to the
/// batch-level node.
pub fn request_from_proto(ev: &HttpRequestEventProto, batch_node: &str) -> RequestEvent {
    let node = if ev.node.is_empty() {
        batch_node.to_string()
    } else {
        ev.node.clone()
    };
    RequestEvent {
        timestamp: DateTime::from_timestamp_nanos(ev.timestamp_ns),
        node,
        source: endpoint_from_proto(ev.source.as_ref()),
        destination: endpoint_from_proto(ev.destination.as_ref()),
        method: HttpMethod::from_str(&ev.method),
        path: ev.path.clone(),
        status_code: ev.status_code as u16,
        latency_ns: ev.latency_ns,
        protocol: ev.protocol.clone(),
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub mod event_ingestion_client {
    use super::{EventBatch, StreamResponse};
    use tonic::codegen::*;

    /// Client for the `nefi.v1.EventIngestion` service.
    #[derive(Debug, Clone)]
    pub struct EventIngestionClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl EventIngestionClient<tonic::transport::Channel> {
        pub fn new(channel: tonic::transport::Channel) -> Self {
            let inner = tonic::client::Grpc::new(channel);
            Self { inner }
        }
    }

    impl<T> EventIngestionClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        /// Client-streaming upload of event batches. The response arrives
        /// when the request stream is closed.
        pub async fn stream_events(
            &mut self,
            request: impl tonic::IntoStreamingRequest<Message = EventBatch>,
        ) -> std::result::Result<tonic::Response<StreamResponse>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::new(
                    tonic::Code::Unknown,
                    format!("Service was not ready: {}", e.into()),
                )
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path =
                http::uri::PathAndQuery::from_static("/nefi.v1.EventIngestion/StreamEvents");
            self.inner
                .client_streaming(request.into_streaming_request(), path, codec)
                .await
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

pub mod event_ingestion_server {
    use super::{EventBatch, StreamResponse};
    use tonic::codegen::*;

    /// Server-side handler for the `nefi.v1.EventIngestion` service.
    #[async_trait]
    pub trait EventIngestion: Send + Sync + 'static {
        async fn stream_events(
            &self,
            request: tonic::Request<tonic::Streaming<EventBatch>>,
        ) -> std::result::Result<tonic::Response<StreamResponse>, tonic::Status>;
    }

    pub struct EventIngestionServer<T> {
        inner: Arc<T>,
    }

    impl<T: EventIngestion> EventIngestionServer<T> {
        pub fn new(inner: T) -> Self {
            Self::from_arc(Arc::new(inner))
        }

        pub fn from_arc(inner: Arc<T>) -> Self {
            Self { inner }
        }
    }

    impl<T> Clone for EventIngestionServer<T> {
        fn clone(&self) -> Self {
            Self {
                inner: Arc::clone(&self.inner),
            }
        }
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for EventIngestionServer<T>
    where
        T: EventIngestion,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                "/nefi.v1.EventIngestion/StreamEvents" => {
                    struct StreamEventsSvc<T>(Arc<T>);

                    impl<T: EventIngestion> tonic::server::ClientStreamingService<EventBatch>
                        for StreamEventsSvc<T>
                    {
                        type Response = StreamResponse;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

                        fn call(
                            &mut self,
                            request: tonic::Request<tonic::Streaming<EventBatch>>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            Box::pin(async move { inner.stream_events(request).await })
                        }
                    }

                    let inner = Arc::clone(&self.inner);
                    Box::pin(async move {
                        let method = StreamEventsSvc(inner);
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec);
                        Ok(grpc.client_streaming(method, req).await)
                    })
                }
                _ => Box::pin(async move {
                    Ok(http::Response::builder()
                        .status(200)
                        .header("grpc-status", "12")
                        .header("content-type", "application/grpc")
                        .body(empty_body())
                        .unwrap())
                }),
            }
        }
    }

    impl<T: EventIngestion> tonic::server::NamedService for EventIngestionServer<T> {
        const NAME: &'static str = "nefi.v1.EventIngestion";
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Endpoint;

    fn sample_connection() -> ConnectionEvent {
        ConnectionEvent {
            timestamp: DateTime::from_timestamp_nanos(1_700_000_000_123_456_789),
            node: String::new(),
            source: Endpoint {
                ip: "10.0.0.1".to_string(),
                port: 43_210,
                service: "frontend-svc".to_string(),
                ..Default::default()
            },
            destination: Endpoint::from_addr("10.0.0.2".to_string(), 80),
            bytes_sent: 512,
            bytes_recv: 2048,
            duration_ns: 5_000_000,
            retransmits: 1,
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn test_connection_roundtrip_defaults_node_from_batch() {
        let ev = sample_connection();
        let proto = connection_to_proto(&ev);
        let back = connection_from_proto(&proto, "node-7");

        assert_eq!(back.node, "node-7");
        assert_eq!(back.timestamp, ev.timestamp);
        assert_eq!(back.source, ev.source);
        assert_eq!(back.destination, ev.destination);
        assert_eq!(back.bytes_sent, ev.bytes_sent);
        assert_eq!(back.bytes_recv, ev.bytes_recv);
        assert_eq!(back.duration_ns, ev.duration_ns);
        assert_eq!(back.retransmits, ev.retransmits);
        assert_eq!(back.protocol, ev.protocol);
    }

    #[test]
    fn test_connection_keeps_explicit_node() {
        let mut ev = sample_connection();
        ev.node = "node-1".to_string();
        let proto = connection_to_proto(&ev);
        let back = connection_from_proto(&proto, "node-7");
        assert_eq!(back.node, "node-1");
    }

    #[test]
    fn test_request_roundtrip() {
        let ev = RequestEvent {
            timestamp: DateTime::from_timestamp_nanos(1_700_000_000_000_000_000),
            node: "node-2".to_string(),
            source: Endpoint::from_addr("10.0.0.3".to_string(), 55_000),
            destination: Endpoint {
                ip: "10.0.0.4".to_string(),
                port: 8080,
                service: "api".to_string(),
                ..Default::default()
            },
            method: HttpMethod::Post,
            path: "/v1/orders".to_string(),
            status_code: 503,
            latency_ns: 42_000_000,
            protocol: "HTTP".to_string(),
        };
        let back = request_from_proto(&request_to_proto(&ev), "ignored");
        assert_eq!(back, ev);
    }

    #[test]
    fn test_missing_endpoint_decodes_empty() {
        let proto = ConnectionEventProto {
            timestamp_ns: 1,
            ..Default::default()
        };
        let ev = connection_from_proto(&proto, "n");
        assert_eq!(ev.source, Endpoint::default());
        assert_eq!(ev.destination, Endpoint::default());
    }

    #[test]
    fn test_batch_prost_roundtrip() {
        let batch = EventBatch {
            node: "node-1".to_string(),
            connections: vec![connection_to_proto(&sample_connection())],
            http_requests: vec![],
        };
        let bytes = batch.encode_to_vec();
        let back = EventBatch::decode(bytes.as_slice()).unwrap();
        assert_eq!(back, batch);
    }
}
