//! Elasticsearch storage adapter.
//!
//! Implements every storage capability over the Elasticsearch HTTP API:
//! date-suffixed indices, an NDJSON bulk buffer flushed on size or
//! interval, JSON query DSL for the readers, and terms aggregations for
//! service metadata. The bulk HTTP call always happens outside the
//! buffer lock.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::StorageConfig;
use crate::health::ServerMetrics;
use crate::model::{
    ConnectionEvent, DependencyLink, DependencyQuery, DependencyReader, DependencyWriter,
    EventQuery, EventReader, EventWriter, MetricKind, MetricQuery, MetricReader, MetricWriter,
    RequestEvent, ServiceReader, StorageError, StorageResult, TimeSeriesPoint,
};

const INDEX_CONNECTIONS: &str = "nefi-connections";
const INDEX_REQUESTS: &str = "nefi-requests";
const INDEX_DEPENDENCIES: &str = "nefi-dependencies";
const INDEX_METRICS: &str = "nefi-metrics";

const DEFAULT_EVENT_LIMIT: usize = 100;
const DEPENDENCY_LIMIT: usize = 10_000;
const METRIC_LIMIT: usize = 10_000;
const AGG_TERMS_SIZE: usize = 10_000;

#[derive(Default)]
struct BulkBuffer {
    body: String,
    pending: usize,
}

/// Elasticsearch-backed storage client.
pub struct EsClient {
    http: reqwest::Client,
    addresses: Vec<String>,
    next_addr: AtomicUsize,
    cfg: StorageConfig,
    buffer: Mutex<BulkBuffer>,
    metrics: Option<Arc<ServerMetrics>>,
    flush_task: Mutex<Option<(CancellationToken, tokio::task::JoinHandle<()>)>>,
}

impl EsClient {
    pub fn new(
        addresses: Vec<String>,
        cfg: StorageConfig,
        metrics: Option<Arc<ServerMetrics>>,
    ) -> StorageResult<Arc<Self>> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        Ok(Arc::new(Self {
            http,
            addresses: addresses
                .into_iter()
                .map(|a| a.trim_end_matches('/').to_string())
                .collect(),
            next_addr: AtomicUsize::new(0),
            cfg,
            buffer: Mutex::new(BulkBuffer::default()),
            metrics,
            flush_task: Mutex::new(None),
        }))
    }

    /// Spawn the periodic bulk flush loop.
    pub fn start(self: &Arc<Self>) {
        let client = Arc::clone(self);
        let cancel = CancellationToken::new();
        let loop_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(client.cfg.flush_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = loop_cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        if let Err(e) = client.flush().await {
                            error!(error = %e, "periodic bulk flush failed");
                        }
                    }
                }
            }
        });

        *self.flush_task.lock() = Some((cancel, task));
    }

    /// Stop the flush loop and write out anything still buffered.
    pub async fn close(&self) -> StorageResult<()> {
        let task = self.flush_task.lock().take();
        if let Some((cancel, task)) = task {
            cancel.cancel();
            let _ = task.await;
        }
        self.flush().await
    }

    fn addr(&self) -> &str {
        let i = self.next_addr.load(Ordering::Relaxed) % self.addresses.len();
        &self.addresses[i]
    }

    fn rotate_addr(&self) {
        if self.addresses.len() > 1 {
            self.next_addr.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Install the index templates. Failures are reported to the caller,
    /// who treats them as non-fatal (the store may simply not be up yet).
    pub async fn ensure_indices(&self) -> StorageResult<()> {
        for (name, body) in index_templates() {
            let url = format!("{}/_index_template/{name}", self.addr());
            let response = self.http.put(&url).json(&body).send().await?;
            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(StorageError::Status {
                    status: status.as_u16(),
                    body,
                });
            }
            info!(template = name, "created index template");
        }
        Ok(())
    }

    /// Append one bulk index action; flush when the batch size is hit.
    async fn add_bulk_action<T: Serialize>(&self, index: &str, doc: &T) -> StorageResult<()> {
        let data = serde_json::to_string(doc)?;

        let should_flush = {
            let mut buffer = self.buffer.lock();
            buffer.body.push_str(&format!("{{\"index\":{{\"_index\":\"{index}\"}}}}\n"));
            buffer.body.push_str(&data);
            buffer.body.push('\n');
            buffer.pending += 1;
            buffer.pending >= self.cfg.batch_size
        };

        if should_flush {
            self.flush().await?;
        }
        Ok(())
    }

    /// Send the current bulk buffer.
    pub async fn flush(&self) -> StorageResult<()> {
        let (body, count) = {
            let mut buffer = self.buffer.lock();
            if buffer.pending == 0 {
                return Ok(());
            }
            let body = std::mem::take(&mut buffer.body);
            let count = std::mem::replace(&mut buffer.pending, 0);
            (body, count)
        };

        let url = format!("{}/_bulk", self.addr());
        let result = self
            .http
            .post(&url)
            .header("Content-Type", "application/x-ndjson")
            .body(body)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) => {
                self.rotate_addr();
                if let Some(metrics) = &self.metrics {
                    metrics.storage_bulk_errors.inc();
                }
                return Err(e.into());
            }
        };

        let status = response.status();
        if !status.is_success() {
            if let Some(metrics) = &self.metrics {
                metrics.storage_bulk_errors.inc();
            }
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status {
                status: status.as_u16(),
                body,
            });
        }

        if let Some(metrics) = &self.metrics {
            metrics.storage_bulk_flushes.inc();
        }
        debug!(documents = count, "flushed bulk buffer");
        Ok(())
    }

    async fn search(&self, index_pattern: &str, body: &Value) -> StorageResult<Value> {
        let url = format!("{}/{index_pattern}/_search", self.addr());
        let response = self.http.post(&url).json(body).send().await.map_err(|e| {
            self.rotate_addr();
            StorageError::from(e)
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(StorageError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json().await?)
    }

    fn decode_hits<T: serde::de::DeserializeOwned>(result: &Value, what: &str) -> Vec<T> {
        let hits = result
            .pointer("/hits/hits")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        let mut docs = Vec::with_capacity(hits.len());
        for hit in hits {
            let Some(source) = hit.get("_source") else {
                continue;
            };
            match serde_json::from_value::<T>(source.clone()) {
                Ok(doc) => docs.push(doc),
                Err(e) => warn!(what, error = %e, "failed to decode stored document"),
            }
        }
        docs
    }

    fn agg_keys(result: &Value, agg: &str) -> Vec<String> {
        result
            .pointer(&format!("/aggregations/{agg}/buckets"))
            .and_then(Value::as_array)
            .map(|buckets| {
                buckets
                    .iter()
                    .filter_map(|b| b.get("key").and_then(Value::as_str))
                    .filter(|k| !k.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Index naming and query builders
// ---------------------------------------------------------------------------

fn index_name(prefix: &str, ts: DateTime<Utc>) -> String {
    format!("{prefix}-{}", ts.format("%Y-%m-%d"))
}

fn index_pattern(prefix: &str) -> String {
    format!("{prefix}-*")
}

fn rfc3339_nanos(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn time_range_filter(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<Value> {
    if start.is_none() && end.is_none() {
        return None;
    }
    let mut range = serde_json::Map::new();
    if let Some(start) = start {
        range.insert("gte".to_string(), Value::String(rfc3339_nanos(start)));
    }
    if let Some(end) = end {
        range.insert("lte".to_string(), Value::String(rfc3339_nanos(end)));
    }
    Some(json!({ "range": { "timestamp": Value::Object(range) } }))
}

/// OR-match over source and destination for a field pair.
fn either_side_term(field: &str, value: &str) -> Value {
    json!({
        "bool": {
            "should": [
                { "term": { (format!("source.{field}")): value } },
                { "term": { (format!("destination.{field}")): value } },
            ],
            "minimum_should_match": 1,
        }
    })
}

fn filtered_query(filters: Vec<Value>) -> Value {
    if filters.is_empty() {
        json!({ "match_all": {} })
    } else {
        json!({ "bool": { "filter": filters } })
    }
}

/// Query body for event searches: time range plus service filters, sorted
/// by descending timestamp.
pub(crate) fn build_event_query(query: &EventQuery) -> Value {
    let mut filters = Vec::new();
    if let Some(range) = time_range_filter(query.start_time, query.end_time) {
        filters.push(range);
    }
    if !query.service.is_empty() {
        filters.push(either_side_term("service", &query.service));
    }
    if !query.namespace.is_empty() {
        filters.push(either_side_term("namespace", &query.namespace));
    }
    if !query.source.is_empty() {
        filters.push(json!({ "term": { "source.service": query.source } }));
    }
    if !query.destination.is_empty() {
        filters.push(json!({ "term": { "destination.service": query.destination } }));
    }

    let limit = if query.limit == 0 {
        DEFAULT_EVENT_LIMIT
    } else {
        query.limit
    };

    json!({
        "query": filtered_query(filters),
        "size": limit,
        "sort": [{ "timestamp": { "order": "desc" } }],
    })
}

pub(crate) fn build_dependency_query(query: &DependencyQuery) -> Value {
    let mut filters = Vec::new();
    if let Some(range) = time_range_filter(query.start_time, query.end_time) {
        filters.push(range);
    }
    if !query.service.is_empty() {
        filters.push(json!({
            "bool": {
                "should": [
                    { "term": { "parent": query.service } },
                    { "term": { "child": query.service } },
                ],
                "minimum_should_match": 1,
            }
        }));
    }

    json!({
        "query": filtered_query(filters),
        "size": DEPENDENCY_LIMIT,
    })
}

pub(crate) fn build_metric_query(kind: MetricKind, query: &MetricQuery) -> Value {
    let mut filters = vec![json!({ "term": { "metricType": kind.as_str() } })];
    if let Some(range) = time_range_filter(query.start_time, query.end_time) {
        filters.push(range);
    }
    if !query.service.is_empty() {
        filters.push(json!({ "term": { "labels.service": query.service } }));
    }
    if !query.namespace.is_empty() {
        filters.push(json!({ "term": { "labels.namespace": query.namespace } }));
    }

    json!({
        "query": { "bool": { "filter": filters } },
        "size": METRIC_LIMIT,
        "sort": [{ "timestamp": { "order": "asc" } }],
    })
}

fn index_templates() -> Vec<(&'static str, Value)> {
    let endpoint_properties = json!({
        "properties": {
            "ip": { "type": "ip" },
            "port": { "type": "integer" },
            "pod": { "type": "keyword" },
            "namespace": { "type": "keyword" },
            "workload": { "type": "keyword" },
            "workloadKind": { "type": "keyword" },
            "service": { "type": "keyword" },
        }
    });

    vec![
        (
            INDEX_CONNECTIONS,
            json!({
                "index_patterns": [index_pattern(INDEX_CONNECTIONS)],
                "template": {
                    "settings": { "number_of_shards": 1, "number_of_replicas": 1 },
                    "mappings": {
                        "properties": {
                            "timestamp": { "type": "date" },
                            "node": { "type": "keyword" },
                            "source": endpoint_properties.clone(),
                            "destination": endpoint_properties.clone(),
                            "bytesSent": { "type": "long" },
                            "bytesRecv": { "type": "long" },
                            "durationNs": { "type": "long" },
                            "retransmits": { "type": "integer" },
                            "protocol": { "type": "keyword" },
                        }
                    }
                }
            }),
        ),
        (
            INDEX_REQUESTS,
            json!({
                "index_patterns": [index_pattern(INDEX_REQUESTS)],
                "template": {
                    "settings": { "number_of_shards": 1, "number_of_replicas": 1 },
                    "mappings": {
                        "properties": {
                            "timestamp": { "type": "date" },
                            "node": { "type": "keyword" },
                            "source": endpoint_properties.clone(),
                            "destination": endpoint_properties,
                            "method": { "type": "keyword" },
                            "path": { "type": "keyword" },
                            "statusCode": { "type": "integer" },
                            "latencyNs": { "type": "long" },
                            "protocol": { "type": "keyword" },
                        }
                    }
                }
            }),
        ),
        (
            INDEX_DEPENDENCIES,
            json!({
                "index_patterns": [index_pattern(INDEX_DEPENDENCIES)],
                "template": {
                    "settings": { "number_of_shards": 1, "number_of_replicas": 1 },
                    "mappings": {
                        "properties": {
                            "parent": { "type": "keyword" },
                            "child": { "type": "keyword" },
                            "callCount": { "type": "long" },
                            "errorCount": { "type": "long" },
                            "p99LatencyNs": { "type": "long" },
                            "timestamp": { "type": "date" },
                        }
                    }
                }
            }),
        ),
        (
            INDEX_METRICS,
            json!({
                "index_patterns": [index_pattern(INDEX_METRICS)],
                "template": {
                    "settings": { "number_of_shards": 1, "number_of_replicas": 1 },
                    "mappings": {
                        "properties": {
                            "timestamp": { "type": "date" },
                            "value": { "type": "double" },
                            "labels": { "type": "object", "enabled": true },
                            "metricType": { "type": "keyword" },
                        }
                    }
                }
            }),
        ),
    ]
}

// ---------------------------------------------------------------------------
// Stored document shapes
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct DependencyDoc<'a> {
    #[serde(flatten)]
    link: &'a DependencyLink,
    timestamp: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetricDoc<'a> {
    #[serde(flatten)]
    point: &'a TimeSeriesPoint,
    metric_type: &'static str,
}

// ---------------------------------------------------------------------------
// Capability implementations
// ---------------------------------------------------------------------------

#[async_trait]
impl EventWriter for EsClient {
    async fn write_connections(&self, events: &[ConnectionEvent]) -> StorageResult<()> {
        for event in events {
            let index = index_name(INDEX_CONNECTIONS, event.timestamp);
            self.add_bulk_action(&index, event).await?;
        }
        Ok(())
    }

    async fn write_requests(&self, events: &[RequestEvent]) -> StorageResult<()> {
        for event in events {
            let index = index_name(INDEX_REQUESTS, event.timestamp);
            self.add_bulk_action(&index, event).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl EventReader for EsClient {
    async fn find_connections(&self, query: &EventQuery) -> StorageResult<Vec<ConnectionEvent>> {
        let body = build_event_query(query);
        let result = self.search(&index_pattern(INDEX_CONNECTIONS), &body).await?;
        Ok(Self::decode_hits(&result, "connection event"))
    }

    async fn find_requests(&self, query: &EventQuery) -> StorageResult<Vec<RequestEvent>> {
        let body = build_event_query(query);
        let result = self.search(&index_pattern(INDEX_REQUESTS), &body).await?;
        Ok(Self::decode_hits(&result, "request event"))
    }
}

#[async_trait]
impl DependencyWriter for EsClient {
    async fn write_dependencies(&self, links: &[DependencyLink]) -> StorageResult<()> {
        let now = Utc::now();
        let index = index_name(INDEX_DEPENDENCIES, now);
        let timestamp = rfc3339_nanos(now);

        for link in links {
            let doc = DependencyDoc {
                link,
                timestamp: timestamp.clone(),
            };
            self.add_bulk_action(&index, &doc).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl DependencyReader for EsClient {
    async fn get_dependencies(&self, query: &DependencyQuery) -> StorageResult<Vec<DependencyLink>> {
        let body = build_dependency_query(query);
        let result = self
            .search(&index_pattern(INDEX_DEPENDENCIES), &body)
            .await?;
        Ok(Self::decode_hits(&result, "dependency link"))
    }
}

#[async_trait]
impl MetricWriter for EsClient {
    async fn write_metrics(
        &self,
        points: &[TimeSeriesPoint],
        kind: MetricKind,
    ) -> StorageResult<()> {
        for point in points {
            let index = index_name(INDEX_METRICS, point.timestamp);
            let doc = MetricDoc {
                point,
                metric_type: kind.as_str(),
            };
            self.add_bulk_action(&index, &doc).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl MetricReader for EsClient {
    async fn get_latencies(&self, query: &MetricQuery) -> StorageResult<Vec<TimeSeriesPoint>> {
        self.query_metrics(MetricKind::Latency, query).await
    }

    async fn get_call_rates(&self, query: &MetricQuery) -> StorageResult<Vec<TimeSeriesPoint>> {
        self.query_metrics(MetricKind::CallRate, query).await
    }

    async fn get_error_rates(&self, query: &MetricQuery) -> StorageResult<Vec<TimeSeriesPoint>> {
        self.query_metrics(MetricKind::ErrorRate, query).await
    }
}

impl EsClient {
    async fn query_metrics(
        &self,
        kind: MetricKind,
        query: &MetricQuery,
    ) -> StorageResult<Vec<TimeSeriesPoint>> {
        let body = build_metric_query(kind, query);
        let result = self.search(&index_pattern(INDEX_METRICS), &body).await?;
        Ok(Self::decode_hits(&result, "metric point"))
    }
}

#[async_trait]
impl ServiceReader for EsClient {
    async fn list_services(&self) -> StorageResult<BTreeSet<String>> {
        let body = json!({
            "size": 0,
            "aggs": {
                "services": {
                    "terms": { "field": "source.service", "size": AGG_TERMS_SIZE }
                },
                "dst_services": {
                    "terms": { "field": "destination.service", "size": AGG_TERMS_SIZE }
                },
            }
        });

        let indices = format!(
            "{},{}",
            index_pattern(INDEX_CONNECTIONS),
            index_pattern(INDEX_REQUESTS)
        );
        let result = self.search(&indices, &body).await?;

        let mut services: BTreeSet<String> = Self::agg_keys(&result, "services").into_iter().collect();
        services.extend(Self::agg_keys(&result, "dst_services"));
        Ok(services)
    }

    async fn list_operations(&self, service: &str) -> StorageResult<BTreeSet<String>> {
        let body = json!({
            "size": 0,
            "query": either_side_term("service", service),
            "aggs": {
                "operations": {
                    "terms": { "field": "path", "size": AGG_TERMS_SIZE }
                },
            }
        });

        let result = self.search(&index_pattern(INDEX_REQUESTS), &body).await?;
        Ok(Self::agg_keys(&result, "operations").into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_index_name_is_date_suffixed() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 7, 23, 59, 59).unwrap();
        assert_eq!(index_name(INDEX_CONNECTIONS, ts), "nefi-connections-2024-03-07");
        assert_eq!(index_pattern(INDEX_METRICS), "nefi-metrics-*");
    }

    #[test]
    fn test_event_query_defaults() {
        let body = build_event_query(&EventQuery::default());
        assert_eq!(body["size"], DEFAULT_EVENT_LIMIT);
        assert!(body["query"]["match_all"].is_object());
        assert_eq!(body["sort"][0]["timestamp"]["order"], "desc");
    }

    #[test]
    fn test_event_query_service_matches_either_side() {
        let query = EventQuery {
            service: "api".to_string(),
            limit: 7,
            ..Default::default()
        };
        let body = build_event_query(&query);
        assert_eq!(body["size"], 7);

        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters.len(), 1);
        let should = filters[0]["bool"]["should"].as_array().unwrap();
        assert_eq!(should[0]["term"]["source.service"], "api");
        assert_eq!(should[1]["term"]["destination.service"], "api");
        assert_eq!(filters[0]["bool"]["minimum_should_match"], 1);
    }

    #[test]
    fn test_event_query_time_range_rfc3339_nanos() {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::nanoseconds(123_456_789);
        let query = EventQuery {
            start_time: Some(start),
            ..Default::default()
        };
        let body = build_event_query(&query);
        let gte = body["query"]["bool"]["filter"][0]["range"]["timestamp"]["gte"]
            .as_str()
            .unwrap();
        assert_eq!(gte, "2024-01-01T00:00:00.123456789Z");
    }

    #[test]
    fn test_event_query_pinned_sides() {
        let query = EventQuery {
            source: "web".to_string(),
            destination: "api".to_string(),
            ..Default::default()
        };
        let body = build_event_query(&query);
        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters[0]["term"]["source.service"], "web");
        assert_eq!(filters[1]["term"]["destination.service"], "api");
    }

    #[test]
    fn test_dependency_query_matches_parent_or_child() {
        let query = DependencyQuery {
            service: "api".to_string(),
            ..Default::default()
        };
        let body = build_dependency_query(&query);
        assert_eq!(body["size"], DEPENDENCY_LIMIT);
        let should = body["query"]["bool"]["filter"][0]["bool"]["should"]
            .as_array()
            .unwrap();
        assert_eq!(should[0]["term"]["parent"], "api");
        assert_eq!(should[1]["term"]["child"], "api");
    }

    #[test]
    fn test_metric_query_filters_kind_and_sorts_ascending() {
        let body = build_metric_query(MetricKind::ErrorRate, &MetricQuery::default());
        let filters = body["query"]["bool"]["filter"].as_array().unwrap();
        assert_eq!(filters[0]["term"]["metricType"], "error_rate");
        assert_eq!(body["sort"][0]["timestamp"]["order"], "asc");
        assert_eq!(body["size"], METRIC_LIMIT);
    }

    #[test]
    fn test_dependency_doc_shape() {
        let link = DependencyLink {
            parent: "a".to_string(),
            child: "b".to_string(),
            call_count: 10,
            error_count: 1,
            p99_latency_ns: 99,
        };
        let doc = DependencyDoc {
            link: &link,
            timestamp: "2024-01-01T00:00:00.000000000Z".to_string(),
        };
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["parent"], "a");
        assert_eq!(value["callCount"], 10);
        assert_eq!(value["p99LatencyNs"], 99);
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_metric_doc_shape() {
        let point = TimeSeriesPoint {
            timestamp: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            value: 0.25,
            labels: [("service".to_string(), "api".to_string())]
                .into_iter()
                .collect(),
        };
        let doc = MetricDoc {
            point: &point,
            metric_type: MetricKind::Latency.as_str(),
        };
        let value = serde_json::to_value(&doc).unwrap();
        assert_eq!(value["metricType"], "latency");
        assert_eq!(value["value"], 0.25);
        assert_eq!(value["labels"]["service"], "api");
    }

    #[test]
    fn test_decode_hits_skips_bad_documents() {
        let result = json!({
            "hits": { "hits": [
                { "_source": { "parent": "a", "child": "b", "callCount": 1,
                               "errorCount": 0, "p99LatencyNs": 5 } },
                { "_source": { "parent": 42 } },
            ]}
        });
        let links: Vec<DependencyLink> = EsClient::decode_hits(&result, "dependency link");
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].parent, "a");
    }

    #[test]
    fn test_agg_keys_drops_empty() {
        let result = json!({
            "aggregations": {
                "services": { "buckets": [
                    { "key": "api", "doc_count": 3 },
                    { "key": "", "doc_count": 1 },
                ]}
            }
        });
        assert_eq!(EsClient::agg_keys(&result, "services"), vec!["api"]);
    }
}
