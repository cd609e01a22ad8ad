//! In-memory per-service metric aggregation.
//!
//! Each service accumulates a fixed-bucket latency histogram plus call,
//! error and traffic counters. A periodic flush swaps the whole map out
//! in one handoff, computes percentile/rate/traffic points from the
//! detached snapshot, and writes them to storage. State resets on every
//! flush, giving tumbling-window semantics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::health::ServerMetrics;
use crate::model::{ConnectionEvent, MetricKind, MetricWriter, RequestEvent, TimeSeriesPoint};

/// Latency histogram bucket upper bounds in nanoseconds:
/// 1ms, 5ms, 10ms, 25ms, 50ms, 100ms, 250ms, 500ms, 1s, 2.5s, 5s, 10s.
/// Observations above the last bound land in an overflow bucket.
pub const BUCKET_BOUNDARIES: [f64; 12] = [
    1e6, 5e6, 1e7, 2.5e7, 5e7, 1e8, 2.5e8, 5e8, 1e9, 2.5e9, 5e9, 1e10,
];

/// Bucket count including the overflow bucket.
pub const NUM_BUCKETS: usize = BUCKET_BOUNDARIES.len() + 1;

/// Per-service accumulator for one flush window.
#[derive(Debug, Clone)]
pub struct ServiceAccumulator {
    namespace: String,
    bucket_counts: [u64; NUM_BUCKETS],
    latency_sum: f64,
    call_count: u64,
    error_count: u64,
    bytes_sent: u64,
    bytes_recv: u64,
    last_observed: DateTime<Utc>,
}

impl ServiceAccumulator {
    fn new(namespace: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            bucket_counts: [0; NUM_BUCKETS],
            latency_sum: 0.0,
            call_count: 0,
            error_count: 0,
            bytes_sent: 0,
            bytes_recv: 0,
            last_observed: Utc::now(),
        }
    }

    fn observe_latency(&mut self, latency_ns: f64) {
        self.latency_sum += latency_ns;
        self.bucket_counts[bucket_index(latency_ns)] += 1;
    }

    /// Total latency observations in this window.
    pub fn total_observations(&self) -> u64 {
        self.bucket_counts.iter().sum()
    }

    pub fn call_count(&self) -> u64 {
        self.call_count
    }

    pub fn error_count(&self) -> u64 {
        self.error_count
    }
}

/// Index of the smallest boundary that holds `value_ns`, or the overflow
/// bucket. Monotonic in the observed latency.
pub fn bucket_index(value_ns: f64) -> usize {
    for (i, boundary) in BUCKET_BOUNDARIES.iter().enumerate() {
        if value_ns <= *boundary {
            return i;
        }
    }
    BUCKET_BOUNDARIES.len()
}

/// Estimate a quantile from histogram counts by linear interpolation
/// within the target bucket. The overflow bucket is treated as extending
/// to twice the last boundary; an empty target bucket reports its lower
/// bound.
pub fn histogram_percentile(counts: &[u64; NUM_BUCKETS], total: u64, quantile: f64) -> f64 {
    let target = quantile * total as f64;
    let mut cumulative = 0.0;

    for (i, &count) in counts.iter().enumerate() {
        cumulative += count as f64;
        if cumulative >= target {
            let lower = if i == 0 { 0.0 } else { BUCKET_BOUNDARIES[i - 1] };
            let upper = if i < BUCKET_BOUNDARIES.len() {
                BUCKET_BOUNDARIES[i]
            } else {
                BUCKET_BOUNDARIES[BUCKET_BOUNDARIES.len() - 1] * 2.0
            };

            if count == 0 {
                return lower;
            }
            let prev_cumulative = cumulative - count as f64;
            let fraction = (target - prev_cumulative) / count as f64;
            return lower + fraction * (upper - lower);
        }
    }

    // Unreachable for total > 0.
    BUCKET_BOUNDARIES[BUCKET_BOUNDARIES.len() - 1]
}

/// Aggregates events into per-service windows and flushes summary points.
pub struct Aggregator {
    writer: Arc<dyn MetricWriter>,
    flush_interval: Duration,
    services: Mutex<HashMap<String, ServiceAccumulator>>,
    metrics: Option<Arc<ServerMetrics>>,
}

impl Aggregator {
    pub fn new(
        writer: Arc<dyn MetricWriter>,
        flush_interval: Duration,
        metrics: Option<Arc<ServerMetrics>>,
    ) -> Self {
        Self {
            writer,
            flush_interval,
            services: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    /// Record an L4 connection. The bound service is the source's, or the
    /// destination's as a fallback; events with no service are dropped.
    pub fn observe_connection(&self, ev: &ConnectionEvent) {
        let (service, namespace) = if !ev.source.service.is_empty() {
            (&ev.source.service, &ev.source.namespace)
        } else if !ev.destination.service.is_empty() {
            (&ev.destination.service, &ev.destination.namespace)
        } else {
            return;
        };

        let mut services = self.services.lock();
        let acc = services
            .entry(service.clone())
            .or_insert_with(|| ServiceAccumulator::new(namespace));
        acc.call_count += 1;
        acc.bytes_sent += ev.bytes_sent;
        acc.bytes_recv += ev.bytes_recv;
        acc.last_observed = Utc::now();

        // Connection duration stands in for latency.
        if ev.duration_ns > 0 {
            acc.observe_latency(ev.duration_ns as f64);
        }
    }

    /// Record an L7 request. The bound service is the destination's, or
    /// the source's as a fallback; status >= 500 counts as an error.
    pub fn observe_request(&self, ev: &RequestEvent) {
        let (service, namespace) = if !ev.destination.service.is_empty() {
            (&ev.destination.service, &ev.destination.namespace)
        } else if !ev.source.service.is_empty() {
            (&ev.source.service, &ev.source.namespace)
        } else {
            return;
        };

        let mut services = self.services.lock();
        let acc = services
            .entry(service.clone())
            .or_insert_with(|| ServiceAccumulator::new(namespace));
        acc.call_count += 1;
        if ev.status_code >= 500 {
            acc.error_count += 1;
        }
        acc.last_observed = Utc::now();

        if ev.latency_ns > 0 {
            acc.observe_latency(ev.latency_ns as f64);
        }
    }

    /// Swap the window out and write its summary points. Write errors are
    /// logged; the next window starts clean regardless.
    pub async fn flush(&self) {
        let snapshot = {
            let mut services = self.services.lock();
            std::mem::take(&mut *services)
        };

        if let Some(metrics) = &self.metrics {
            metrics.aggregator_flushes.inc();
            metrics.aggregator_services.set(snapshot.len() as f64);
        }
        if snapshot.is_empty() {
            return;
        }

        let now = Utc::now();
        let points = build_points(&snapshot, now);

        for (kind, points) in [
            (MetricKind::Latency, &points.latency),
            (MetricKind::CallRate, &points.call_rate),
            (MetricKind::ErrorRate, &points.error_rate),
            (MetricKind::Traffic, &points.traffic),
        ] {
            if points.is_empty() {
                continue;
            }
            if let Err(e) = self.writer.write_metrics(points, kind).await {
                error!(kind = %kind, error = %e, "failed to write metric points");
            }
        }

        debug!(
            services = snapshot.len(),
            latency_points = points.latency.len(),
            "flushed aggregated metrics",
        );
    }

    /// Periodic flush loop; one final flush runs on cancellation.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so the first window
        // spans a full interval.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.flush().await;
                    return;
                }
                _ = ticker.tick() => self.flush().await,
            }
        }
    }

    /// Snapshot of a service's accumulator, for diagnostics and tests.
    pub fn service_snapshot(&self, service: &str) -> Option<ServiceAccumulator> {
        self.services.lock().get(service).cloned()
    }
}

struct FlushPoints {
    latency: Vec<TimeSeriesPoint>,
    call_rate: Vec<TimeSeriesPoint>,
    error_rate: Vec<TimeSeriesPoint>,
    traffic: Vec<TimeSeriesPoint>,
}

fn build_points(snapshot: &HashMap<String, ServiceAccumulator>, now: DateTime<Utc>) -> FlushPoints {
    let mut points = FlushPoints {
        latency: Vec::new(),
        call_rate: Vec::new(),
        error_rate: Vec::new(),
        traffic: Vec::new(),
    };

    for (service, acc) in snapshot {
        let base = |extra: Option<(&str, &str)>| {
            let mut labels = std::collections::BTreeMap::new();
            labels.insert("service".to_string(), service.clone());
            labels.insert("namespace".to_string(), acc.namespace.clone());
            if let Some((k, v)) = extra {
                labels.insert(k.to_string(), v.to_string());
            }
            labels
        };

        let total = acc.total_observations();
        if total > 0 {
            for (quantile, label) in [(0.50, "0.5"), (0.95, "0.95"), (0.99, "0.99")] {
                points.latency.push(TimeSeriesPoint {
                    timestamp: now,
                    value: histogram_percentile(&acc.bucket_counts, total, quantile),
                    labels: base(Some(("quantile", label))),
                });
            }
        }

        points.call_rate.push(TimeSeriesPoint {
            timestamp: now,
            value: acc.call_count as f64,
            labels: base(None),
        });

        let error_rate = if acc.call_count > 0 {
            acc.error_count as f64 / acc.call_count as f64
        } else {
            0.0
        };
        points.error_rate.push(TimeSeriesPoint {
            timestamp: now,
            value: error_rate,
            labels: base(None),
        });

        points.traffic.push(TimeSeriesPoint {
            timestamp: now,
            value: acc.bytes_sent as f64,
            labels: base(Some(("direction", "sent"))),
        });
        points.traffic.push(TimeSeriesPoint {
            timestamp: now,
            value: acc.bytes_recv as f64,
            labels: base(Some(("direction", "recv"))),
        });
    }

    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, HttpMethod, Protocol, StorageResult};
    use async_trait::async_trait;
    use parking_lot::Mutex as PlMutex;

    /// Metric writer that records everything it is given.
    #[derive(Default)]
    struct CapturingWriter {
        written: PlMutex<Vec<(MetricKind, Vec<TimeSeriesPoint>)>>,
    }

    #[async_trait]
    impl MetricWriter for CapturingWriter {
        async fn write_metrics(
            &self,
            points: &[TimeSeriesPoint],
            kind: MetricKind,
        ) -> StorageResult<()> {
            self.written.lock().push((kind, points.to_vec()));
            Ok(())
        }
    }

    fn service_endpoint(service: &str) -> Endpoint {
        Endpoint {
            ip: "10.0.0.1".to_string(),
            port: 80,
            namespace: "default".to_string(),
            service: service.to_string(),
            ..Default::default()
        }
    }

    fn connection(src_service: &str, dst_service: &str, duration_ns: u64) -> ConnectionEvent {
        ConnectionEvent {
            timestamp: Utc::now(),
            node: "n1".to_string(),
            source: service_endpoint(src_service),
            destination: service_endpoint(dst_service),
            bytes_sent: 100,
            bytes_recv: 200,
            duration_ns,
            retransmits: 0,
            protocol: Protocol::Tcp,
        }
    }

    fn request(dst_service: &str, status: u16, latency_ns: u64) -> RequestEvent {
        RequestEvent {
            timestamp: Utc::now(),
            node: "n1".to_string(),
            source: service_endpoint(""),
            destination: service_endpoint(dst_service),
            method: HttpMethod::Get,
            path: "/".to_string(),
            status_code: status,
            latency_ns,
            protocol: "HTTP".to_string(),
        }
    }

    fn aggregator() -> (Aggregator, Arc<CapturingWriter>) {
        let writer = Arc::new(CapturingWriter::default());
        let agg = Aggregator::new(writer.clone(), Duration::from_secs(30), None);
        (agg, writer)
    }

    fn points_of(writer: &CapturingWriter, kind: MetricKind) -> Vec<TimeSeriesPoint> {
        writer
            .written
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .flat_map(|(_, p)| p.clone())
            .collect()
    }

    fn point_value(points: &[TimeSeriesPoint], quantile: &str) -> f64 {
        points
            .iter()
            .find(|p| p.labels.get("quantile").map(String::as_str) == Some(quantile))
            .map(|p| p.value)
            .unwrap_or(f64::NAN)
    }

    #[test]
    fn test_bucket_index_monotonic() {
        let samples = [0.5e6, 1e6, 3e6, 1e7, 9e7, 1e9, 9.9e9, 1e10, 5e10];
        let mut last = 0;
        for s in samples {
            let idx = bucket_index(s);
            assert!(idx >= last, "bucket index must be monotonic at {s}");
            last = idx;
        }
        assert_eq!(bucket_index(1e6), 0);
        assert_eq!(bucket_index(1e6 + 1.0), 1);
        assert_eq!(bucket_index(1e10), BUCKET_BOUNDARIES.len() - 1);
        assert_eq!(bucket_index(1e10 + 1.0), BUCKET_BOUNDARIES.len());
    }

    #[test]
    fn test_histogram_sum_conservation() {
        let (agg, _) = aggregator();
        for latency in [2e6 as u64, 4_000_000, 8_000_000, 40_000_000, 3_000_000_000] {
            agg.observe_request(&request("api", 200, latency));
        }
        let acc = agg.service_snapshot("api").unwrap();
        assert_eq!(acc.total_observations(), 5);
        assert_eq!(acc.call_count(), 5);
    }

    #[test]
    fn test_percentile_monotonic_and_bounded() {
        let mut counts = [0u64; NUM_BUCKETS];
        for latency in [1.5e6, 4e6, 8e6, 2e7, 6e7, 3e8, 9e8, 4e9, 2e10] {
            counts[bucket_index(latency)] += 1;
        }
        let total: u64 = counts.iter().sum();

        let mut last = 0.0;
        for q in [0.01, 0.1, 0.25, 0.5, 0.75, 0.9, 0.95, 0.99, 1.0] {
            let p = histogram_percentile(&counts, total, q);
            assert!(p >= last, "percentile must be monotonic in q");
            assert!(p >= 0.0 && p <= 2.0 * 1e10);
            last = p;
        }
    }

    #[test]
    fn test_percentile_empty_bucket_returns_lower_bound() {
        let mut counts = [0u64; NUM_BUCKETS];
        counts[0] = 0;
        counts[1] = 1;
        // q=0 -> target 0, first bucket reached with zero count.
        assert_eq!(histogram_percentile(&counts, 1, 0.0), 0.0);
    }

    #[tokio::test]
    async fn test_flush_emits_expected_points() {
        // Latencies spread across the bucket range for service "api".
        let latencies: [u64; 10] = [
            2_000_000,
            4_000_000,
            8_000_000,
            15_000_000,
            40_000_000,
            90_000_000,
            200_000_000,
            400_000_000,
            900_000_000,
            3_000_000_000,
        ];

        let (agg, writer) = aggregator();
        for latency in latencies {
            agg.observe_request(&request("api", 200, latency));
        }
        agg.flush().await;

        let latency = points_of(&writer, MetricKind::Latency);
        assert_eq!(latency.len(), 3);
        let p50 = point_value(&latency, "0.5");
        let p95 = point_value(&latency, "0.95");
        let p99 = point_value(&latency, "0.99");
        assert!((1e7..=2.5e7).contains(&p50), "p50 = {p50}");
        assert!((5e8..=1e9).contains(&p95), "p95 = {p95}");
        assert!((1e9..=5e9).contains(&p99), "p99 = {p99}");

        let calls = points_of(&writer, MetricKind::CallRate);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].value, 10.0);
        assert_eq!(calls[0].labels.get("service").unwrap(), "api");

        let errors = points_of(&writer, MetricKind::ErrorRate);
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].value, 0.0);
    }

    #[tokio::test]
    async fn test_flush_resets_window() {
        let (agg, writer) = aggregator();
        agg.observe_request(&request("api", 200, 1_000_000));
        agg.flush().await;
        assert!(agg.service_snapshot("api").is_none());

        // Second flush with no observations writes nothing new.
        let writes_before = writer.written.lock().len();
        agg.flush().await;
        assert_eq!(writer.written.lock().len(), writes_before);
    }

    #[tokio::test]
    async fn test_connection_observation_rules() {
        let (agg, writer) = aggregator();

        // Bound to the source service.
        agg.observe_connection(&connection("web", "api", 5_000_000));
        // Source empty: falls back to destination.
        agg.observe_connection(&connection("", "api", 5_000_000));
        // Both empty: dropped.
        agg.observe_connection(&connection("", "", 5_000_000));
        // Zero duration: counted, not observed as latency.
        agg.observe_connection(&connection("web", "", 0));

        let web = agg.service_snapshot("web").unwrap();
        assert_eq!(web.call_count(), 2);
        assert_eq!(web.total_observations(), 1);
        assert_eq!(web.bytes_sent, 200);
        assert_eq!(web.bytes_recv, 400);

        let api = agg.service_snapshot("api").unwrap();
        assert_eq!(api.call_count(), 1);

        agg.flush().await;
        let traffic = points_of(&writer, MetricKind::Traffic);
        // Two services, two directions each.
        assert_eq!(traffic.len(), 4);
        let web_sent = traffic
            .iter()
            .find(|p| {
                p.labels.get("service").map(String::as_str) == Some("web")
                    && p.labels.get("direction").map(String::as_str) == Some("sent")
            })
            .unwrap();
        assert_eq!(web_sent.value, 200.0);
    }

    #[tokio::test]
    async fn test_request_error_counting() {
        let (agg, writer) = aggregator();
        agg.observe_request(&request("api", 200, 1_000_000));
        agg.observe_request(&request("api", 499, 1_000_000));
        agg.observe_request(&request("api", 500, 1_000_000));
        agg.observe_request(&request("api", 503, 1_000_000));

        let acc = agg.service_snapshot("api").unwrap();
        assert_eq!(acc.call_count(), 4);
        assert_eq!(acc.error_count(), 2);
        assert!(acc.error_count() <= acc.call_count());

        agg.flush().await;
        let errors = points_of(&writer, MetricKind::ErrorRate);
        assert_eq!(errors[0].value, 0.5);
    }
}
