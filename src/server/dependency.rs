//! Service dependency graph computation.
//!
//! Periodically scans a trailing window of stored connection and request
//! events and materialises one directed edge per distinct (parent, child)
//! service pair, with call counts, error counts, and an exact-sort P99.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::health::ServerMetrics;
use crate::model::{
    ConnectionEvent, DependencyLink, DependencyWriter, EventQuery, EventReader, RequestEvent,
};

/// Cap on events read per kind per cycle; the window plus this bound
/// keeps the exact-sort P99 tractable.
const READ_LIMIT: usize = 50_000;

/// Accumulates one directed edge during a computation cycle.
#[derive(Debug, Default)]
struct LinkAccumulator {
    call_count: u64,
    error_count: u64,
    latencies: Vec<u64>,
}

/// Periodic dependency-edge computation over stored events.
pub struct DependencyComputer {
    reader: Arc<dyn EventReader>,
    writer: Arc<dyn DependencyWriter>,
    interval: Duration,
    window: Duration,
    metrics: Option<Arc<ServerMetrics>>,
}

impl DependencyComputer {
    pub fn new(
        reader: Arc<dyn EventReader>,
        writer: Arc<dyn DependencyWriter>,
        interval: Duration,
        window: Duration,
        metrics: Option<Arc<ServerMetrics>>,
    ) -> Self {
        Self {
            reader,
            writer,
            interval,
            window,
            metrics,
        }
    }

    /// Run one computation immediately, then on every interval tick until
    /// cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        self.compute().await;

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => self.compute().await,
            }
        }
    }

    /// Scan the trailing window and write the resulting edges. Read or
    /// write errors log and skip the cycle; the next one starts fresh.
    pub async fn compute(&self) {
        let now = Utc::now();
        let query = EventQuery {
            start_time: Some(now - chrono::Duration::from_std(self.window).unwrap_or_default()),
            end_time: Some(now),
            limit: READ_LIMIT,
            ..Default::default()
        };

        let mut edges: HashMap<(String, String), LinkAccumulator> = HashMap::new();

        match self.reader.find_connections(&query).await {
            Ok(connections) => {
                for ev in &connections {
                    accumulate_connection(&mut edges, ev);
                }
            }
            Err(e) => error!(error = %e, "failed to read connection events"),
        }

        match self.reader.find_requests(&query).await {
            Ok(requests) => {
                for ev in &requests {
                    accumulate_request(&mut edges, ev);
                }
            }
            Err(e) => error!(error = %e, "failed to read request events"),
        }

        let links = build_links(edges);

        if let Some(metrics) = &self.metrics {
            metrics.dependency_cycles.inc();
            metrics.dependency_links.set(links.len() as f64);
        }

        if links.is_empty() {
            debug!("no dependency links computed");
            return;
        }

        if let Err(e) = self.writer.write_dependencies(&links).await {
            error!(error = %e, "failed to write dependency links");
            return;
        }

        info!(count = links.len(), "computed dependency links");
    }
}

fn edge_services<'a>(source: &'a str, destination: &'a str) -> Option<(&'a str, &'a str)> {
    if source.is_empty() || destination.is_empty() || source == destination {
        return None;
    }
    Some((source, destination))
}

fn accumulate_connection(
    edges: &mut HashMap<(String, String), LinkAccumulator>,
    ev: &ConnectionEvent,
) {
    let Some((parent, child)) = edge_services(&ev.source.service, &ev.destination.service) else {
        return;
    };

    let acc = edges
        .entry((parent.to_string(), child.to_string()))
        .or_default();
    acc.call_count += 1;
    // Connection duration stands in for latency.
    if ev.duration_ns > 0 {
        acc.latencies.push(ev.duration_ns);
    }
}

fn accumulate_request(edges: &mut HashMap<(String, String), LinkAccumulator>, ev: &RequestEvent) {
    let Some((parent, child)) = edge_services(&ev.source.service, &ev.destination.service) else {
        return;
    };

    let acc = edges
        .entry((parent.to_string(), child.to_string()))
        .or_default();
    acc.call_count += 1;
    if ev.status_code >= 500 {
        acc.error_count += 1;
    }
    if ev.latency_ns > 0 {
        acc.latencies.push(ev.latency_ns);
    }
}

fn build_links(edges: HashMap<(String, String), LinkAccumulator>) -> Vec<DependencyLink> {
    let mut links: Vec<DependencyLink> = edges
        .into_iter()
        .map(|((parent, child), acc)| DependencyLink {
            parent,
            child,
            call_count: acc.call_count,
            error_count: acc.error_count,
            p99_latency_ns: exact_p99(acc.latencies),
        })
        .collect();
    links.sort_by(|a, b| (&a.parent, &a.child).cmp(&(&b.parent, &b.child)));
    links
}

/// Exact P99 over the collected samples: sort, then take
/// `ceil(0.99 * n) - 1` clamped to the valid range. Empty input is 0.
fn exact_p99(mut latencies: Vec<u64>) -> u64 {
    let n = latencies.len();
    if n == 0 {
        return 0;
    }
    latencies.sort_unstable();

    let idx = ((0.99 * n as f64).ceil() as usize)
        .saturating_sub(1)
        .min(n - 1);
    latencies[idx]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Endpoint, HttpMethod, Protocol};

    fn service_endpoint(service: &str) -> Endpoint {
        Endpoint {
            ip: "10.0.0.1".to_string(),
            port: 80,
            service: service.to_string(),
            ..Default::default()
        }
    }

    fn request(src: &str, dst: &str, status: u16, latency_ns: u64) -> RequestEvent {
        RequestEvent {
            timestamp: Utc::now(),
            node: "n1".to_string(),
            source: service_endpoint(src),
            destination: service_endpoint(dst),
            method: HttpMethod::Get,
            path: "/".to_string(),
            status_code: status,
            latency_ns,
            protocol: "HTTP".to_string(),
        }
    }

    fn connection(src: &str, dst: &str, duration_ns: u64) -> ConnectionEvent {
        ConnectionEvent {
            timestamp: Utc::now(),
            node: "n1".to_string(),
            source: service_endpoint(src),
            destination: service_endpoint(dst),
            bytes_sent: 0,
            bytes_recv: 0,
            duration_ns,
            retransmits: 0,
            protocol: Protocol::Tcp,
        }
    }

    #[test]
    fn test_exact_p99() {
        assert_eq!(exact_p99(vec![]), 0);
        assert_eq!(exact_p99(vec![7]), 7);
        // 1..=100: ceil(99) - 1 = index 98 -> value 99.
        let latencies: Vec<u64> = (1..=100).collect();
        assert_eq!(exact_p99(latencies), 99);
        // Unsorted input is sorted first.
        assert_eq!(exact_p99(vec![30, 10, 20]), 30);
    }

    #[test]
    fn test_self_edges_suppressed() {
        let mut edges = HashMap::new();
        for _ in 0..100 {
            accumulate_request(&mut edges, &request("web", "web", 200, 10));
        }
        assert!(edges.is_empty());
        assert!(build_links(edges).is_empty());
    }

    #[test]
    fn test_empty_service_skipped() {
        let mut edges = HashMap::new();
        accumulate_request(&mut edges, &request("", "api", 200, 10));
        accumulate_request(&mut edges, &request("web", "", 200, 10));
        accumulate_connection(&mut edges, &connection("", "", 10));
        assert!(edges.is_empty());
    }

    #[test]
    fn test_edge_accumulation_and_p99() {
        let mut edges = HashMap::new();
        for latency in 1..=100u64 {
            let status = if latency <= 5 { 502 } else { 200 };
            accumulate_request(&mut edges, &request("a", "b", status, latency));
        }

        let links = build_links(edges);
        assert_eq!(links.len(), 1);
        let link = &links[0];
        assert_eq!(link.parent, "a");
        assert_eq!(link.child, "b");
        assert_eq!(link.call_count, 100);
        assert_eq!(link.error_count, 5);
        assert_eq!(link.p99_latency_ns, 99);
        assert!(link.error_count <= link.call_count);
    }

    #[test]
    fn test_connections_carry_no_errors() {
        let mut edges = HashMap::new();
        accumulate_connection(&mut edges, &connection("a", "b", 500));
        accumulate_connection(&mut edges, &connection("a", "b", 0)); // no latency sample

        let links = build_links(edges);
        assert_eq!(links[0].call_count, 2);
        assert_eq!(links[0].error_count, 0);
        assert_eq!(links[0].p99_latency_ns, 500);
    }

    #[test]
    fn test_distinct_pairs_produce_distinct_edges() {
        let mut edges = HashMap::new();
        accumulate_request(&mut edges, &request("a", "b", 200, 1));
        accumulate_request(&mut edges, &request("b", "a", 200, 1));
        accumulate_request(&mut edges, &request("a", "c", 200, 1));

        let links = build_links(edges);
        assert_eq!(links.len(), 3);
        // Sorted by (parent, child) for deterministic output.
        assert_eq!(links[0].parent, "a");
        assert_eq!(links[0].child, "b");
        assert_eq!(links[2].parent, "b");
    }
}
