//! Batching export client.
//!
//! Accepts enriched events into a bounded in-memory queue, ships them to
//! the collector as gRPC batches, and survives collector outages with a
//! drop-oldest policy and capped exponential reconnect backoff.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ExportConfig;
use crate::probe::ProbeEvent;
use crate::proto::event_ingestion_client::EventIngestionClient;
use crate::proto::{connection_to_proto, request_to_proto, EventBatch};

/// Lock-free counters for the export path.
#[derive(Debug, Default)]
pub struct ExportStats {
    /// Events accepted into the queue.
    pub enqueued: AtomicU64,
    /// Events dropped because the queue was full.
    pub dropped: AtomicU64,
    /// Batches successfully handed to the stream.
    pub batches_sent: AtomicU64,
    /// Events carried by those batches.
    pub events_sent: AtomicU64,
    /// Dial attempts that failed.
    pub dial_failures: AtomicU64,
    /// Streams that broke after connecting.
    pub stream_breaks: AtomicU64,
}

enum SessionEnd {
    Cancelled,
    StreamBroken,
}

/// Batching gRPC export client.
pub struct ExportClient {
    cfg: ExportConfig,
    endpoint: String,
    node_name: String,
    queue: Mutex<VecDeque<ProbeEvent>>,
    /// Woken when the queue reaches a full batch, so bursts flush without
    /// waiting for the timer.
    flush_wake: Notify,
    stats: ExportStats,
}

impl ExportClient {
    pub fn new(cfg: ExportConfig, endpoint: String, node_name: String) -> Arc<Self> {
        Arc::new(Self {
            queue: Mutex::new(VecDeque::with_capacity(cfg.queue_limit.min(4096))),
            flush_wake: Notify::new(),
            stats: ExportStats::default(),
            cfg,
            endpoint,
            node_name,
        })
    }

    /// Queue an event for export. When the queue is at its bound, the
    /// oldest event is dropped to make room.
    pub fn enqueue(&self, event: ProbeEvent) {
        let len = {
            let mut queue = self.queue.lock();
            if queue.len() >= self.cfg.queue_limit {
                queue.pop_front();
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
            queue.push_back(event);
            queue.len()
        };

        self.stats.enqueued.fetch_add(1, Ordering::Relaxed);

        if len >= self.cfg.batch_size {
            self.flush_wake.notify_one();
        }
    }

    pub fn queue_len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn stats(&self) -> &ExportStats {
        &self.stats
    }

    /// Run the connect/flush/reconnect loop until cancelled. On
    /// cancellation a final flush is attempted with a short deadline.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut backoff = self.cfg.initial_backoff;

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let channel = match self.dial().await {
                Ok(ch) => ch,
                Err(e) => {
                    self.stats.dial_failures.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        endpoint = %self.endpoint,
                        error = %e,
                        retry_in = ?backoff,
                        "failed to connect to collector",
                    );
                    if !sleep_cancellable(backoff, &cancel).await {
                        return;
                    }
                    backoff = next_backoff(backoff, self.cfg.max_backoff);
                    continue;
                }
            };

            info!(endpoint = %self.endpoint, "connected to collector");

            match self.stream_session(channel, &mut backoff, &cancel).await {
                SessionEnd::Cancelled => return,
                SessionEnd::StreamBroken => {
                    self.stats.stream_breaks.fetch_add(1, Ordering::Relaxed);
                    warn!(retry_in = ?backoff, "collector stream broke, reconnecting");
                    if !sleep_cancellable(backoff, &cancel).await {
                        return;
                    }
                    backoff = next_backoff(backoff, self.cfg.max_backoff);
                }
            }
        }
    }

    async fn dial(&self) -> Result<tonic::transport::Channel> {
        let endpoint = tonic::transport::Endpoint::from_shared(self.endpoint.clone())
            .with_context(|| format!("invalid collector endpoint {}", self.endpoint))?
            .connect_timeout(self.cfg.dial_timeout);
        endpoint.connect().await.context("collector dial")
    }

    /// Flush batches over one stream until it breaks or we are cancelled.
    async fn stream_session(
        &self,
        channel: tonic::transport::Channel,
        backoff: &mut Duration,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let mut client = EventIngestionClient::new(channel);
        let (tx, rx) = mpsc::channel::<EventBatch>(1);
        let mut response =
            tokio::spawn(async move { client.stream_events(ReceiverStream::new(rx)).await });

        let mut ticker = tokio::time::interval(self.cfg.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    self.final_flush(&tx).await;
                    drop(tx);
                    match tokio::time::timeout(self.cfg.flush_interval * 2, &mut response).await {
                        Ok(Ok(Ok(ack))) => {
                            info!(accepted = ack.get_ref().accepted, "collector acknowledged stream");
                        }
                        _ => debug!("no acknowledgement before shutdown deadline"),
                    }
                    return SessionEnd::Cancelled;
                }
                result = &mut response => {
                    match result {
                        Ok(Ok(ack)) => info!(
                            accepted = ack.get_ref().accepted,
                            "collector closed the stream",
                        ),
                        Ok(Err(status)) => warn!(status = %status, "stream terminated by collector"),
                        Err(e) => warn!(error = %e, "stream task failed"),
                    }
                    return SessionEnd::StreamBroken;
                }
                _ = ticker.tick() => {
                    match self.flush(&tx).await {
                        Ok(true) => *backoff = self.cfg.initial_backoff,
                        Ok(false) => {}
                        Err(()) => return SessionEnd::StreamBroken,
                    }
                }
                _ = self.flush_wake.notified() => {
                    match self.flush(&tx).await {
                        Ok(true) => *backoff = self.cfg.initial_backoff,
                        Ok(false) => {}
                        Err(()) => return SessionEnd::StreamBroken,
                    }
                }
            }
        }
    }

    /// Send one batch of up to `batch_size` oldest events. Returns
    /// Ok(false) when the queue was empty, Err(()) when the stream is
    /// gone (the batch is put back at the queue head).
    async fn flush(&self, tx: &mpsc::Sender<EventBatch>) -> std::result::Result<bool, ()> {
        let events = {
            let mut queue = self.queue.lock();
            if queue.is_empty() {
                return Ok(false);
            }
            let n = self.cfg.batch_size.min(queue.len());
            queue.drain(..n).collect::<Vec<_>>()
        };

        let batch = self.build_batch(&events);
        let count = events.len() as u64;

        if tx.send(batch).await.is_err() {
            self.requeue_front(events);
            return Err(());
        }

        self.stats.batches_sent.fetch_add(1, Ordering::Relaxed);
        self.stats.events_sent.fetch_add(count, Ordering::Relaxed);
        Ok(true)
    }

    /// Drain the queue as far as the shutdown deadline allows.
    async fn final_flush(&self, tx: &mpsc::Sender<EventBatch>) {
        let deadline = Instant::now() + self.cfg.flush_interval * 2;
        while Instant::now() < deadline {
            match self.flush(tx).await {
                Ok(true) => {}
                Ok(false) | Err(()) => break,
            }
        }
    }

    fn build_batch(&self, events: &[ProbeEvent]) -> EventBatch {
        let mut batch = EventBatch {
            node: self.node_name.clone(),
            connections: Vec::new(),
            http_requests: Vec::new(),
        };
        for event in events {
            match event {
                ProbeEvent::Connection(ev) => batch.connections.push(connection_to_proto(ev)),
                ProbeEvent::Request(ev) => batch.http_requests.push(request_to_proto(ev)),
            }
        }
        batch
    }

    /// Put unsent events back at the queue head, truncating the newest
    /// tail entries to stay within the bound.
    fn requeue_front(&self, events: Vec<ProbeEvent>) {
        let mut queue = self.queue.lock();
        for event in events.into_iter().rev() {
            queue.push_front(event);
        }
        while queue.len() > self.cfg.queue_limit {
            queue.pop_back();
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Sleep unless cancelled first. Returns false on cancellation.
async fn sleep_cancellable(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(duration) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ConnectionEvent, Endpoint, Protocol};
    use chrono::DateTime;

    fn event(seq: u16) -> ProbeEvent {
        ProbeEvent::Connection(ConnectionEvent {
            timestamp: DateTime::from_timestamp_nanos(i64::from(seq)),
            node: String::new(),
            source: Endpoint::from_addr("10.0.0.1".to_string(), seq),
            destination: Endpoint::from_addr("10.0.0.2".to_string(), 80),
            bytes_sent: 0,
            bytes_recv: 0,
            duration_ns: 0,
            retransmits: 0,
            protocol: Protocol::Tcp,
        })
    }

    fn client_with_limit(limit: usize) -> Arc<ExportClient> {
        let cfg = ExportConfig {
            queue_limit: limit,
            ..Default::default()
        };
        ExportClient::new(cfg, "http://127.0.0.1:1".to_string(), "test-node".to_string())
    }

    fn source_port(ev: &ProbeEvent) -> u16 {
        match ev {
            ProbeEvent::Connection(c) => c.source.port,
            ProbeEvent::Request(r) => r.source.port,
        }
    }

    #[test]
    fn test_enqueue_drops_oldest_at_bound() {
        let client = client_with_limit(100);
        for seq in 0..150u16 {
            client.enqueue(event(seq));
        }

        assert_eq!(client.queue_len(), 100);
        assert_eq!(client.stats().dropped.load(Ordering::Relaxed), 50);

        // The head is the oldest retained event.
        let queue = client.queue.lock();
        assert_eq!(source_port(queue.front().unwrap()), 50);
        assert_eq!(source_port(queue.back().unwrap()), 149);
    }

    #[test]
    fn test_build_batch_partitions_and_preserves_order() {
        let client = client_with_limit(10);
        let events = vec![event(1), event(2), event(3)];
        let batch = client.build_batch(&events);

        assert_eq!(batch.node, "test-node");
        assert_eq!(batch.connections.len(), 3);
        assert!(batch.http_requests.is_empty());
        let ports: Vec<u32> = batch
            .connections
            .iter()
            .map(|c| c.source.as_ref().unwrap().port)
            .collect();
        assert_eq!(ports, vec![1, 2, 3]);
    }

    #[test]
    fn test_requeue_front_restores_order_and_truncates() {
        let client = client_with_limit(5);
        for seq in 10..14u16 {
            client.enqueue(event(seq)); // queue: 10 11 12 13
        }

        client.requeue_front(vec![event(7), event(8), event(9)]);

        let queue = client.queue.lock();
        assert_eq!(queue.len(), 5);
        let ports: Vec<u16> = queue.iter().map(source_port).collect();
        // Unsent events lead; the newest tail entries were truncated.
        assert_eq!(ports, vec![7, 8, 9, 10, 11]);
    }

    #[tokio::test]
    async fn test_flush_requeues_when_stream_gone() {
        let client = client_with_limit(10);
        for seq in 0..4u16 {
            client.enqueue(event(seq));
        }

        let (tx, rx) = mpsc::channel::<EventBatch>(1);
        drop(rx);

        assert!(client.flush(&tx).await.is_err());
        assert_eq!(client.queue_len(), 4);
        let queue = client.queue.lock();
        assert_eq!(source_port(queue.front().unwrap()), 0);
    }

    #[tokio::test]
    async fn test_flush_empty_queue_is_noop() {
        let client = client_with_limit(10);
        let (tx, mut rx) = mpsc::channel::<EventBatch>(1);
        assert!(matches!(client.flush(&tx).await, Ok(false)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_flush_sends_oldest_batch() {
        let cfg = ExportConfig {
            queue_limit: 1000,
            batch_size: 3,
            ..Default::default()
        };
        let client = ExportClient::new(cfg, "http://127.0.0.1:1".to_string(), "n".to_string());
        for seq in 0..5u16 {
            client.enqueue(event(seq));
        }

        let (tx, mut rx) = mpsc::channel::<EventBatch>(1);
        assert!(matches!(client.flush(&tx).await, Ok(true)));

        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.connections.len(), 3);
        assert_eq!(batch.connections[0].source.as_ref().unwrap().port, 0);
        assert_eq!(client.queue_len(), 2);
    }

    #[test]
    fn test_queue_bound_under_collector_outage() {
        // Default bound, collector never reachable: 10 050 enqueues leave
        // exactly 50 drops and the 10 000 most recent events, the head
        // being event #51 (1-indexed).
        let client = client_with_limit(10_000);
        for seq in 1..=10_050u16 {
            client.enqueue(event(seq));
        }

        assert_eq!(client.queue_len(), 10_000);
        assert_eq!(client.stats().dropped.load(Ordering::Relaxed), 50);
        let queue = client.queue.lock();
        assert_eq!(source_port(queue.front().unwrap()), 51);
        assert_eq!(source_port(queue.back().unwrap()), 10_050);
    }

    #[test]
    fn test_next_backoff_caps() {
        let max = Duration::from_secs(30);
        let mut b = Duration::from_millis(500);
        let mut seen = Vec::new();
        for _ in 0..8 {
            b = next_backoff(b, max);
            seen.push(b);
        }
        assert_eq!(seen[0], Duration::from_secs(1));
        assert_eq!(*seen.last().unwrap(), max);
    }
}
