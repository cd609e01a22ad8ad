//! Event ingestion: the client-streaming RPC surface of the collector.
//!
//! Each received batch is decoded to domain events, written to storage,
//! and fanned out to the aggregator. A storage write error keeps the
//! partial count and the stream alive; a receive error terminates only
//! the one stream.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, error, info, warn};

use crate::health::ServerMetrics;
use crate::model::{ConnectionEvent, EventWriter, RequestEvent, StorageError};
use crate::proto::event_ingestion_server::EventIngestion;
use crate::proto::{connection_from_proto, request_from_proto, EventBatch, StreamResponse};

use super::aggregator::Aggregator;

/// Collector-side handler for agent event streams.
pub struct IngestionService {
    writer: Arc<dyn EventWriter>,
    aggregator: Arc<Aggregator>,
    metrics: Option<Arc<ServerMetrics>>,
    accepted: AtomicU64,
}

impl IngestionService {
    pub fn new(
        writer: Arc<dyn EventWriter>,
        aggregator: Arc<Aggregator>,
        metrics: Option<Arc<ServerMetrics>>,
    ) -> Self {
        Self {
            writer,
            aggregator,
            metrics,
            accepted: AtomicU64::new(0),
        }
    }

    /// Cumulative events accepted across all streams.
    pub fn total_accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Decode one batch, write it, and fan it out. Returns the number of
    /// events accepted and the first write error, if any.
    pub async fn process_batch(&self, batch: &EventBatch) -> (u64, Option<StorageError>) {
        let mut accepted: u64 = 0;

        if !batch.connections.is_empty() {
            let connections: Vec<ConnectionEvent> = batch
                .connections
                .iter()
                .map(|c| connection_from_proto(c, &batch.node))
                .collect();

            if let Err(e) = self.writer.write_connections(&connections).await {
                self.record_accepted(accepted);
                return (accepted, Some(e));
            }
            for ev in &connections {
                self.aggregator.observe_connection(ev);
            }
            accepted += connections.len() as u64;
        }

        if !batch.http_requests.is_empty() {
            let requests: Vec<RequestEvent> = batch
                .http_requests
                .iter()
                .map(|r| request_from_proto(r, &batch.node))
                .collect();

            if let Err(e) = self.writer.write_requests(&requests).await {
                self.record_accepted(accepted);
                return (accepted, Some(e));
            }
            for ev in &requests {
                self.aggregator.observe_request(ev);
            }
            accepted += requests.len() as u64;
        }

        self.record_accepted(accepted);
        (accepted, None)
    }

    fn record_accepted(&self, accepted: u64) {
        if accepted == 0 {
            return;
        }
        self.accepted.fetch_add(accepted, Ordering::Relaxed);
        if let Some(metrics) = &self.metrics {
            metrics.events_accepted.inc_by(accepted as f64);
        }
    }
}

#[tonic::async_trait]
impl EventIngestion for IngestionService {
    async fn stream_events(
        &self,
        request: Request<Streaming<EventBatch>>,
    ) -> Result<Response<StreamResponse>, Status> {
        let mut stream = request.into_inner();
        let mut total: u64 = 0;

        loop {
            match stream.message().await {
                Ok(Some(batch)) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.batches_received.inc();
                    }

                    let (accepted, write_error) = self.process_batch(&batch).await;
                    total += accepted;

                    match write_error {
                        // Transient storage failure must not kick the
                        // agent off the stream.
                        Some(e) => {
                            if let Some(metrics) = &self.metrics {
                                metrics.ingest_write_errors.inc();
                            }
                            error!(node = %batch.node, error = %e, "failed to process batch");
                        }
                        None => debug!(
                            node = %batch.node,
                            connections = batch.connections.len(),
                            http_requests = batch.http_requests.len(),
                            "processed batch",
                        ),
                    }
                }
                Ok(None) => {
                    info!(accepted = total, "stream finished");
                    return Ok(Response::new(StreamResponse {
                        accepted: total,
                        error: String::new(),
                    }));
                }
                Err(status) => {
                    warn!(status = %status, "failed to receive batch, terminating stream");
                    return Err(status);
                }
            }
        }
    }
}
