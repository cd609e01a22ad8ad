//! Collector orchestration: storage adapter, aggregator, dependency
//! computer, gRPC ingestion, and the health surface.

pub mod aggregator;
pub mod dependency;
pub mod ingest;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{HealthServer, ServerMetrics};
use crate::model::{DependencyWriter, EventReader, EventWriter, MetricWriter};
use crate::proto::event_ingestion_server::EventIngestionServer;
use crate::storage::EsClient;

use self::aggregator::Aggregator;
use self::dependency::DependencyComputer;
use self::ingest::IngestionService;

const READY_STORAGE: &str = "storage";
const READY_GRPC: &str = "grpc";
const READY_HTTP: &str = "http";

/// Server wires the cluster-side pipeline together.
pub struct Server {
    cfg: ServerConfig,
    health: Arc<HealthServer>,
    storage: Option<Arc<EsClient>>,
    ingestion: Option<Arc<IngestionService>>,
    cancel: CancellationToken,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Self {
        let health = Arc::new(HealthServer::new(&format!("0.0.0.0:{}", cfg.http_port)));
        health.register_subsystem(READY_STORAGE);
        health.register_subsystem(READY_GRPC);
        health.register_subsystem(READY_HTTP);

        Self {
            cfg,
            health,
            storage: None,
            ingestion: None,
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Cumulative events accepted, for diagnostics.
    pub fn total_accepted(&self) -> u64 {
        self.ingestion
            .as_ref()
            .map(|i| i.total_accepted())
            .unwrap_or(0)
    }

    pub async fn start(&mut self) -> Result<()> {
        self.health.start().await.context("starting health server")?;
        self.health.set_ready(READY_HTTP, true);

        let metrics =
            Arc::new(ServerMetrics::new(self.health.registry()).context("creating metrics")?);

        // Storage adapter with its bulk flush loop. Index template
        // installation failure is survivable: the store may simply not be
        // reachable yet.
        let storage = EsClient::new(
            self.cfg.es_addresses.clone(),
            self.cfg.storage.clone(),
            Some(Arc::clone(&metrics)),
        )
        .context("creating storage client")?;
        storage.start();
        if let Err(e) = storage.ensure_indices().await {
            warn!(error = %e, "failed to ensure index templates (storage may not be up yet)");
        }
        self.health.set_ready(READY_STORAGE, true);

        // Aggregator flush loop.
        let metric_writer: Arc<dyn MetricWriter> = storage.clone();
        let aggregator = Arc::new(Aggregator::new(
            metric_writer,
            self.cfg.aggregator_flush_interval,
            Some(Arc::clone(&metrics)),
        ));
        {
            let aggregator = Arc::clone(&aggregator);
            let cancel = self.cancel.child_token();
            self.tasks.push(tokio::spawn(async move {
                aggregator.run(cancel).await;
            }));
        }

        // Dependency computation loop.
        let event_reader: Arc<dyn EventReader> = storage.clone();
        let dep_writer: Arc<dyn DependencyWriter> = storage.clone();
        let dependency = Arc::new(DependencyComputer::new(
            event_reader,
            dep_writer,
            self.cfg.dependency_interval,
            self.cfg.dependency_window,
            Some(Arc::clone(&metrics)),
        ));
        {
            let dependency = Arc::clone(&dependency);
            let cancel = self.cancel.child_token();
            self.tasks.push(tokio::spawn(async move {
                dependency.run(cancel).await;
            }));
        }

        // gRPC ingestion.
        let event_writer: Arc<dyn EventWriter> = storage.clone();
        let ingestion = Arc::new(IngestionService::new(
            event_writer,
            Arc::clone(&aggregator),
            Some(Arc::clone(&metrics)),
        ));
        let grpc_addr: SocketAddr = format!("0.0.0.0:{}", self.cfg.grpc_port)
            .parse()
            .context("parsing gRPC listen address")?;
        {
            let service = EventIngestionServer::from_arc(Arc::clone(&ingestion));
            let cancel = self.cancel.child_token();
            self.tasks.push(tokio::spawn(async move {
                info!(addr = %grpc_addr, "gRPC ingestion listening");
                let result = tonic::transport::Server::builder()
                    .add_service(service)
                    .serve_with_shutdown(grpc_addr, async move {
                        cancel.cancelled().await;
                    })
                    .await;
                if let Err(e) = result {
                    error!(error = %e, "gRPC server exited with error");
                }
            }));
        }
        self.health.set_ready(READY_GRPC, true);

        self.storage = Some(storage);
        self.ingestion = Some(ingestion);

        info!(
            grpc_port = self.cfg.grpc_port,
            http_port = self.cfg.http_port,
            "server started",
        );
        Ok(())
    }

    /// Graceful shutdown: stop accepting streams, run the final
    /// aggregator flush, then flush pending storage writes.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "server task panicked");
            }
        }

        if let Some(storage) = self.storage.take() {
            if let Err(e) = storage.close().await {
                error!(error = %e, "failed to flush storage on shutdown");
            }
        }

        self.health.stop().await;
        info!("server stopped");
    }
}
