//! Agent orchestration: identity cache, probe loader, enrichment loop,
//! export client, and health surface for one node.

use std::sync::Arc;

use anyhow::{Context, Result};
#[cfg(feature = "bpf")]
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::AgentConfig;
use crate::export::ExportClient;
use crate::health::{AgentMetrics, HealthServer};
use crate::identity::client::KubeClient;
use crate::identity::{IdentityCache, IdentityTable};
use crate::model::Endpoint;
use crate::probe::{ProbeEvent, ProbeStats, ProbeStatsSnapshot};

/// Readiness subsystem names.
const READY_IDENTITY: &str = "identity";
const READY_EXPORTER: &str = "exporter";
const READY_PROBES: &str = "probes";

/// Agent wires all per-node components together.
pub struct Agent {
    cfg: AgentConfig,
    health: Arc<HealthServer>,
    metrics: Arc<AgentMetrics>,
    probe_stats: Arc<ProbeStats>,
    export: Arc<ExportClient>,
    cancel: CancellationToken,
    #[cfg(feature = "bpf")]
    loader: Option<crate::probe::Loader>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Agent {
    pub fn new(cfg: AgentConfig) -> Result<Self> {
        let health = Arc::new(HealthServer::new(&cfg.health_addr));
        health.register_subsystem(READY_IDENTITY);
        health.register_subsystem(READY_EXPORTER);
        health.register_subsystem(READY_PROBES);

        let metrics = Arc::new(AgentMetrics::new(health.registry()).context("creating metrics")?);

        let export = ExportClient::new(
            cfg.export.clone(),
            cfg.server_endpoint(),
            cfg.node_name.clone(),
        );

        Ok(Self {
            health,
            metrics,
            probe_stats: Arc::new(ProbeStats::new()),
            export,
            cancel: CancellationToken::new(),
            #[cfg(feature = "bpf")]
            loader: None,
            tasks: Vec::new(),
            cfg,
        })
    }

    /// Start all components. Identity sync failure is fatal; probe loading
    /// failure leaves the agent alive but not ready, so the process can
    /// keep answering liveness probes and pick up probes after a node
    /// upgrade.
    pub async fn start(&mut self) -> Result<()> {
        self.health.start().await.context("starting health server")?;

        // Identity cache: seed and watch. The first full sync must
        // complete before anything consumes lookups.
        let kube = KubeClient::new(&self.cfg.kubeconfig).context("creating API client")?;
        let identity = IdentityCache::new(kube);
        identity
            .start(self.cancel.child_token())
            .await
            .context("syncing identity cache")?;
        let table = identity.table();
        self.health.set_ready(READY_IDENTITY, true);

        // Export client.
        {
            let export = Arc::clone(&self.export);
            let cancel = self.cancel.child_token();
            self.tasks.push(tokio::spawn(async move {
                export.run(cancel).await;
            }));
        }
        self.health.set_ready(READY_EXPORTER, true);

        // Probe loader and enrichment loop.
        #[cfg(feature = "bpf")]
        {
            let mut loader = crate::probe::Loader::new(
                self.cfg.probe_object_path.clone(),
                Arc::clone(&self.probe_stats),
            );
            match loader.start(self.cancel.child_token()).await {
                Ok(events) => {
                    self.spawn_enrichment(events, Arc::clone(&table));
                    self.health.set_ready(READY_PROBES, true);
                    self.loader = Some(loader);
                }
                Err(e) => {
                    warn!(
                        error = %e,
                        "probe loading failed, agent will run without probe data collection",
                    );
                }
            }
        }
        #[cfg(not(feature = "bpf"))]
        warn!("built without the bpf feature, no probe data collection");

        self.spawn_stats_reporter(table);

        info!(node = %self.cfg.node_name, "agent started");
        Ok(())
    }

    /// Orderly shutdown: stop decoding, drain the enrichment loop, let
    /// the exporter attempt its final flush, then stop the health server.
    pub async fn stop(&mut self) {
        self.cancel.cancel();

        #[cfg(feature = "bpf")]
        if let Some(mut loader) = self.loader.take() {
            loader.stop().await;
        }

        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "agent task panicked");
            }
        }

        self.health.stop().await;
        info!("agent stopped");
    }

    #[cfg(feature = "bpf")]
    fn spawn_enrichment(
        &mut self,
        mut events: mpsc::Receiver<ProbeEvent>,
        table: Arc<IdentityTable>,
    ) {
        let export = Arc::clone(&self.export);
        let node_name = self.cfg.node_name.clone();
        let cancel = self.cancel.child_token();

        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events.recv() => match event {
                        Some(mut event) => {
                            enrich_event(&table, &node_name, &mut event);
                            export.enqueue(event);
                        }
                        // Loader closed the channel.
                        None => return,
                    }
                }
            }
        }));
    }

    /// Periodically mirror the atomic pipeline counters into Prometheus
    /// and log a throughput summary.
    fn spawn_stats_reporter(&mut self, table: Arc<IdentityTable>) {
        let metrics = Arc::clone(&self.metrics);
        let probe_stats = Arc::clone(&self.probe_stats);
        let export = Arc::clone(&self.export);
        let cancel = self.cancel.child_token();

        self.tasks.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(30));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_probe = ProbeStatsSnapshot::default();
            let mut last_enqueued = 0u64;
            let mut last_dropped = 0u64;
            let mut last_batches = 0u64;
            let mut last_events = 0u64;
            let mut last_breaks = 0u64;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = ticker.tick() => {
                        let probe = probe_stats.snapshot();
                        metrics.events_decoded.inc_by((probe.decoded - last_probe.decoded) as f64);
                        metrics.decode_errors.inc_by((probe.decode_errors - last_probe.decode_errors) as f64);
                        metrics.lost_samples.inc_by((probe.lost_samples - last_probe.lost_samples) as f64);

                        let stats = export.stats();
                        let enqueued = stats.enqueued.load(std::sync::atomic::Ordering::Relaxed);
                        let dropped = stats.dropped.load(std::sync::atomic::Ordering::Relaxed);
                        let batches = stats.batches_sent.load(std::sync::atomic::Ordering::Relaxed);
                        let events = stats.events_sent.load(std::sync::atomic::Ordering::Relaxed);
                        let breaks = stats.stream_breaks.load(std::sync::atomic::Ordering::Relaxed);

                        metrics.events_enqueued.inc_by((enqueued - last_enqueued) as f64);
                        metrics.queue_dropped.inc_by((dropped - last_dropped) as f64);
                        metrics.batches_sent.inc_by((batches - last_batches) as f64);
                        metrics.events_sent.inc_by((events - last_events) as f64);
                        metrics.stream_breaks.inc_by((breaks - last_breaks) as f64);
                        metrics.queue_length.set(export.queue_len() as f64);
                        metrics.identity_known_ips.set(table.len() as f64);

                        if probe.decoded > last_probe.decoded || events > last_events {
                            info!(
                                decoded = probe.decoded - last_probe.decoded,
                                exported = events - last_events,
                                dropped = dropped - last_dropped,
                                queue = export.queue_len(),
                                "pipeline stats (30s)",
                            );
                        }

                        last_probe = probe;
                        last_enqueued = enqueued;
                        last_dropped = dropped;
                        last_batches = batches;
                        last_events = events;
                        last_breaks = breaks;
                    }
                }
            }
        }));
    }
}

/// Fill in workload identity for both endpoints and stamp the node name.
pub fn enrich_event(table: &IdentityTable, node_name: &str, event: &mut ProbeEvent) {
    match event {
        ProbeEvent::Connection(ev) => {
            enrich_endpoint(table, &mut ev.source);
            enrich_endpoint(table, &mut ev.destination);
            ev.node = node_name.to_string();
        }
        ProbeEvent::Request(ev) => {
            enrich_endpoint(table, &mut ev.source);
            enrich_endpoint(table, &mut ev.destination);
            ev.node = node_name.to_string();
        }
    }
}

fn enrich_endpoint(table: &IdentityTable, ep: &mut Endpoint) {
    if ep.ip.is_empty() {
        return;
    }
    let Some(cached) = table.lookup(&ep.ip) else {
        return;
    };
    ep.pod = cached.pod;
    ep.namespace = cached.namespace;
    ep.workload = cached.workload;
    ep.workload_kind = cached.workload_kind;
    ep.service = cached.service;
}
