//! Workload identity cache.
//!
//! Mirrors cluster state into an in-memory `IP -> Endpoint` table plus a
//! `(namespace, pod) -> service` index, fed by list+watch streams over
//! Pods and EndpointSlices. ReplicaSets are fetched on demand to resolve
//! the owning Deployment. Lookups are read-locked and return value
//! copies; all writes happen on the control-plane tasks.

pub mod client;
pub mod resource;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::model::Endpoint;

use self::client::KubeClient;
use self::resource::{EndpointSlice, Pod, WatchEvent};

/// Delay before re-listing after a broken watch stream.
const RELIST_DELAY: Duration = Duration::from_secs(2);

#[derive(Default)]
struct Tables {
    /// IP -> endpoint metadata.
    endpoints: HashMap<String, Endpoint>,
    /// "namespace/pod" -> service name.
    pod_services: HashMap<String, String>,
}

/// The shared identity table. Pure of any API access, so the apply logic
/// is testable against decoded resources alone.
#[derive(Default)]
pub struct IdentityTable {
    inner: RwLock<Tables>,
}

impl IdentityTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve an IP to endpoint metadata. Returns a copy; callers never
    /// observe subsequent table mutation.
    pub fn lookup(&self, ip: &str) -> Option<Endpoint> {
        self.inner.read().endpoints.get(ip).cloned()
    }

    /// Number of known IPs.
    pub fn len(&self) -> usize {
        self.inner.read().endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or update the row for a pod with its resolved workload.
    pub fn apply_pod(&self, pod: &Pod, workload: &str, workload_kind: &str) {
        if pod.status.pod_ip.is_empty() {
            return;
        }

        let mut tables = self.inner.write();
        let key = pod_key(&pod.metadata.namespace, &pod.metadata.name);
        let service = tables.pod_services.get(&key).cloned().unwrap_or_default();

        tables.endpoints.insert(
            pod.status.pod_ip.clone(),
            Endpoint {
                ip: pod.status.pod_ip.clone(),
                port: 0,
                pod: pod.metadata.name.clone(),
                namespace: pod.metadata.namespace.clone(),
                workload: workload.to_string(),
                workload_kind: workload_kind.to_string(),
                service,
            },
        );
    }

    /// Drop the row for a deleted pod.
    pub fn remove_pod(&self, pod: &Pod) {
        if pod.status.pod_ip.is_empty() {
            return;
        }
        self.inner.write().endpoints.remove(&pod.status.pod_ip);
    }

    /// Record the pod->service associations of a slice and propagate the
    /// service name onto already-known IP rows.
    pub fn apply_endpoint_slice(&self, slice: &EndpointSlice) {
        let Some(service) = slice.service_name() else {
            return;
        };

        let mut tables = self.inner.write();
        for entry in &slice.endpoints {
            if let Some(target) = &entry.target_ref {
                if target.kind == "Pod" {
                    tables.pod_services.insert(
                        pod_key(&slice.metadata.namespace, &target.name),
                        service.to_string(),
                    );
                }
            }
            for addr in &entry.addresses {
                if let Some(row) = tables.endpoints.get_mut(addr) {
                    row.service = service.to_string();
                }
            }
        }
    }

    /// Remove a deleted slice's associations and clear the service field
    /// on affected rows.
    pub fn remove_endpoint_slice(&self, slice: &EndpointSlice) {
        let mut tables = self.inner.write();
        for entry in &slice.endpoints {
            if let Some(target) = &entry.target_ref {
                if target.kind == "Pod" {
                    tables
                        .pod_services
                        .remove(&pod_key(&slice.metadata.namespace, &target.name));
                }
            }
            for addr in &entry.addresses {
                if let Some(row) = tables.endpoints.get_mut(addr) {
                    row.service.clear();
                }
            }
        }
    }
}

fn pod_key(namespace: &str, name: &str) -> String {
    format!("{namespace}/{name}")
}

/// Resolve a pod's owning workload given the Deployment owner of its
/// ReplicaSet, when one was found.
pub fn workload_from_owner(pod: &Pod, deployment: Option<String>) -> (String, String) {
    let Some(owner) = pod.metadata.owner_references.first() else {
        return (pod.metadata.name.clone(), "Pod".to_string());
    };

    match owner.kind.as_str() {
        "ReplicaSet" => match deployment {
            Some(name) => (name, "Deployment".to_string()),
            None => (
                strip_replicaset_hash(&owner.name).to_string(),
                "ReplicaSet".to_string(),
            ),
        },
        _ => (owner.name.clone(), owner.kind.clone()),
    }
}

/// Strip the trailing hash suffix from a ReplicaSet name
/// (e.g. "my-deploy-6b8f7c9d4" -> "my-deploy"). The suffix must be the
/// last `-`-delimited token, alphanumeric, 5 to 16 characters.
pub fn strip_replicaset_hash(name: &str) -> &str {
    let Some(idx) = name.rfind('-') else {
        return name;
    };
    if idx == 0 {
        return name;
    }
    let suffix = &name[idx + 1..];
    if (5..=16).contains(&suffix.len()) && suffix.chars().all(|c| c.is_ascii_alphanumeric()) {
        &name[..idx]
    } else {
        name
    }
}

/// Identity cache: the shared table plus the control-plane loops keeping
/// it current.
pub struct IdentityCache {
    client: Arc<KubeClient>,
    table: Arc<IdentityTable>,
}

impl IdentityCache {
    pub fn new(client: KubeClient) -> Self {
        Self {
            client: Arc::new(client),
            table: Arc::new(IdentityTable::new()),
        }
    }

    /// Handle to the shared table for hot-path lookups.
    pub fn table(&self) -> Arc<IdentityTable> {
        Arc::clone(&self.table)
    }

    /// Resolve an IP to endpoint metadata.
    pub fn lookup(&self, ip: &str) -> Option<Endpoint> {
        self.table.lookup(ip)
    }

    /// Seed the table with a full list of Pods and EndpointSlices, then
    /// start watch loops that apply changes until cancelled. Returns only
    /// after the initial sync succeeded; an initial sync failure is fatal
    /// to the caller.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let pods = self
            .client
            .list_pods()
            .await
            .context("initial pod list")?;
        let pods_rv = pods.metadata.resource_version.clone();
        for pod in &pods.items {
            self.handle_pod_upsert(pod).await;
        }

        let slices = self
            .client
            .list_endpoint_slices()
            .await
            .context("initial endpoint slice list")?;
        let slices_rv = slices.metadata.resource_version.clone();
        // Applied after the pods so the service names land on the seeded
        // rows directly.
        for slice in &slices.items {
            self.table.apply_endpoint_slice(slice);
        }

        info!(
            pods = pods.items.len(),
            endpoint_slices = slices.items.len(),
            known_ips = self.table.len(),
            "identity cache synced",
        );

        self.spawn_pod_watch(pods_rv, cancel.clone());
        self.spawn_slice_watch(slices_rv, cancel);

        Ok(())
    }

    async fn handle_pod_upsert(&self, pod: &Pod) {
        if pod.status.pod_ip.is_empty() {
            return;
        }
        let (workload, kind) = self.resolve_workload(pod).await;
        self.table.apply_pod(pod, &workload, &kind);
    }

    /// Resolve the owning workload, following ReplicaSet -> Deployment
    /// through one on-demand API fetch.
    async fn resolve_workload(&self, pod: &Pod) -> (String, String) {
        let deployment = match pod.metadata.owner_references.first() {
            Some(owner) if owner.kind == "ReplicaSet" => {
                match self
                    .client
                    .get_replica_set(&pod.metadata.namespace, &owner.name)
                    .await
                {
                    Ok(rs) => rs
                        .metadata
                        .owner_references
                        .iter()
                        .find(|r| r.kind == "Deployment")
                        .map(|r| r.name.clone()),
                    Err(e) => {
                        debug!(
                            replicaset = %owner.name,
                            error = %e,
                            "replica set fetch failed, falling back to name heuristics",
                        );
                        None
                    }
                }
            }
            _ => None,
        };
        workload_from_owner(pod, deployment)
    }

    fn spawn_pod_watch(&self, resource_version: String, cancel: CancellationToken) {
        let cache = self.handle();
        tokio::spawn(async move {
            cache.run_pod_watch(resource_version, cancel).await;
        });
    }

    fn spawn_slice_watch(&self, resource_version: String, cancel: CancellationToken) {
        let cache = self.handle();
        tokio::spawn(async move {
            cache.run_slice_watch(resource_version, cancel).await;
        });
    }

    fn handle(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            table: Arc::clone(&self.table),
        }
    }

    /// Stream pod events, applying each; on stream end or error fall back
    /// to a fresh list before re-watching.
    async fn run_pod_watch(&self, mut resource_version: String, cancel: CancellationToken) {
        const PATH: &str = "/api/v1/pods";

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let (tx, mut rx) = mpsc::unbounded_channel::<WatchEvent<Pod>>();
            let client = Arc::clone(&self.client);
            let rv = resource_version.clone();
            let watcher = tokio::spawn(async move {
                client
                    .watch::<Pod, _>(PATH, &rv, move |event| {
                        let _ = tx.send(event);
                    })
                    .await
            });

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        watcher.abort();
                        return;
                    }
                    event = rx.recv() => match event {
                        Some(event) => {
                            let rv = event.object.metadata.resource_version.clone();
                            match event.event_type.as_str() {
                                "ADDED" | "MODIFIED" => self.handle_pod_upsert(&event.object).await,
                                "DELETED" => self.table.remove_pod(&event.object),
                                _ => {}
                            }
                            if !rv.is_empty() {
                                resource_version = rv;
                            }
                        }
                        None => break,
                    }
                }
            }

            log_watch_end(PATH, watcher.await);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RELIST_DELAY) => {}
            }

            match self.client.list_pods().await {
                Ok(fresh) => {
                    resource_version = fresh.metadata.resource_version.clone();
                    for pod in &fresh.items {
                        self.handle_pod_upsert(pod).await;
                    }
                }
                Err(e) => warn!(path = PATH, error = %e, "re-list failed, retrying watch"),
            }
        }
    }

    /// Stream endpoint slice events, applying each; on stream end or
    /// error fall back to a fresh list before re-watching.
    async fn run_slice_watch(&self, mut resource_version: String, cancel: CancellationToken) {
        const PATH: &str = "/apis/discovery.k8s.io/v1/endpointslices";

        loop {
            if cancel.is_cancelled() {
                return;
            }

            let (tx, mut rx) = mpsc::unbounded_channel::<WatchEvent<EndpointSlice>>();
            let client = Arc::clone(&self.client);
            let rv = resource_version.clone();
            let watcher = tokio::spawn(async move {
                client
                    .watch::<EndpointSlice, _>(PATH, &rv, move |event| {
                        let _ = tx.send(event);
                    })
                    .await
            });

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        watcher.abort();
                        return;
                    }
                    event = rx.recv() => match event {
                        Some(event) => {
                            let rv = event.object.metadata.resource_version.clone();
                            match event.event_type.as_str() {
                                "ADDED" | "MODIFIED" => self.table.apply_endpoint_slice(&event.object),
                                "DELETED" => self.table.remove_endpoint_slice(&event.object),
                                _ => {}
                            }
                            if !rv.is_empty() {
                                resource_version = rv;
                            }
                        }
                        None => break,
                    }
                }
            }

            log_watch_end(PATH, watcher.await);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(RELIST_DELAY) => {}
            }

            match self.client.list_endpoint_slices().await {
                Ok(fresh) => {
                    resource_version = fresh.metadata.resource_version.clone();
                    for slice in &fresh.items {
                        self.table.apply_endpoint_slice(slice);
                    }
                }
                Err(e) => warn!(path = PATH, error = %e, "re-list failed, retrying watch"),
            }
        }
    }
}

fn log_watch_end(path: &str, result: std::result::Result<Result<()>, tokio::task::JoinError>) {
    match result {
        Ok(Ok(())) => debug!(path, "watch stream ended, re-listing"),
        Ok(Err(e)) => warn!(path, error = %e, "watch stream failed, re-listing"),
        Err(_) => {}
    }
}
