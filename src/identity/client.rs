//! HTTP client for the orchestrator API.
//!
//! Speaks plain list/watch REST against the Kubernetes API server: either
//! in-cluster (service-account token and cluster CA) or through a minimal
//! kubeconfig for out-of-cluster development.

use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::resource::{EndpointSlice, List, Pod, ReplicaSet, WatchEvent};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Server-side timeout requested for each watch call. The server closes
/// the stream when it elapses and the caller re-watches.
const WATCH_TIMEOUT_SECS: u32 = 300;

/// Kubernetes API client.
pub struct KubeClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl KubeClient {
    /// Build a client from the in-cluster service account when
    /// `kubeconfig` is empty, otherwise from the given kubeconfig file.
    pub fn new(kubeconfig: &str) -> Result<Self> {
        if kubeconfig.is_empty() {
            Self::in_cluster()
        } else {
            Self::from_kubeconfig(Path::new(kubeconfig))
        }
    }

    /// In-cluster configuration: API server address from the well-known
    /// environment variables, CA and bearer token from the mounted
    /// service-account volume.
    pub fn in_cluster() -> Result<Self> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .context("KUBERNETES_SERVICE_HOST not set; not running in a cluster?")?;
        let port =
            std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let sa = Path::new(SERVICE_ACCOUNT_DIR);
        let token = std::fs::read_to_string(sa.join("token"))
            .context("reading service account token")?
            .trim()
            .to_string();
        let ca_pem = std::fs::read(sa.join("ca.crt")).context("reading cluster CA")?;
        let ca = reqwest::Certificate::from_pem(&ca_pem).context("parsing cluster CA")?;

        let http = reqwest::Client::builder()
            .add_root_certificate(ca)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("building API client")?;

        Ok(Self {
            http,
            base_url: format!("https://{host}:{port}"),
            token: Some(token),
        })
    }

    /// Minimal kubeconfig support: first cluster's server address with
    /// optional CA / insecure flag, first user's bearer token.
    pub fn from_kubeconfig(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading kubeconfig {}", path.display()))?;
        let cfg: Kubeconfig = serde_yaml::from_str(&data)
            .with_context(|| format!("parsing kubeconfig {}", path.display()))?;

        let cluster = cfg
            .clusters
            .first()
            .map(|c| &c.cluster)
            .context("kubeconfig has no clusters")?;

        let mut builder = reqwest::Client::builder().connect_timeout(Duration::from_secs(10));

        if cluster.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        } else if let Some(ca_path) = &cluster.certificate_authority {
            let ca_pem = std::fs::read(ca_path)
                .with_context(|| format!("reading certificate authority {ca_path}"))?;
            builder = builder.add_root_certificate(
                reqwest::Certificate::from_pem(&ca_pem).context("parsing certificate authority")?,
            );
        }

        let token = cfg
            .users
            .first()
            .and_then(|u| u.user.token.clone())
            .filter(|t| !t.is_empty());
        if token.is_none() {
            warn!("kubeconfig carries no bearer token; requests will be unauthenticated");
        }

        Ok(Self {
            http: builder.build().context("building API client")?,
            base_url: cluster.server.trim_end_matches('/').to_string(),
            token,
        })
    }

    fn request(&self, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }
        req
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self
            .request(path)
            .send()
            .await
            .with_context(|| format!("requesting {path}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("unexpected status {status} from {path}: {body}");
        }

        response
            .json()
            .await
            .with_context(|| format!("decoding response from {path}"))
    }

    /// List all pods in the cluster.
    pub async fn list_pods(&self) -> Result<List<Pod>> {
        self.get_json("/api/v1/pods").await
    }

    /// List all endpoint slices in the cluster.
    pub async fn list_endpoint_slices(&self) -> Result<List<EndpointSlice>> {
        self.get_json("/apis/discovery.k8s.io/v1/endpointslices").await
    }

    /// Fetch one ReplicaSet for owner resolution.
    pub async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet> {
        self.get_json(&format!(
            "/apis/apps/v1/namespaces/{namespace}/replicasets/{name}"
        ))
        .await
    }

    /// Watch a resource collection from `resource_version`, invoking
    /// `apply` for each event. Returns when the server closes the stream
    /// or an error occurs; the caller decides whether to re-list.
    pub async fn watch<T, F>(&self, path: &str, resource_version: &str, mut apply: F) -> Result<()>
    where
        T: DeserializeOwned,
        F: FnMut(WatchEvent<T>),
    {
        let url = format!(
            "{path}?watch=true&resourceVersion={resource_version}&timeoutSeconds={WATCH_TIMEOUT_SECS}&allowWatchBookmarks=false"
        );
        let mut response = self
            .request(&url)
            .send()
            .await
            .with_context(|| format!("starting watch on {path}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("watch on {path} returned status {status}: {body}");
        }

        // The body is a stream of newline-delimited JSON events.
        let mut pending = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .with_context(|| format!("reading watch stream for {path}"))?
        {
            pending.extend_from_slice(&chunk);

            while let Some(pos) = pending.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = pending.drain(..=pos).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<WatchEvent<T>>(line) {
                    Ok(event) => apply(event),
                    Err(e) => {
                        debug!(path, error = %e, "skipping undecodable watch line");
                    }
                }
            }
        }

        Ok(())
    }
}

// --- Minimal kubeconfig structure ---

#[derive(Debug, Deserialize)]
struct Kubeconfig {
    #[serde(default)]
    clusters: Vec<NamedCluster>,
    #[serde(default)]
    users: Vec<NamedUser>,
}

#[derive(Debug, Deserialize)]
struct NamedCluster {
    cluster: Cluster,
}

#[derive(Debug, Deserialize)]
struct Cluster {
    server: String,
    #[serde(default, rename = "certificate-authority")]
    certificate_authority: Option<String>,
    #[serde(default, rename = "insecure-skip-tls-verify")]
    insecure_skip_tls_verify: bool,
}

#[derive(Debug, Deserialize)]
struct NamedUser {
    user: User,
}

#[derive(Debug, Default, Deserialize)]
struct User {
    #[serde(default)]
    token: Option<String>,
}
