use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Configuration for the nefi-agent process.
///
/// Values come from an optional YAML file, with the environment variables
/// recognised by the deployment manifests (`NODE_NAME`, `SERVER_ADDR`,
/// `EBPF_OBJECT_PATH`, `KUBECONFIG`) taking precedence.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Name of the node this agent runs on; stamped onto every event.
    #[serde(default)]
    pub node_name: String,

    /// Collector gRPC endpoint (host:port).
    #[serde(default = "default_server_addr")]
    pub server_addr: String,

    /// Directory (or single file) of compiled probe objects.
    #[serde(default = "default_probe_object_path")]
    pub probe_object_path: String,

    /// Kubeconfig path for out-of-cluster development. Empty means
    /// in-cluster discovery.
    #[serde(default)]
    pub kubeconfig: String,

    /// Health/metrics listen address.
    #[serde(default = "default_agent_health_addr")]
    pub health_addr: String,

    /// Export client tuning.
    #[serde(default)]
    pub export: ExportConfig,
}

/// Export client configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ExportConfig {
    /// Maximum events held in memory while the collector is unreachable.
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,

    /// Maximum events per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// How often buffered events are flushed even if the batch is not full.
    #[serde(default = "default_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,

    /// Starting backoff between reconnection attempts.
    #[serde(default = "default_initial_backoff", with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Cap on the exponential reconnection backoff.
    #[serde(default = "default_max_backoff", with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Connection establishment timeout.
    #[serde(default = "default_dial_timeout", with = "humantime_serde")]
    pub dial_timeout: Duration,
}

/// Configuration for the nefi-server process. Environment variables
/// `GRPC_PORT`, `HTTP_PORT` and `ES_ADDRESSES` take precedence over the
/// YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Event ingestion gRPC listen port.
    #[serde(default = "default_grpc_port")]
    pub grpc_port: u16,

    /// Health/metrics HTTP listen port.
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Elasticsearch endpoints.
    #[serde(default = "default_es_addresses")]
    pub es_addresses: Vec<String>,

    /// Aggregator flush interval.
    #[serde(default = "default_aggregator_flush_interval", with = "humantime_serde")]
    pub aggregator_flush_interval: Duration,

    /// Dependency computation interval.
    #[serde(default = "default_dependency_interval", with = "humantime_serde")]
    pub dependency_interval: Duration,

    /// Trailing window scanned per dependency computation.
    #[serde(default = "default_dependency_window", with = "humantime_serde")]
    pub dependency_window: Duration,

    /// Storage bulk-writer tuning.
    #[serde(default)]
    pub storage: StorageConfig,
}

/// Storage adapter bulk-write configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Documents buffered before a bulk flush is forced.
    #[serde(default = "default_storage_batch_size")]
    pub batch_size: usize,

    /// Maximum time between bulk flushes.
    #[serde(default = "default_storage_flush_interval", with = "humantime_serde")]
    pub flush_interval: Duration,
}

// --- Default value functions ---

fn default_server_addr() -> String {
    "http://nefi-server:9090".to_string()
}

fn default_probe_object_path() -> String {
    "/opt/nefi/bpf".to_string()
}

fn default_agent_health_addr() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_queue_limit() -> usize {
    10_000
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval() -> Duration {
    Duration::from_millis(100)
}

fn default_initial_backoff() -> Duration {
    Duration::from_millis(500)
}

fn default_max_backoff() -> Duration {
    Duration::from_secs(30)
}

fn default_dial_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_grpc_port() -> u16 {
    9090
}

fn default_http_port() -> u16 {
    8080
}

fn default_es_addresses() -> Vec<String> {
    vec!["http://localhost:9200".to_string()]
}

fn default_aggregator_flush_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_dependency_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_dependency_window() -> Duration {
    Duration::from_secs(300)
}

fn default_storage_batch_size() -> usize {
    1000
}

fn default_storage_flush_interval() -> Duration {
    Duration::from_secs(5)
}

// --- Default trait impls ---

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: String::new(),
            server_addr: default_server_addr(),
            probe_object_path: default_probe_object_path(),
            kubeconfig: String::new(),
            health_addr: default_agent_health_addr(),
            export: ExportConfig::default(),
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            queue_limit: default_queue_limit(),
            batch_size: default_batch_size(),
            flush_interval: default_flush_interval(),
            initial_backoff: default_initial_backoff(),
            max_backoff: default_max_backoff(),
            dial_timeout: default_dial_timeout(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            grpc_port: default_grpc_port(),
            http_port: default_http_port(),
            es_addresses: default_es_addresses(),
            aggregator_flush_interval: default_aggregator_flush_interval(),
            dependency_interval: default_dependency_interval(),
            dependency_window: default_dependency_window(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            batch_size: default_storage_batch_size(),
            flush_interval: default_storage_flush_interval(),
        }
    }
}

// --- Loading and validation ---

impl AgentConfig {
    /// Load configuration: optional YAML file, then environment overrides,
    /// then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => read_yaml(p)?,
            None => Self::default(),
        };
        cfg.apply_env();
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply the environment variables recognised by the agent.
    pub fn apply_env(&mut self) {
        if let Some(v) = env_nonempty("NODE_NAME") {
            self.node_name = v;
        }
        if let Some(v) = env_nonempty("SERVER_ADDR") {
            self.server_addr = v;
        }
        if let Some(v) = env_nonempty("EBPF_OBJECT_PATH") {
            self.probe_object_path = v;
        }
        if let Some(v) = env_nonempty("KUBECONFIG") {
            self.kubeconfig = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.node_name.is_empty() {
            bail!("node_name is required (set NODE_NAME)");
        }
        if self.server_addr.is_empty() {
            bail!("server_addr is required");
        }
        if self.probe_object_path.is_empty() {
            bail!("probe_object_path is required");
        }
        if self.export.queue_limit == 0 {
            bail!("export.queue_limit must be positive");
        }
        if self.export.batch_size == 0 {
            bail!("export.batch_size must be positive");
        }
        Ok(())
    }

    /// The collector endpoint as a gRPC URI, accepting both bare
    /// `host:port` (as deployed) and a full scheme.
    pub fn server_endpoint(&self) -> String {
        if self.server_addr.contains("://") {
            self.server_addr.clone()
        } else {
            format!("http://{}", self.server_addr)
        }
    }
}

impl ServerConfig {
    /// Load configuration: optional YAML file, then environment overrides,
    /// then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut cfg = match path {
            Some(p) => read_yaml(p)?,
            None => Self::default(),
        };
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Apply the environment variables recognised by the server.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_nonempty("GRPC_PORT") {
            self.grpc_port = v
                .parse()
                .with_context(|| format!("parsing GRPC_PORT {v:?}"))?;
        }
        if let Some(v) = env_nonempty("HTTP_PORT") {
            self.http_port = v
                .parse()
                .with_context(|| format!("parsing HTTP_PORT {v:?}"))?;
        }
        if let Some(v) = env_nonempty("ES_ADDRESSES") {
            self.es_addresses = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.es_addresses.is_empty() {
            bail!("es_addresses must not be empty");
        }
        if self.storage.batch_size == 0 {
            bail!("storage.batch_size must be positive");
        }
        Ok(())
    }
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    serde_yaml::from_str(&data).with_context(|| format!("parsing config file {}", path.display()))
}

fn env_nonempty(key: &str) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agent_defaults() {
        let cfg = AgentConfig::default();
        assert_eq!(cfg.server_addr, "http://nefi-server:9090");
        assert_eq!(cfg.probe_object_path, "/opt/nefi/bpf");
        assert_eq!(cfg.export.queue_limit, 10_000);
        assert_eq!(cfg.export.batch_size, 100);
        assert_eq!(cfg.export.flush_interval, Duration::from_millis(100));
        assert_eq!(cfg.export.initial_backoff, Duration::from_millis(500));
        assert_eq!(cfg.export.max_backoff, Duration::from_secs(30));
        assert_eq!(cfg.export.dial_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_agent_requires_node_name() {
        let cfg = AgentConfig::default();
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("node_name"));
    }

    #[test]
    fn test_server_endpoint_scheme() {
        let mut cfg = AgentConfig {
            node_name: "n1".to_string(),
            ..Default::default()
        };
        cfg.server_addr = "collector:9090".to_string();
        assert_eq!(cfg.server_endpoint(), "http://collector:9090");
        cfg.server_addr = "https://collector:9090".to_string();
        assert_eq!(cfg.server_endpoint(), "https://collector:9090");
    }

    #[test]
    fn test_server_defaults() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.grpc_port, 9090);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.es_addresses, vec!["http://localhost:9200"]);
        assert_eq!(cfg.aggregator_flush_interval, Duration::from_secs(30));
        assert_eq!(cfg.dependency_interval, Duration::from_secs(30));
        assert_eq!(cfg.dependency_window, Duration::from_secs(300));
        assert_eq!(cfg.storage.batch_size, 1000);
        assert_eq!(cfg.storage.flush_interval, Duration::from_secs(5));
    }

    #[test]
    fn test_agent_yaml_parse() {
        let yaml = r#"
node_name: worker-3
server_addr: collector.monitoring:9090
export:
  queue_limit: 500
  flush_interval: 250ms
"#;
        let cfg: AgentConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.node_name, "worker-3");
        assert_eq!(cfg.export.queue_limit, 500);
        assert_eq!(cfg.export.flush_interval, Duration::from_millis(250));
        assert_eq!(cfg.export.batch_size, 100);
    }
}
