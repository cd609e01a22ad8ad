use std::collections::BTreeSet;
use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use super::event::{ConnectionEvent, DependencyLink, RequestEvent, TimeSeriesPoint};
use super::query::{DependencyQuery, EventQuery, MetricQuery};

/// Errors surfaced by storage adapters. Transport and status errors are
/// transient from the pipeline's point of view: callers log them and keep
/// their bounded buffers rather than aborting.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("storage transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("storage returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("encoding storage document: {0}")]
    Encode(#[from] serde_json::Error),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// The class of an aggregated metric series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricKind {
    Latency,
    CallRate,
    ErrorRate,
    Traffic,
}

impl MetricKind {
    /// Returns the `metricType` value stored with each point.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Latency => "latency",
            Self::CallRate => "call_rate",
            Self::ErrorRate => "error_rate",
            Self::Traffic => "traffic",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writes raw events.
#[async_trait]
pub trait EventWriter: Send + Sync {
    async fn write_connections(&self, events: &[ConnectionEvent]) -> StorageResult<()>;
    async fn write_requests(&self, events: &[RequestEvent]) -> StorageResult<()>;
}

/// Reads raw events. Results are sorted by descending timestamp.
#[async_trait]
pub trait EventReader: Send + Sync {
    async fn find_connections(&self, query: &EventQuery) -> StorageResult<Vec<ConnectionEvent>>;
    async fn find_requests(&self, query: &EventQuery) -> StorageResult<Vec<RequestEvent>>;
}

/// Writes dependency links, stamped with the write time.
#[async_trait]
pub trait DependencyWriter: Send + Sync {
    async fn write_dependencies(&self, links: &[DependencyLink]) -> StorageResult<()>;
}

/// Reads dependency links.
#[async_trait]
pub trait DependencyReader: Send + Sync {
    async fn get_dependencies(&self, query: &DependencyQuery) -> StorageResult<Vec<DependencyLink>>;
}

/// Writes aggregated metric points of one kind.
#[async_trait]
pub trait MetricWriter: Send + Sync {
    async fn write_metrics(&self, points: &[TimeSeriesPoint], kind: MetricKind)
        -> StorageResult<()>;
}

/// Reads aggregated metric series, sorted by ascending timestamp.
#[async_trait]
pub trait MetricReader: Send + Sync {
    async fn get_latencies(&self, query: &MetricQuery) -> StorageResult<Vec<TimeSeriesPoint>>;
    async fn get_call_rates(&self, query: &MetricQuery) -> StorageResult<Vec<TimeSeriesPoint>>;
    async fn get_error_rates(&self, query: &MetricQuery) -> StorageResult<Vec<TimeSeriesPoint>>;
}

/// Reads service metadata derived from stored events.
#[async_trait]
pub trait ServiceReader: Send + Sync {
    async fn list_services(&self) -> StorageResult<BTreeSet<String>>;
    async fn list_operations(&self, service: &str) -> StorageResult<BTreeSet<String>>;
}
