use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Filters for querying stored connection or request events.
///
/// A `service` filter matches events whose source *or* destination service
/// equals the given name; `source`/`destination` pin one side exactly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventQuery {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Maximum rows to return; 0 means the adapter default.
    #[serde(default)]
    pub limit: usize,
}

/// Parameters for querying dependency links. A `service` filter matches
/// edges where the service appears as parent or child.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyQuery {
    #[serde(default)]
    pub service: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// Parameters for querying aggregated metric series.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricQuery {
    #[serde(default)]
    pub service: String,
    #[serde(default)]
    pub namespace: String,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    /// Requested resolution, passed through to the caller unchanged.
    #[serde(default)]
    pub step: String,
}
