pub mod event;
pub mod query;
pub mod storage;

pub use event::{
    ConnectionEvent, DependencyLink, Endpoint, HttpMethod, Protocol, RequestEvent,
    TimeSeriesPoint,
};
pub use query::{DependencyQuery, EventQuery, MetricQuery};
pub use storage::{
    DependencyReader, DependencyWriter, EventReader, EventWriter, MetricKind, MetricReader,
    MetricWriter, ServiceReader, StorageError, StorageResult,
};
