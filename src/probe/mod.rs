pub mod parse;
pub mod record;

#[cfg(feature = "bpf")]
mod loader;

#[cfg(feature = "bpf")]
pub use loader::Loader;

use std::sync::atomic::{AtomicU64, Ordering};

use crate::model::{ConnectionEvent, RequestEvent};

/// Capacity of the decoded-event channel between the probe loader and the
/// enrichment loop.
pub const EVENT_CHANNEL_CAPACITY: usize = 4096;

/// A decoded probe event. The variant tag is preserved end to end so the
/// collector can classify metrics without re-inspecting payloads.
#[derive(Debug, Clone)]
pub enum ProbeEvent {
    Connection(ConnectionEvent),
    Request(RequestEvent),
}

/// Which per-CPU buffer a record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    Connection,
    Request,
}

impl RecordKind {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Connection => "connection",
            Self::Request => "request",
        }
    }
}

/// Lock-free counters for the decode path, read periodically for
/// diagnostics and metrics.
#[derive(Debug, Default)]
pub struct ProbeStats {
    /// Records decoded into events.
    pub decoded: AtomicU64,
    /// Records rejected by the decoder.
    pub decode_errors: AtomicU64,
    /// Samples the kernel dropped before user space could read them.
    pub lost_samples: AtomicU64,
    /// Errors reading from the per-CPU buffers.
    pub read_errors: AtomicU64,
}

impl ProbeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> ProbeStatsSnapshot {
        ProbeStatsSnapshot {
            decoded: self.decoded.load(Ordering::Relaxed),
            decode_errors: self.decode_errors.load(Ordering::Relaxed),
            lost_samples: self.lost_samples.load(Ordering::Relaxed),
            read_errors: self.read_errors.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time view of the decode counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ProbeStatsSnapshot {
    pub decoded: u64,
    pub decode_errors: u64,
    pub lost_samples: u64,
    pub read_errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_snapshot() {
        let stats = ProbeStats::new();
        stats.decoded.fetch_add(3, Ordering::Relaxed);
        stats.lost_samples.fetch_add(7, Ordering::Relaxed);

        let snap = stats.snapshot();
        assert_eq!(snap.decoded, 3);
        assert_eq!(snap.lost_samples, 7);
        assert_eq!(snap.decode_errors, 0);
        assert_eq!(snap.read_errors, 0);
    }
}
