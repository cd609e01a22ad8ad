//! Probe object loading, kernel attachment, and per-CPU buffer reading.

use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use aya::maps::perf::{AsyncPerfEventArray, AsyncPerfEventArrayBuffer};
use aya::maps::MapData;
use aya::programs::{KProbe, TracePoint};
use aya::Ebpf;
use bytes::BytesMut;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::parse::{parse_connection, parse_request};
use super::{ProbeEvent, ProbeStats, RecordKind, EVENT_CHANNEL_CAPACITY};

/// How a probe program attaches to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HookKind {
    Tracepoint,
    Kprobe,
    Kretprobe,
}

/// One row of the static attachment table: program name in the probe
/// object, hook kind, and the tracepoint group/name or kernel symbol.
struct ProgramAttach {
    prog: &'static str,
    kind: HookKind,
    group: &'static str,
    name: &'static str,
}

/// All known probe programs. Programs absent from a loaded object are
/// skipped; attach failures are warnings because different kernels expose
/// different hooks.
const ATTACH_TABLE: &[ProgramAttach] = &[
    // connection tracker
    ProgramAttach {
        prog: "trace_inet_sock_set_state",
        kind: HookKind::Tracepoint,
        group: "sock",
        name: "inet_sock_set_state",
    },
    ProgramAttach {
        prog: "trace_tcp_retransmit",
        kind: HookKind::Tracepoint,
        group: "tcp",
        name: "tcp_retransmit_skb",
    },
    // http parser
    ProgramAttach {
        prog: "trace_tcp_sendmsg",
        kind: HookKind::Kprobe,
        group: "",
        name: "tcp_sendmsg",
    },
    ProgramAttach {
        prog: "trace_tcp_recvmsg_enter",
        kind: HookKind::Kprobe,
        group: "",
        name: "tcp_recvmsg",
    },
    ProgramAttach {
        prog: "trace_tcp_recvmsg_exit",
        kind: HookKind::Kretprobe,
        group: "",
        name: "tcp_recvmsg",
    },
    // dns tracker
    ProgramAttach {
        prog: "trace_udp_sendmsg",
        kind: HookKind::Kprobe,
        group: "",
        name: "udp_sendmsg",
    },
];

/// Map names holding the per-CPU event buffers.
const CONN_MAP: &str = "conn_events";
const REQUEST_MAP: &str = "http_events";

/// Per-CPU read buffers handed to each `read_events` call.
const READ_BUFFERS: usize = 16;
const READ_BUFFER_CAPACITY: usize = 256;

/// Loads compiled probe objects, attaches their programs, and decodes
/// records from the per-CPU buffers onto a bounded channel.
pub struct Loader {
    obj_path: PathBuf,
    stats: Arc<ProbeStats>,
    ebpfs: Vec<Ebpf>,
    read_tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Loader {
    pub fn new(obj_path: impl Into<PathBuf>, stats: Arc<ProbeStats>) -> Self {
        Self {
            obj_path: obj_path.into(),
            stats,
            ebpfs: Vec::new(),
            read_tasks: Vec::new(),
        }
    }

    /// Load probe objects, attach programs, open per-CPU readers, and
    /// start the decode loops. Returns the decoded-event channel.
    ///
    /// Fails only when nothing usable was found: no object loads, or no
    /// event buffer opens. Anything less is a degraded start.
    pub async fn start(&mut self, cancel: CancellationToken) -> Result<mpsc::Receiver<ProbeEvent>> {
        let paths = discover_objects(&self.obj_path)
            .with_context(|| format!("discovering probe objects at {}", self.obj_path.display()))?;
        if paths.is_empty() {
            bail!("no probe object files found at {}", self.obj_path.display());
        }

        let mut conn_events: Option<AsyncPerfEventArray<MapData>> = None;
        let mut request_events: Option<AsyncPerfEventArray<MapData>> = None;
        let mut attached = 0usize;

        for path in &paths {
            let mut ebpf = match Ebpf::load_file(path) {
                Ok(e) => e,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to load probe object, skipping");
                    continue;
                }
            };

            attached += attach_programs(&mut ebpf, path);

            if conn_events.is_none() {
                if let Some(map) = ebpf.take_map(CONN_MAP) {
                    match AsyncPerfEventArray::try_from(map) {
                        Ok(arr) => conn_events = Some(arr),
                        Err(e) => warn!(error = %e, "failed to open {CONN_MAP} buffer"),
                    }
                }
            }
            if request_events.is_none() {
                if let Some(map) = ebpf.take_map(REQUEST_MAP) {
                    match AsyncPerfEventArray::try_from(map) {
                        Ok(arr) => request_events = Some(arr),
                        Err(e) => warn!(error = %e, "failed to open {REQUEST_MAP} buffer"),
                    }
                }
            }

            self.ebpfs.push(ebpf);
        }

        if self.ebpfs.is_empty() {
            bail!("no probe object could be loaded from {}", self.obj_path.display());
        }
        if conn_events.is_none() && request_events.is_none() {
            bail!(
                "no event buffer could be opened from probe objects at {}",
                self.obj_path.display()
            );
        }

        info!(
            objects = self.ebpfs.len(),
            programs_attached = attached,
            conn_events = conn_events.is_some(),
            http_events = request_events.is_some(),
            "probe objects loaded and attached",
        );

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);

        if let Some(arr) = conn_events {
            self.spawn_readers(arr, RecordKind::Connection, tx.clone(), &cancel)?;
        }
        if let Some(arr) = request_events {
            self.spawn_readers(arr, RecordKind::Request, tx.clone(), &cancel)?;
        }
        // Decode loops hold the only remaining senders; when they exit the
        // channel closes and downstream sees end-of-stream.
        drop(tx);

        Ok(rx)
    }

    /// Stop the decode loops and release kernel resources: links detach
    /// and maps close when the loaded objects drop, after the readers have
    /// exited.
    pub async fn stop(&mut self) {
        for task in self.read_tasks.drain(..) {
            if let Err(e) = task.await {
                warn!(error = %e, "probe read task panicked");
            }
        }
        let detached = self.ebpfs.len();
        self.ebpfs.clear();
        info!(objects = detached, "probe loader stopped");
    }

    fn spawn_readers(
        &mut self,
        mut array: AsyncPerfEventArray<MapData>,
        kind: RecordKind,
        tx: mpsc::Sender<ProbeEvent>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cpus = aya::util::online_cpus()
            .map_err(|e| anyhow::anyhow!("reading online CPUs: {e:?}"))?;

        for cpu in cpus {
            let buf = array
                .open(cpu, None)
                .with_context(|| format!("opening {} buffer on cpu {cpu}", kind.as_str()))?;
            let task = tokio::spawn(read_loop(
                buf,
                kind,
                tx.clone(),
                Arc::clone(&self.stats),
                cancel.clone(),
            ));
            self.read_tasks.push(task);
        }

        // Each opened buffer keeps the underlying map alive; the array
        // handle itself can drop here.
        Ok(())
    }
}

/// Find probe object files: every `*.o` under a directory, or the path
/// itself when it is a file.
fn discover_objects(path: &Path) -> Result<Vec<PathBuf>> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(vec![path.to_path_buf()]);
    }

    let mut objects = Vec::new();
    for entry in std::fs::read_dir(path)? {
        let entry = entry?;
        let p = entry.path();
        if p.extension().is_some_and(|ext| ext == "o") {
            objects.push(p);
        }
    }
    objects.sort();
    Ok(objects)
}

/// Attach every table program present in the object. Returns the number
/// of successful attachments.
fn attach_programs(ebpf: &mut Ebpf, path: &Path) -> usize {
    let mut attached = 0;

    for row in ATTACH_TABLE {
        if ebpf.program_mut(row.prog).is_none() {
            continue;
        }

        let result = match row.kind {
            HookKind::Tracepoint => attach_tracepoint(ebpf, row.prog, row.group, row.name),
            HookKind::Kprobe | HookKind::Kretprobe => attach_kprobe(ebpf, row.prog, row.name),
        };

        match result {
            Ok(()) => {
                attached += 1;
                debug!(
                    program = row.prog,
                    target = %format_target(row),
                    "attached probe program",
                );
            }
            Err(e) => {
                warn!(
                    program = row.prog,
                    target = %format_target(row),
                    path = %path.display(),
                    error = %e,
                    "failed to attach probe program",
                );
            }
        }
    }

    attached
}

fn format_target(row: &ProgramAttach) -> String {
    if row.group.is_empty() {
        row.name.to_string()
    } else {
        format!("{}/{}", row.group, row.name)
    }
}

fn attach_tracepoint(ebpf: &mut Ebpf, prog_name: &str, group: &str, name: &str) -> Result<()> {
    let prog: &mut TracePoint = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow::anyhow!("program '{prog_name}' not found"))?
        .try_into()
        .with_context(|| format!("'{prog_name}' is not a tracepoint program"))?;
    prog.load()
        .with_context(|| format!("loading tracepoint {group}/{name}"))?;
    prog.attach(group, name)
        .with_context(|| format!("attaching tracepoint {group}/{name}"))?;
    Ok(())
}

/// Programs in a `kretprobe/` section are detected by aya and attached as
/// return probes automatically.
fn attach_kprobe(ebpf: &mut Ebpf, prog_name: &str, symbol: &str) -> Result<()> {
    let prog: &mut KProbe = ebpf
        .program_mut(prog_name)
        .ok_or_else(|| anyhow::anyhow!("program '{prog_name}' not found"))?
        .try_into()
        .with_context(|| format!("'{prog_name}' is not a kprobe program"))?;
    prog.load()
        .with_context(|| format!("loading kprobe {symbol}"))?;
    prog.attach(symbol, 0)
        .with_context(|| format!("attaching kprobe {symbol}"))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Per-CPU decode loop
// ---------------------------------------------------------------------------

async fn read_loop(
    mut buf: AsyncPerfEventArrayBuffer<MapData>,
    kind: RecordKind,
    tx: mpsc::Sender<ProbeEvent>,
    stats: Arc<ProbeStats>,
    cancel: CancellationToken,
) {
    let mut buffers: Vec<BytesMut> = (0..READ_BUFFERS)
        .map(|_| BytesMut::with_capacity(READ_BUFFER_CAPACITY))
        .collect();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            result = buf.read_events(&mut buffers) => {
                let events = match result {
                    Ok(events) => events,
                    Err(e) => {
                        stats.read_errors.fetch_add(1, Ordering::Relaxed);
                        warn!(kind = kind.as_str(), error = %e, "perf buffer read error");
                        continue;
                    }
                };

                if events.lost > 0 {
                    stats
                        .lost_samples
                        .fetch_add(events.lost as u64, Ordering::Relaxed);
                    warn!(kind = kind.as_str(), count = events.lost, "lost probe samples");
                }

                for data in buffers.iter().take(events.read) {
                    let event = match decode(kind, data) {
                        Ok(ev) => ev,
                        Err(e) => {
                            stats.decode_errors.fetch_add(1, Ordering::Relaxed);
                            debug!(kind = kind.as_str(), error = %e, "record decode error");
                            continue;
                        }
                    };

                    stats.decoded.fetch_add(1, Ordering::Relaxed);

                    tokio::select! {
                        _ = cancel.cancelled() => return,
                        sent = tx.send(event) => {
                            if sent.is_err() {
                                // Receiver gone; nothing left to decode for.
                                return;
                            }
                        }
                    }
                }
            }
        }
    }
}

fn decode(kind: RecordKind, data: &[u8]) -> Result<ProbeEvent, super::parse::ParseError> {
    match kind {
        RecordKind::Connection => parse_connection(data).map(ProbeEvent::Connection),
        RecordKind::Request => parse_request(data).map(ProbeEvent::Request),
    }
}
