//! Raw record layouts shared with the kernel probes.
//!
//! These mirror the packed structs the probes emit into the per-CPU
//! buffers (`conn_event` and `http_event` in the probe headers). The
//! layouts are the contract between two independently compiled
//! artifacts: sizes are asserted at compile time and parsing offsets are
//! derived from the declared structs, never hand-written.

use std::mem;

/// Connection close record. Little-endian, packed. A trailing 3-byte pad
/// in the probe struct is not part of the meaningful payload.
#[repr(C, packed)]
pub struct ConnRecord {
    pub timestamp_ns: u64,
    /// IPv4 address bytes in network order, as stored by the kernel.
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
    pub bytes_sent: u64,
    pub bytes_recv: u64,
    pub duration_ns: u64,
    pub retransmits: u32,
    pub protocol: u8,
}

/// HTTP exchange record. Little-endian, packed. `path` is NUL-terminated.
#[repr(C, packed)]
pub struct RequestRecord {
    pub timestamp_ns: u64,
    pub src_ip: [u8; 4],
    pub dst_ip: [u8; 4],
    pub src_port: u16,
    pub dst_port: u16,
    pub method: u8,
    pub status_code: u16,
    pub latency_ns: u64,
    pub path: [u8; PATH_LEN],
}

/// Fixed capacity of the request path field.
pub const PATH_LEN: usize = 128;

/// Minimum byte length of a connection record.
pub const CONN_RECORD_SIZE: usize = mem::size_of::<ConnRecord>();

/// Minimum byte length of a request record.
pub const REQUEST_RECORD_SIZE: usize = mem::size_of::<RequestRecord>();

// Layout guards: a drift between the probe headers and these mirrors must
// fail the build, not corrupt decoded events.
const _: () = assert!(CONN_RECORD_SIZE == 49);
const _: () = assert!(REQUEST_RECORD_SIZE == 159);

pub mod conn_offsets {
    use super::ConnRecord;
    use std::mem::offset_of;

    pub const TIMESTAMP_NS: usize = offset_of!(ConnRecord, timestamp_ns);
    pub const SRC_IP: usize = offset_of!(ConnRecord, src_ip);
    pub const DST_IP: usize = offset_of!(ConnRecord, dst_ip);
    pub const SRC_PORT: usize = offset_of!(ConnRecord, src_port);
    pub const DST_PORT: usize = offset_of!(ConnRecord, dst_port);
    pub const BYTES_SENT: usize = offset_of!(ConnRecord, bytes_sent);
    pub const BYTES_RECV: usize = offset_of!(ConnRecord, bytes_recv);
    pub const DURATION_NS: usize = offset_of!(ConnRecord, duration_ns);
    pub const RETRANSMITS: usize = offset_of!(ConnRecord, retransmits);
    pub const PROTOCOL: usize = offset_of!(ConnRecord, protocol);
}

pub mod request_offsets {
    use super::RequestRecord;
    use std::mem::offset_of;

    pub const TIMESTAMP_NS: usize = offset_of!(RequestRecord, timestamp_ns);
    pub const SRC_IP: usize = offset_of!(RequestRecord, src_ip);
    pub const DST_IP: usize = offset_of!(RequestRecord, dst_ip);
    pub const SRC_PORT: usize = offset_of!(RequestRecord, src_port);
    pub const DST_PORT: usize = offset_of!(RequestRecord, dst_port);
    pub const METHOD: usize = offset_of!(RequestRecord, method);
    pub const STATUS_CODE: usize = offset_of!(RequestRecord, status_code);
    pub const LATENCY_NS: usize = offset_of!(RequestRecord, latency_ns);
    pub const PATH: usize = offset_of!(RequestRecord, path);
}
