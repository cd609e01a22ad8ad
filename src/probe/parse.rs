//! Decoding of raw probe records into typed events.
//!
//! Records arrive as opaque byte slices from the per-CPU buffers. Length
//! is checked once per record against the declared struct size, then
//! fixed-width little-endian reads happen at offsets derived from the
//! record layout.

use std::net::Ipv4Addr;

use chrono::DateTime;
use thiserror::Error;

use crate::model::{ConnectionEvent, Endpoint, HttpMethod, Protocol, RequestEvent};

use super::record::{conn_offsets, request_offsets, CONN_RECORD_SIZE, PATH_LEN, REQUEST_RECORD_SIZE};

/// Errors that can occur while decoding a probe record.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("{kind} record too short: {size} bytes, expected {expected}")]
    Truncated {
        kind: &'static str,
        size: usize,
        expected: usize,
    },
}

/// Decode a connection record. The node field is left empty; the agent
/// stamps it after enrichment.
pub fn parse_connection(data: &[u8]) -> Result<ConnectionEvent, ParseError> {
    if data.len() < CONN_RECORD_SIZE {
        return Err(ParseError::Truncated {
            kind: "connection",
            size: data.len(),
            expected: CONN_RECORD_SIZE,
        });
    }

    Ok(ConnectionEvent {
        timestamp: DateTime::from_timestamp_nanos(
            read_u64_le(data, conn_offsets::TIMESTAMP_NS) as i64
        ),
        node: String::new(),
        source: Endpoint::from_addr(
            read_ipv4(data, conn_offsets::SRC_IP),
            read_u16_le(data, conn_offsets::SRC_PORT),
        ),
        destination: Endpoint::from_addr(
            read_ipv4(data, conn_offsets::DST_IP),
            read_u16_le(data, conn_offsets::DST_PORT),
        ),
        bytes_sent: read_u64_le(data, conn_offsets::BYTES_SENT),
        bytes_recv: read_u64_le(data, conn_offsets::BYTES_RECV),
        duration_ns: read_u64_le(data, conn_offsets::DURATION_NS),
        retransmits: read_u32_le(data, conn_offsets::RETRANSMITS),
        protocol: Protocol::from_u8(read_u8(data, conn_offsets::PROTOCOL)),
    })
}

/// Decode a request record. The path is truncated at its first NUL.
pub fn parse_request(data: &[u8]) -> Result<RequestEvent, ParseError> {
    if data.len() < REQUEST_RECORD_SIZE {
        return Err(ParseError::Truncated {
            kind: "request",
            size: data.len(),
            expected: REQUEST_RECORD_SIZE,
        });
    }

    let path_bytes = data
        .get(request_offsets::PATH..request_offsets::PATH + PATH_LEN)
        .unwrap_or(&[]);
    let path_len = path_bytes
        .iter()
        .position(|&b| b == 0)
        .unwrap_or(path_bytes.len());
    let path = String::from_utf8_lossy(path_bytes.get(..path_len).unwrap_or(&[])).into_owned();

    Ok(RequestEvent {
        timestamp: DateTime::from_timestamp_nanos(
            read_u64_le(data, request_offsets::TIMESTAMP_NS) as i64,
        ),
        node: String::new(),
        source: Endpoint::from_addr(
            read_ipv4(data, request_offsets::SRC_IP),
            read_u16_le(data, request_offsets::SRC_PORT),
        ),
        destination: Endpoint::from_addr(
            read_ipv4(data, request_offsets::DST_IP),
            read_u16_le(data, request_offsets::DST_PORT),
        ),
        method: HttpMethod::from_u8(read_u8(data, request_offsets::METHOD)),
        path,
        status_code: read_u16_le(data, request_offsets::STATUS_CODE),
        latency_ns: read_u64_le(data, request_offsets::LATENCY_NS),
        protocol: "HTTP".to_string(),
    })
}

// ---------------------------------------------------------------------------
// Byte-reading helpers
// ---------------------------------------------------------------------------

#[inline(always)]
fn read_u8(data: &[u8], offset: usize) -> u8 {
    debug_assert!(offset < data.len());
    // Safety: callers verify record length against the struct size before
    // reading fixed offsets.
    unsafe { *data.as_ptr().add(offset) }
}

#[inline(always)]
fn read_u16_le(data: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes(read_fixed::<2>(data, offset))
}

#[inline(always)]
fn read_u32_le(data: &[u8], offset: usize) -> u32 {
    u32::from_le_bytes(read_fixed::<4>(data, offset))
}

#[inline(always)]
fn read_u64_le(data: &[u8], offset: usize) -> u64 {
    u64::from_le_bytes(read_fixed::<8>(data, offset))
}

#[inline(always)]
fn read_fixed<const N: usize>(data: &[u8], offset: usize) -> [u8; N] {
    debug_assert!(offset + N <= data.len());
    // Safety: callers ensure `offset + N <= data.len()` via the upfront
    // record-size check.
    unsafe { (data.as_ptr().add(offset) as *const [u8; N]).read_unaligned() }
}

/// The kernel stores IPv4 addresses in network byte order; the raw bytes
/// are therefore already the dotted-quad octets.
#[inline(always)]
fn read_ipv4(data: &[u8], offset: usize) -> String {
    let b = read_fixed::<4>(data, offset);
    Ipv4Addr::new(b[0], b[1], b[2], b[3]).to_string()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    /// Build a connection record with the given field values.
    pub(crate) fn conn_record(
        ts: u64,
        src: ([u8; 4], u16),
        dst: ([u8; 4], u16),
        bytes_sent: u64,
        bytes_recv: u64,
        duration_ns: u64,
        retransmits: u32,
        protocol: u8,
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(CONN_RECORD_SIZE);
        buf.extend_from_slice(&ts.to_le_bytes());
        buf.extend_from_slice(&src.0);
        buf.extend_from_slice(&dst.0);
        buf.extend_from_slice(&src.1.to_le_bytes());
        buf.extend_from_slice(&dst.1.to_le_bytes());
        buf.extend_from_slice(&bytes_sent.to_le_bytes());
        buf.extend_from_slice(&bytes_recv.to_le_bytes());
        buf.extend_from_slice(&duration_ns.to_le_bytes());
        buf.extend_from_slice(&retransmits.to_le_bytes());
        buf.push(protocol);
        buf
    }

    /// Build a request record with the given field values.
    pub(crate) fn request_record(
        ts: u64,
        src: ([u8; 4], u16),
        dst: ([u8; 4], u16),
        method: u8,
        status_code: u16,
        latency_ns: u64,
        path: &[u8],
    ) -> Vec<u8> {
        let mut buf = Vec::with_capacity(REQUEST_RECORD_SIZE);
        buf.extend_from_slice(&ts.to_le_bytes());
        buf.extend_from_slice(&src.0);
        buf.extend_from_slice(&dst.0);
        buf.extend_from_slice(&src.1.to_le_bytes());
        buf.extend_from_slice(&dst.1.to_le_bytes());
        buf.push(method);
        buf.extend_from_slice(&status_code.to_le_bytes());
        buf.extend_from_slice(&latency_ns.to_le_bytes());
        let mut path_buf = [0u8; PATH_LEN];
        path_buf[..path.len()].copy_from_slice(path);
        buf.extend_from_slice(&path_buf);
        buf
    }

    #[test]
    fn test_connection_truncated() {
        let err = parse_connection(&[0u8; 10]).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Truncated {
                kind: "connection",
                size: 10,
                expected: 49,
            }
        ));
    }

    #[test]
    fn test_connection_empty() {
        assert!(parse_connection(&[]).is_err());
    }

    #[test]
    fn test_connection_decodes_fields() {
        let data = conn_record(
            1_700_000_000_000_000_000,
            ([10, 0, 0, 5], 43_210),
            ([10, 0, 1, 7], 443),
            1024,
            8192,
            5_000_000,
            3,
            6,
        );
        let ev = parse_connection(&data).unwrap();
        assert_eq!(
            ev.timestamp.timestamp_nanos_opt().unwrap(),
            1_700_000_000_000_000_000
        );
        assert_eq!(ev.source.ip, "10.0.0.5");
        assert_eq!(ev.source.port, 43_210);
        assert_eq!(ev.destination.ip, "10.0.1.7");
        assert_eq!(ev.destination.port, 443);
        assert_eq!(ev.bytes_sent, 1024);
        assert_eq!(ev.bytes_recv, 8192);
        assert_eq!(ev.duration_ns, 5_000_000);
        assert_eq!(ev.retransmits, 3);
        assert_eq!(ev.protocol, Protocol::Tcp);
        assert!(ev.node.is_empty());
        assert!(ev.source.service.is_empty());
    }

    #[test]
    fn test_connection_udp_protocol() {
        let data = conn_record(1, ([1, 2, 3, 4], 53), ([5, 6, 7, 8], 53), 0, 0, 0, 0, 17);
        let ev = parse_connection(&data).unwrap();
        assert_eq!(ev.protocol, Protocol::Udp);
    }

    #[test]
    fn test_connection_exact_minimum_size() {
        let data = conn_record(1, ([0; 4], 0), ([0; 4], 0), 0, 0, 0, 0, 6);
        assert_eq!(data.len(), CONN_RECORD_SIZE);
        assert!(parse_connection(&data).is_ok());

        let short = &data[..CONN_RECORD_SIZE - 1];
        assert!(parse_connection(short).is_err());
    }

    #[test]
    fn test_connection_trailing_pad_ignored() {
        let mut data = conn_record(1, ([0; 4], 0), ([0; 4], 0), 0, 0, 0, 0, 6);
        data.extend_from_slice(&[0xFF; 3]); // probe struct pad
        assert!(parse_connection(&data).is_ok());
    }

    #[test]
    fn test_request_truncated() {
        let err = parse_request(&[0u8; 31]).unwrap_err();
        assert!(matches!(
            err,
            ParseError::Truncated {
                kind: "request",
                expected: 159,
                ..
            }
        ));
    }

    #[test]
    fn test_request_decodes_fields() {
        let data = request_record(
            42,
            ([10, 0, 0, 1], 55_000),
            ([10, 0, 0, 2], 8080),
            2,
            503,
            7_500_000,
            b"/v1/orders",
        );
        let ev = parse_request(&data).unwrap();
        assert_eq!(ev.method, HttpMethod::Post);
        assert_eq!(ev.path, "/v1/orders");
        assert_eq!(ev.status_code, 503);
        assert_eq!(ev.latency_ns, 7_500_000);
        assert_eq!(ev.source.port, 55_000);
        assert_eq!(ev.destination.ip, "10.0.0.2");
        assert_eq!(ev.protocol, "HTTP");
    }

    #[test]
    fn test_request_unknown_method() {
        let data = request_record(1, ([0; 4], 0), ([0; 4], 0), 42, 200, 1, b"/");
        let ev = parse_request(&data).unwrap();
        assert_eq!(ev.method, HttpMethod::Unknown);
    }

    #[test]
    fn test_request_path_truncated_at_nul() {
        let mut path = [0u8; PATH_LEN];
        path[0] = b'/';
        path[1] = b'a';
        path[2] = 0;
        path[3] = b'b'; // ignored
        let data = request_record(1, ([0; 4], 0), ([0; 4], 0), 1, 200, 1, &path);
        let ev = parse_request(&data).unwrap();
        assert_eq!(ev.path, "/a");
    }

    #[test]
    fn test_request_full_length_path() {
        let path = [b'x'; PATH_LEN];
        let data = request_record(1, ([0; 4], 0), ([0; 4], 0), 1, 200, 1, &path);
        let ev = parse_request(&data).unwrap();
        assert_eq!(ev.path.len(), PATH_LEN);
    }
}
