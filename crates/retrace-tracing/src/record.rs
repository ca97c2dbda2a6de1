// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Buffer framing: the 32-byte trace header carried at the front of
//! every exported buffer, and the length-prefixed `(agent, buffer)`
//! record stream written to the collector's log file.

use std::io::{self, Read, Write};

use thiserror::Error;
use tracing::warn;

/// Size of an encoded [`TraceHeader`].
pub const TRACE_HEADER_LEN: usize = 32;

/// Records larger than this mark the end of a (possibly truncated)
/// stream rather than a real buffer.
pub const MAX_RECORD_LEN: u32 = 100 * 1024 * 1024;

/// Fixed header at the front of every buffer. Buffers from the same
/// agent and trace chain via `prev_buffer_id`; a buffer whose
/// `prev_buffer_id` equals its own `buffer_id` is a chain root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceHeader {
    pub trace_id: u64,
    pub buffer_id: i32,
    pub prev_buffer_id: i32,
    /// Position of this buffer within its chain, starting at 0.
    pub buffer_number: i32,
    /// Bytes of event data following the header.
    pub payload_len: u32,
}

#[derive(Debug, Error)]
pub enum HeaderError {
    #[error("buffer too small for trace header: {0} bytes")]
    Truncated(usize),
}

impl TraceHeader {
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.trace_id.to_le_bytes());
        out.extend_from_slice(&self.buffer_id.to_le_bytes());
        out.extend_from_slice(&self.prev_buffer_id.to_le_bytes());
        out.extend_from_slice(&self.buffer_number.to_le_bytes());
        out.extend_from_slice(&self.payload_len.to_le_bytes());
        out.extend_from_slice(&0u64.to_le_bytes());
    }

    pub fn decode(bytes: &[u8]) -> Result<TraceHeader, HeaderError> {
        if bytes.len() < TRACE_HEADER_LEN {
            return Err(HeaderError::Truncated(bytes.len()));
        }
        Ok(TraceHeader {
            trace_id: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            buffer_id: i32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            prev_buffer_id: i32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            buffer_number: i32::from_le_bytes(bytes[16..20].try_into().unwrap()),
            payload_len: u32::from_le_bytes(bytes[20..24].try_into().unwrap()),
        })
    }
}

/// Writes one `(agent, buffer)` record: two length-prefixed blobs, 4-byte
/// little-endian sizes.
pub fn write_record<W: Write>(w: &mut W, agent: &str, buffer: &[u8]) -> io::Result<()> {
    w.write_all(&(agent.len() as u32).to_le_bytes())?;
    w.write_all(agent.as_bytes())?;
    w.write_all(&(buffer.len() as u32).to_le_bytes())?;
    w.write_all(buffer)?;
    Ok(())
}

/// One record from a buffer log: the reporting agent's name and the raw
/// buffer bytes, trace header included.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub agent: String,
    pub data: Vec<u8>,
}

/// Reads a buffer log record stream, stopping at the first invalid
/// length prefix. Buffers too small to carry a trace header are skipped
/// with a warning; already-read records remain valid.
pub struct RecordReader<R> {
    inner: R,
}

impl<R: Read> RecordReader<R> {
    pub fn new(inner: R) -> Self {
        RecordReader { inner }
    }

    fn read_blob(&mut self) -> Option<Vec<u8>> {
        let mut prefix = [0u8; 4];
        self.inner.read_exact(&mut prefix).ok()?;
        let len = u32::from_le_bytes(prefix);
        if len == 0 || len > MAX_RECORD_LEN {
            warn!(len, "likely invalid record size, stopping");
            return None;
        }
        let mut blob = vec![0u8; len as usize];
        self.inner.read_exact(&mut blob).ok()?;
        Some(blob)
    }

    /// The next record, or `None` at end of stream (including a
    /// truncated or corrupt tail).
    pub fn read_next(&mut self) -> Option<LogRecord> {
        loop {
            let agent = self.read_blob()?;
            let data = self.read_blob()?;
            if data.len() < TRACE_HEADER_LEN {
                warn!(size = data.len(), "skipping undersized buffer record");
                continue;
            }
            return Some(LogRecord {
                agent: String::from_utf8_lossy(&agent).into_owned(),
                data,
            });
        }
    }
}

impl<R: Read> Iterator for RecordReader<R> {
    type Item = LogRecord;

    fn next(&mut self) -> Option<LogRecord> {
        self.read_next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn buffer_with_header(trace_id: u64, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        TraceHeader {
            trace_id,
            buffer_id: 3,
            prev_buffer_id: 3,
            buffer_number: 0,
            payload_len: payload.len() as u32,
        }
        .encode_into(&mut out);
        out.extend_from_slice(payload);
        out
    }

    #[test]
    fn header_roundtrip() {
        let header = TraceHeader {
            trace_id: 0xfeed,
            buffer_id: 7,
            prev_buffer_id: 3,
            buffer_number: 2,
            payload_len: 100,
        };
        let mut bytes = Vec::new();
        header.encode_into(&mut bytes);
        assert_eq!(bytes.len(), TRACE_HEADER_LEN);
        assert_eq!(TraceHeader::decode(&bytes).unwrap(), header);
    }

    #[test]
    fn record_roundtrip() {
        let mut log = Vec::new();
        let buf = buffer_with_header(9, b"abc");
        write_record(&mut log, "10.0.0.1:7001", &buf).unwrap();
        write_record(&mut log, "10.0.0.2:7001", &buf).unwrap();

        let records: Vec<_> = RecordReader::new(Cursor::new(log)).collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].agent, "10.0.0.1:7001");
        assert_eq!(records[1].agent, "10.0.0.2:7001");
        assert_eq!(records[0].data, buf);
    }

    #[test]
    fn truncated_tail_is_dropped() {
        let mut log = Vec::new();
        let buf = buffer_with_header(9, b"abcdef");
        write_record(&mut log, "a1", &buf).unwrap();
        write_record(&mut log, "a2", &buf).unwrap();
        log.truncate(log.len() - 4);

        let records: Vec<_> = RecordReader::new(Cursor::new(log)).collect();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn zero_length_prefix_ends_stream() {
        let mut log = Vec::new();
        write_record(&mut log, "a1", &buffer_with_header(9, b"x")).unwrap();
        log.extend_from_slice(&0u32.to_le_bytes());
        log.extend_from_slice(b"garbage");

        let records: Vec<_> = RecordReader::new(Cursor::new(log)).collect();
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn undersized_buffer_is_skipped() {
        let mut log = Vec::new();
        write_record(&mut log, "a1", b"tiny").unwrap();
        write_record(&mut log, "a2", &buffer_with_header(9, b"x")).unwrap();

        let records: Vec<_> = RecordReader::new(Cursor::new(log)).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].agent, "a2");
    }
}
