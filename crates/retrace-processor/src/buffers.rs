// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Loading raw buffers from a collector log file.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use tracing::warn;

use retrace_tracing::record::{RecordReader, TraceHeader, TRACE_HEADER_LEN};

/// One exported buffer: the agent that reported it, its decoded trace
/// header, and the full record bytes (header included).
#[derive(Debug, Clone)]
pub struct RawBuffer {
    pub agent: String,
    pub header: TraceHeader,
    pub data: Vec<u8>,
}

impl RawBuffer {
    /// The event bytes, trace header stripped.
    pub fn payload(&self) -> &[u8] {
        &self.data[TRACE_HEADER_LEN..]
    }
}

/// Reads every parseable buffer record. Stops at the first invalid
/// length prefix; buffers already read remain valid.
pub fn read_buffers<R: Read>(reader: R) -> Vec<RawBuffer> {
    let mut out = Vec::new();
    for record in RecordReader::new(reader) {
        match TraceHeader::decode(&record.data) {
            Ok(header) => out.push(RawBuffer {
                agent: record.agent,
                header,
                data: record.data,
            }),
            Err(e) => warn!("skipping buffer with invalid header: {e}"),
        }
    }
    out
}

pub fn read_buffers_from_path<P: AsRef<Path>>(path: P) -> io::Result<Vec<RawBuffer>> {
    let file = File::open(path)?;
    Ok(read_buffers(BufReader::new(file)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use retrace_tracing::record::write_record;
    use std::io::Cursor;

    fn record_bytes(trace_id: u64, buffer_id: i32, payload: &[u8]) -> Vec<u8> {
        let mut data = Vec::new();
        TraceHeader {
            trace_id,
            buffer_id,
            prev_buffer_id: buffer_id,
            buffer_number: 0,
            payload_len: payload.len() as u32,
        }
        .encode_into(&mut data);
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn reads_all_records() {
        let mut log = Vec::new();
        write_record(&mut log, "a1", &record_bytes(1, 0, b"xy")).unwrap();
        write_record(&mut log, "a2", &record_bytes(2, 1, b"z")).unwrap();

        let buffers = read_buffers(Cursor::new(log));
        assert_eq!(buffers.len(), 2);
        assert_eq!(buffers[0].header.trace_id, 1);
        assert_eq!(buffers[0].payload(), b"xy");
        assert_eq!(buffers[1].agent, "a2");
    }

    #[test]
    fn truncation_keeps_complete_records() {
        let mut log = Vec::new();
        write_record(&mut log, "a1", &record_bytes(1, 0, b"xy")).unwrap();
        write_record(&mut log, "a1", &record_bytes(2, 1, b"zw")).unwrap();
        log.truncate(log.len() - 4);

        let buffers = read_buffers(Cursor::new(log));
        assert_eq!(buffers.len(), 1);
        assert_eq!(buffers[0].header.trace_id, 1);
    }
}
