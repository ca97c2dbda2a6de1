// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-trace recording state: a span-shaped event encoder over the
//! agent's scratch buffers.
//!
//! One handle exists per request and is *not* thread-safe; the request
//! state machine guarantees a handle is only ever touched by the handler
//! that owns its request. Every write first tries a non-blocking append
//! to the current buffer and falls back to a rollover path that links a
//! fresh buffer via `prev_buffer_id`. Dropping the handle seals the last
//! buffer and hands the trace back to the agent.

use std::sync::Arc;

use crate::agent::{AgentCore, SealedBuffer};
use crate::clock::ticks;
use crate::events::{EventRecord, EventType};
use crate::names;
use crate::record::{TraceHeader, TRACE_HEADER_LEN};
use crate::value::Value;

pub struct TraceState {
    core: Arc<AgentCore>,
    trace_id: u64,
    parent_span_id: u64,
    recording: bool,
    head_sampled: bool,
    buf: Vec<u8>,
    capacity: usize,
    buffer_id: i32,
    prev_buffer_id: i32,
    buffer_number: i32,
}

impl TraceState {
    pub(crate) fn begin(
        core: Arc<AgentCore>,
        trace_id: u64,
        parent_span_id: u64,
        recording: bool,
        head_sampled: bool,
    ) -> TraceState {
        let capacity = core.config.buffer_size.saturating_sub(TRACE_HEADER_LEN).max(64);
        let buffer_id = core.next_buffer_id();
        TraceState {
            core,
            trace_id,
            parent_span_id,
            recording,
            head_sampled,
            buf: Vec::with_capacity(if recording { capacity } else { 0 }),
            capacity,
            buffer_id,
            // A buffer that is its own predecessor marks a chain root.
            prev_buffer_id: buffer_id,
            buffer_number: 0,
        }
    }

    pub fn trace_id(&self) -> u64 {
        self.trace_id
    }

    pub fn parent_span_id(&self) -> u64 {
        self.parent_span_id
    }

    pub fn recording(&self) -> bool {
        self.recording
    }

    pub fn head_sampled(&self) -> bool {
        self.head_sampled
    }

    /// Registers `address` as holding data for this trace, so triggers
    /// reach it.
    pub fn report_breadcrumb(&self, address: &str) {
        self.core.report_breadcrumb(self.trace_id, address);
    }

    /// Fires the named trigger queue for this trace.
    pub fn trigger(&self, queue: i64) {
        self.core.fire_trigger(queue, self.trace_id);
    }

    pub fn log_span_start(&mut self, span_id: u64) {
        self.write_event(EventRecord::new(EventType::SpanStart, span_id, ticks(), 0));
    }

    pub fn log_span_end(&mut self, span_id: u64) {
        self.write_event(EventRecord::new(EventType::SpanEnd, span_id, ticks(), 0));
    }

    pub fn log_span_name(&mut self, span_id: u64, name: &str) {
        self.write_event_with(
            EventRecord::new(EventType::SpanName, span_id, 0, name.len() as u64),
            name.as_bytes(),
        );
    }

    pub fn log_span_parent(&mut self, span_id: u64, parent_id: u64) {
        self.write_event_with(
            EventRecord::new(EventType::SpanParent, span_id, 0, 8),
            &parent_id.to_le_bytes(),
        );
    }

    pub fn log_span_kind(&mut self, span_id: u64, kind: i32) {
        self.write_event_with(
            EventRecord::new(EventType::SpanKind, span_id, 0, 4),
            &kind.to_le_bytes(),
        );
    }

    pub fn log_tracer(&mut self, span_id: u64, tracer: &str) {
        self.write_event_with(
            EventRecord::new(EventType::Tracer, span_id, 0, tracer.len() as u64),
            tracer.as_bytes(),
        );
    }

    pub fn log_span_status(&mut self, span_id: u64, code: i32, description: &str) {
        self.write_event_with(
            EventRecord::new(EventType::Status, span_id, ticks(), 4),
            &code.to_le_bytes(),
        );
        self.write_event_with(
            EventRecord::new(
                EventType::StatusDescription,
                span_id,
                0,
                description.len() as u64,
            ),
            description.as_bytes(),
        );
    }

    pub fn log_span_event(&mut self, span_id: u64, name: &str) {
        self.write_event_with(
            EventRecord::new(EventType::Event, span_id, ticks(), name.len() as u64),
            name.as_bytes(),
        );
    }

    /// Records a key/value attribute as two consecutive records. Two
    /// keys are semantically intercepted: `Breadcrumb` string values are
    /// forwarded to the agent's breadcrumb index and `Trigger` integer
    /// values fire the named queue; the records are written either way.
    pub fn log_span_attribute(&mut self, span_id: u64, key: &str, value: &Value) {
        if key == names::ATTR_BREADCRUMB {
            if let Some(address) = value.as_str() {
                self.report_breadcrumb(address);
            }
        }
        if key == names::ATTR_TRIGGER {
            if let Some(queue) = value.as_i64() {
                self.trigger(queue);
            }
        }
        self.log_attribute(EventType::AttributeKey, EventType::AttributeValue, span_id, key, value);
    }

    pub fn log_span_event_attribute(&mut self, span_id: u64, key: &str, value: &Value) {
        self.log_attribute(
            EventType::EventAttributeKey,
            EventType::EventAttributeValue,
            span_id,
            key,
            value,
        );
    }

    fn log_attribute(
        &mut self,
        key_type: EventType,
        value_type: EventType,
        span_id: u64,
        key: &str,
        value: &Value,
    ) {
        if !self.recording {
            return;
        }
        self.write_event_with(
            EventRecord::new(key_type, span_id, 0, key.len() as u64),
            key.as_bytes(),
        );
        for payload in value.record_payloads() {
            self.write_event_with(
                EventRecord::new(value_type, span_id, 0, payload.len() as u64),
                &payload,
            );
        }
    }

    fn write_event(&mut self, record: EventRecord) {
        if !self.recording {
            return;
        }
        self.write_bytes(&record.encode());
    }

    fn write_event_with(&mut self, record: EventRecord, payload: &[u8]) {
        if !self.recording {
            return;
        }
        self.write_bytes(&record.encode());
        if !payload.is_empty() {
            self.write_bytes(payload);
        }
    }

    fn write_bytes(&mut self, bytes: &[u8]) {
        if !self.try_append(bytes) {
            self.append_rollover(bytes);
        }
    }

    fn try_append(&mut self, bytes: &[u8]) -> bool {
        if self.buf.len() + bytes.len() > self.capacity {
            return false;
        }
        self.buf.extend_from_slice(bytes);
        true
    }

    fn append_rollover(&mut self, mut bytes: &[u8]) {
        while !bytes.is_empty() {
            let space = self.capacity - self.buf.len();
            if space == 0 {
                self.roll_over();
                continue;
            }
            let n = space.min(bytes.len());
            self.buf.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
        }
    }

    fn roll_over(&mut self) {
        let sealed = self.seal();
        self.core.retain_buffer(sealed);
        self.prev_buffer_id = self.buffer_id;
        self.buffer_id = self.core.next_buffer_id();
        self.buffer_number += 1;
    }

    fn seal(&mut self) -> SealedBuffer {
        let payload = std::mem::take(&mut self.buf);
        SealedBuffer {
            header: TraceHeader {
                trace_id: self.trace_id,
                buffer_id: self.buffer_id,
                prev_buffer_id: self.prev_buffer_id,
                buffer_number: self.buffer_number,
                payload_len: payload.len() as u32,
            },
            payload,
        }
    }
}

impl Drop for TraceState {
    fn drop(&mut self) {
        let last = if self.recording {
            Some(self.seal())
        } else {
            None
        };
        self.core.trace_ended(self.trace_id, last);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::{Agent, AgentConfig};
    use crate::events::EVENT_HEADER_LEN;
    use crate::record::RecordReader;
    use crate::sink::BufferSink;
    use std::fs::File;

    fn start_agent(dir: &tempfile::TempDir, buffer_size: usize, retroactive: f64) -> (Agent, std::path::PathBuf) {
        let path = dir.path().join("buffers.bin");
        let config = AgentConfig {
            buffer_size,
            retroactive_sampling: retroactive,
            ..AgentConfig::new("127.0.0.1:7001")
        };
        let agent = Agent::start(config, BufferSink::file(&path).unwrap()).unwrap();
        (agent, path)
    }

    fn decode_stream(data: &[u8]) -> Vec<(EventType, u64, Vec<u8>)> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let rec = EventRecord::decode(&data[offset..]).unwrap();
            offset += EVENT_HEADER_LEN;
            let payload = data[offset..offset + rec.size as usize].to_vec();
            offset += rec.size as usize;
            out.push((rec.kind, rec.span_id, payload));
        }
        out
    }

    fn log_sample_span(ts: &mut TraceState, span_id: u64, parent: u64) {
        ts.log_span_start(span_id);
        ts.log_span_name(span_id, "Exec");
        ts.log_tracer(span_id, "hindsight");
        ts.log_span_parent(span_id, parent);
        ts.log_span_kind(span_id, 0);
        ts.log_span_attribute(span_id, "API", &Value::from("api1"));
        ts.log_span_attribute(span_id, "Interval", &Value::from(42u64));
        ts.log_span_event(span_id, "Executing API");
        ts.log_span_status(span_id, crate::status_code::OK, "RPC response was OK");
        ts.log_span_end(span_id);
    }

    #[test]
    fn triggered_trace_roundtrips_through_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, path) = start_agent(&dir, 1 << 16, 1.0);
        let handle = agent.handle();

        let mut ts = handle.begin_trace(0xdead, 0);
        assert!(ts.recording());
        log_sample_span(&mut ts, 1, 0);
        ts.log_span_attribute(1, "Trigger", &Value::from(7i64));
        drop(ts);
        agent.flush();

        let records: Vec<_> = RecordReader::new(File::open(&path).unwrap()).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].agent, "127.0.0.1:7001");

        let entries = decode_stream(&records[0].data[TRACE_HEADER_LEN..]);
        // Start, Name, Tracer, Parent, Kind, 2x(Key+Value), Event,
        // Status, StatusDescription, Key+Value for Trigger, End.
        let kinds: Vec<EventType> = entries.iter().map(|(k, _, _)| *k).collect();
        assert_eq!(kinds[0], EventType::SpanStart);
        assert_eq!(*kinds.last().unwrap(), EventType::SpanEnd);
        assert_eq!(
            kinds
                .iter()
                .filter(|k| **k == EventType::AttributeKey)
                .count(),
            3
        );
        // Key records are immediately followed by value records.
        for (i, kind) in kinds.iter().enumerate() {
            if *kind == EventType::AttributeKey {
                assert_eq!(kinds[i + 1], EventType::AttributeValue);
            }
        }
        // The payload of the Interval value record is the u64 bits.
        let interval = entries
            .iter()
            .zip(entries.iter().skip(1))
            .find(|((k, _, p), _)| *k == EventType::AttributeKey && p == b"Interval")
            .map(|(_, (_, _, p))| u64::from_le_bytes(p.as_slice().try_into().unwrap()))
            .unwrap();
        assert_eq!(interval, 42);

        agent.shutdown();
    }

    #[test]
    fn untriggered_trace_is_not_exported() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, path) = start_agent(&dir, 1 << 16, 1.0);
        let handle = agent.handle();

        let mut ts = handle.begin_trace(5, 0);
        log_sample_span(&mut ts, 1, 0);
        drop(ts);
        agent.shutdown();

        let records: Vec<_> = RecordReader::new(File::open(&path).unwrap()).collect();
        assert!(records.is_empty());
    }

    #[test]
    fn non_recording_trace_discards_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (agent, path) = start_agent(&dir, 1 << 16, 0.0);
        let handle = agent.handle();

        let mut ts = handle.begin_trace(5, 0);
        assert!(!ts.recording());
        log_sample_span(&mut ts, 1, 0);
        ts.trigger(7);
        drop(ts);
        agent.shutdown();

        let records: Vec<_> = RecordReader::new(File::open(&path).unwrap()).collect();
        assert!(records.is_empty());
    }

    #[test]
    fn overflow_rolls_into_chained_buffers() {
        let dir = tempfile::tempdir().unwrap();
        // Tiny buffers force several rollovers.
        let (agent, path) = start_agent(&dir, TRACE_HEADER_LEN + 96, 1.0);
        let handle = agent.handle();

        let mut ts = handle.begin_trace(0xbeef, 0);
        for span in 1..=6u64 {
            ts.log_span_start(span);
            ts.log_span_name(span, "Exec/Process");
            ts.log_span_end(span);
        }
        ts.trigger(7);
        drop(ts);
        agent.shutdown();

        let records: Vec<_> = RecordReader::new(File::open(&path).unwrap()).collect();
        assert!(records.len() > 1, "expected a chain, got {}", records.len());

        // Exactly one root; every other buffer links to its predecessor.
        let headers: Vec<_> = records
            .iter()
            .map(|r| TraceHeader::decode(&r.data).unwrap())
            .collect();
        let roots: Vec<_> = headers
            .iter()
            .filter(|h| h.buffer_id == h.prev_buffer_id)
            .collect();
        assert_eq!(roots.len(), 1);
        for pair in headers.windows(2) {
            assert_eq!(pair[1].prev_buffer_id, pair[0].buffer_id);
            assert_eq!(pair[1].buffer_number, pair[0].buffer_number + 1);
        }

        // Concatenating payloads reassembles an intact event stream.
        let mut combined = Vec::new();
        for r in &records {
            combined.extend_from_slice(&r.data[TRACE_HEADER_LEN..]);
        }
        let entries = decode_stream(&combined);
        assert_eq!(
            entries
                .iter()
                .filter(|(k, _, _)| *k == EventType::SpanStart)
                .count(),
            6
        );
        assert_eq!(
            entries
                .iter()
                .filter(|(k, _, _)| *k == EventType::SpanEnd)
                .count(),
            6
        );
    }

    #[test]
    fn head_sampled_trace_exports_without_manual_trigger() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buffers.bin");
        let config = AgentConfig {
            buffer_size: 1 << 16,
            head_sampling: 1.0,
            ..AgentConfig::new("127.0.0.1:7001")
        };
        let agent = Agent::start(config, BufferSink::file(&path).unwrap()).unwrap();
        let handle = agent.handle();

        let mut ts = handle.begin_trace(77, 0);
        assert!(ts.head_sampled());
        log_sample_span(&mut ts, 1, 0);
        drop(ts);
        agent.shutdown();

        let records: Vec<_> = RecordReader::new(File::open(&path).unwrap()).collect();
        assert_eq!(records.len(), 1);
    }
}
