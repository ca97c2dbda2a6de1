// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-trace reassembly and validation.
//!
//! Within one `(trace, agent)` partition, buffers chain via
//! `(buffer_id, prev_buffer_id)`; a buffer that is its own predecessor
//! roots a chain. Chains concatenate into combined buffers with the
//! per-buffer trace headers stripped, and the combined event streams
//! are checked against the recording invariants. Every trace gets
//! exactly one status: the first violation found, in a fixed order.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use tracing::warn;

use retrace_tracing::events::{EventRecord, EventType, EVENT_HEADER_LEN};
use retrace_tracing::names;
use retrace_tracing::record::TRACE_HEADER_LEN;

use crate::buffers::RawBuffer;

/// Classification of one reconstructed trace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TraceStatus {
    Valid,
    Ignore,
    MissingPrevBuffer,
    MultipleNextBuffers,
    PrematureEndOfSlice,
    DuplicateBufferId,
    EmptyTrace,
    MissingChildCalls,
    MissingAttributeValue,
    MissingSpanStart,
    MissingSpanEnd,
    UnexpectedBreadcrumb,
}

impl TraceStatus {
    pub fn code(&self) -> i32 {
        *self as i32
    }

    pub fn description(&self) -> &'static str {
        match self {
            TraceStatus::Valid => "Valid",
            TraceStatus::Ignore => "Trace with the 'Ignore' attribute set to true.",
            TraceStatus::MissingPrevBuffer => {
                "A buffer references another buffer that doesn't exist"
            }
            TraceStatus::MultipleNextBuffers => {
                "Multiple buffers have the same buffer marked as prev (this is a special case we don't currently handle)"
            }
            TraceStatus::PrematureEndOfSlice => {
                "Buffers ended with a partial fragment of trace data"
            }
            TraceStatus::DuplicateBufferId => {
                "Multiple buffers have the same buffer ID (this is a special case we don't currently handle)"
            }
            TraceStatus::EmptyTrace => "The trace somehow contained no RPC calls",
            TraceStatus::MissingChildCalls => {
                "The number of RPCs executed did not match the number of child calls made."
            }
            TraceStatus::MissingAttributeValue => {
                "The span attributes weren't formatted correctly."
            }
            TraceStatus::MissingSpanStart => "Span was ended but not started.",
            TraceStatus::MissingSpanEnd => "Span was started but not ended.",
            TraceStatus::UnexpectedBreadcrumb => {
                "A breadcrumb was found but not in an Exec or ChildCall span"
            }
        }
    }
}

/// One decoded event entry within a combined buffer.
#[derive(Debug, Clone, Copy)]
pub struct TraceEntry<'a> {
    pub header: EventRecord,
    pub payload: &'a [u8],
}

impl TraceEntry<'_> {
    pub fn string_value(&self) -> String {
        String::from_utf8_lossy(self.payload).into_owned()
    }

    /// Integer payloads by width; anything else yields the -5 sentinel.
    pub fn int_value(&self) -> i64 {
        match self.payload.len() {
            4 => i64::from(i32::from_le_bytes(self.payload.try_into().unwrap_or_default())),
            8 => i64::from_le_bytes(self.payload.try_into().unwrap_or_default()),
            _ => -5,
        }
    }
}

/// The concatenation of one chain's payloads, trace headers stripped.
#[derive(Debug, Clone)]
pub struct CombinedBuffer {
    pub agent: String,
    pub data: Vec<u8>,
}

impl CombinedBuffer {
    fn from_chain(agent: &str, chain: &[&RawBuffer]) -> CombinedBuffer {
        let size = chain
            .iter()
            .map(|b| b.data.len() - TRACE_HEADER_LEN)
            .sum();
        let mut data = Vec::with_capacity(size);
        for buffer in chain {
            data.extend_from_slice(buffer.payload());
        }
        CombinedBuffer {
            agent: agent.to_string(),
            data,
        }
    }

    /// Decodes entries until the stream ends. A stream that stops mid
    /// record yields the entries so far plus a `PrematureEndOfSlice`
    /// marker.
    pub fn entries(&self) -> (Vec<TraceEntry<'_>>, Option<TraceStatus>) {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < self.data.len() {
            let header = match EventRecord::decode(&self.data[offset..]) {
                Ok(header) => header,
                Err(_) => return (out, Some(TraceStatus::PrematureEndOfSlice)),
            };
            offset += EVENT_HEADER_LEN;
            let size = header.size as usize;
            if offset + size > self.data.len() {
                return (out, Some(TraceStatus::PrematureEndOfSlice));
            }
            out.push(TraceEntry {
                header,
                payload: &self.data[offset..offset + size],
            });
            offset += size;
        }
        (out, None)
    }
}

/// Chains one agent's buffers and concatenates each chain. An agent can
/// contribute several chains: one call spilling across buffers, or
/// several calls into the same service.
pub fn group_and_concatenate(
    agent: &str,
    buffers: &[&RawBuffer],
) -> Result<Vec<CombinedBuffer>, TraceStatus> {
    let mut lookup: HashMap<i32, usize> = HashMap::new();
    for (index, buffer) in buffers.iter().enumerate() {
        if lookup.insert(buffer.header.buffer_id, index).is_some() {
            return Err(TraceStatus::DuplicateBufferId);
        }
    }

    let mut next: Vec<Option<usize>> = vec![None; buffers.len()];
    let mut roots = Vec::new();
    for (index, buffer) in buffers.iter().enumerate() {
        let id = buffer.header.buffer_id;
        let prev = buffer.header.prev_buffer_id;
        if id == prev {
            roots.push(index);
            continue;
        }
        match lookup.get(&prev) {
            None => return Err(TraceStatus::MissingPrevBuffer),
            Some(&prev_index) => {
                if next[prev_index].is_some() {
                    return Err(TraceStatus::MultipleNextBuffers);
                }
                next[prev_index] = Some(index);
            }
        }
    }

    let mut combined = Vec::new();
    for root in roots {
        let mut chain = Vec::new();
        let mut cursor = Some(root);
        while let Some(index) = cursor {
            chain.push(buffers[index]);
            cursor = next[index];
        }
        combined.push(CombinedBuffer::from_chain(agent, &chain));
    }
    Ok(combined)
}

/// The classification of one trace plus the report dimensions it
/// touched.
#[derive(Debug)]
pub struct TraceOutcome {
    pub status: TraceStatus,
    pub intervals: BTreeSet<i64>,
    pub triggers: BTreeSet<i64>,
}

/// Finds the value entries for every attribute named `key`. An
/// attribute is a key record immediately followed by a value record;
/// anything else degrades the status.
fn find_attribute_entries<'a, 'b>(
    entries: &'b [TraceEntry<'a>],
    key: &str,
) -> (Vec<&'b TraceEntry<'a>>, TraceStatus) {
    let mut status = TraceStatus::Valid;
    let mut values = Vec::new();
    for (index, entry) in entries.iter().enumerate() {
        if entry.header.kind != EventType::AttributeKey {
            continue;
        }
        if entry.payload != key.as_bytes() {
            continue;
        }
        match entries.get(index + 1) {
            Some(next) if next.header.kind == EventType::AttributeValue => values.push(next),
            _ => status = TraceStatus::MissingAttributeValue,
        }
    }
    (values, status)
}

fn find_int_attributes(entries: &[TraceEntry<'_>], key: &str) -> Vec<i64> {
    find_attribute_entries(entries, key)
        .0
        .into_iter()
        .map(|entry| entry.int_value())
        .collect()
}

/// Classifies one trace from all of its buffers, across agents.
pub fn evaluate_trace(buffers: &[RawBuffer]) -> TraceOutcome {
    let mut by_agent: BTreeMap<&str, Vec<&RawBuffer>> = BTreeMap::new();
    for buffer in buffers {
        by_agent.entry(buffer.agent.as_str()).or_default().push(buffer);
    }

    // Concatenate per agent, keeping the first grouping failure.
    let mut status = TraceStatus::Valid;
    let mut combined = Vec::new();
    for (agent, agent_buffers) in &by_agent {
        match group_and_concatenate(agent, agent_buffers) {
            Ok(mut chains) => combined.append(&mut chains),
            Err(grouping_status) => {
                if status == TraceStatus::Valid {
                    status = grouping_status;
                }
            }
        }
    }

    // Before rejecting a trace, try to find the report buckets it
    // belongs to and whether it is marked ignored; entry extraction is
    // best-effort here.
    let mut intervals = BTreeSet::new();
    let mut triggers = BTreeSet::new();
    let mut ignored = false;
    for chain in &combined {
        let (entries, _) = chain.entries();
        intervals.extend(find_int_attributes(&entries, names::ATTR_INTERVAL));
        triggers.extend(find_int_attributes(&entries, names::ATTR_TRIGGER));
        let (ignore_entries, _) = find_attribute_entries(&entries, names::ATTR_IGNORE);
        ignored |= ignore_entries
            .iter()
            .any(|entry| entry.payload == [1] || entry.int_value() > 0);
    }

    let outcome = |status| TraceOutcome {
        status,
        intervals: intervals.clone(),
        triggers: triggers.clone(),
    };

    if ignored {
        return outcome(TraceStatus::Ignore);
    }
    if status != TraceStatus::Valid {
        return outcome(status);
    }

    // Senders and receivers always record breadcrumbs to each other, so
    // every call must show up on both sides with equal counts, matched
    // on (sender_agent, receiver_breadcrumb_address).
    let mut sender_side: BTreeMap<(String, String), i64> = BTreeMap::new();
    let mut receiver_side: BTreeMap<(String, String), i64> = BTreeMap::new();

    for chain in &combined {
        let (entries, truncated) = chain.entries();
        if let Some(truncated_status) = truncated {
            return outcome(truncated_status);
        }

        let mut span_names: HashMap<u64, String> = HashMap::new();
        for entry in &entries {
            if entry.header.kind == EventType::SpanName {
                span_names.insert(entry.header.span_id, entry.string_value());
            }
        }

        let (breadcrumbs, breadcrumb_status) =
            find_attribute_entries(&entries, names::ATTR_BREADCRUMB);
        if breadcrumb_status != TraceStatus::Valid {
            return outcome(breadcrumb_status);
        }
        for entry in breadcrumbs {
            let breadcrumb = entry.string_value();
            match span_names.get(&entry.header.span_id).map(String::as_str) {
                Some(names::SPAN_EXEC) => {
                    *receiver_side
                        .entry((breadcrumb, chain.agent.clone()))
                        .or_default() += 1;
                }
                Some(names::SPAN_CHILD_CALL_PREPARE) => {
                    *sender_side
                        .entry((chain.agent.clone(), breadcrumb))
                        .or_default() += 1;
                }
                _ => return outcome(TraceStatus::UnexpectedBreadcrumb),
            }
        }

        // Every span must be started and ended exactly as often.
        let mut spans: BTreeMap<u64, i64> = BTreeMap::new();
        for entry in &entries {
            match entry.header.kind {
                EventType::SpanStart => *spans.entry(entry.header.span_id).or_default() += 1,
                EventType::SpanEnd => *spans.entry(entry.header.span_id).or_default() -= 1,
                _ => {}
            }
        }
        if spans.is_empty() {
            return outcome(TraceStatus::EmptyTrace);
        }
        for balance in spans.values() {
            if *balance < 0 {
                return outcome(TraceStatus::MissingSpanStart);
            }
            if *balance > 0 {
                return outcome(TraceStatus::MissingSpanEnd);
            }
        }
    }

    if receiver_side.len() != sender_side.len() {
        return outcome(TraceStatus::MissingChildCalls);
    }
    for (pair, count) in &sender_side {
        match receiver_side.get(pair) {
            Some(receiver_count) if receiver_count == count => {}
            _ => {
                warn!("Call missing: {} -> {}", pair.0, pair.1);
                return outcome(TraceStatus::MissingChildCalls);
            }
        }
    }

    outcome(TraceStatus::Valid)
}
