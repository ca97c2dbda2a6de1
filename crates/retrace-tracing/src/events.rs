// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The event record: the unit of the span event stream.
//!
//! Every observation is one fixed-size header followed by `size` payload
//! bytes. Headers are little-endian `{type:u32, span_id:u64,
//! timestamp:u64, size:u64}`, 28 bytes. Attribute keys and values travel
//! as two consecutive records sharing a span id.

use thiserror::Error;

/// Kinds of event record. The discriminants are the on-wire `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum EventType {
    // Core span fields
    SpanStart = 0,
    SpanEnd = 1,
    SpanName = 2,
    SpanParent = 3,

    // Generic attributes
    AttributeKey = 4,
    AttributeValue = 5,

    // Generic events
    Event = 6,
    EventAttributeKey = 7,
    EventAttributeValue = 8,

    // Generic links
    Link = 9,
    LinkAttributeKey = 10,
    LinkAttributeValue = 11,

    // Span fields used by the OpenTelemetry span model
    Status = 12,
    StatusDescription = 13,
    SpanKind = 14,
    Tracer = 15,
}

impl TryFrom<u32> for EventType {
    type Error = EventDecodeError;

    fn try_from(v: u32) -> Result<Self, EventDecodeError> {
        Ok(match v {
            0 => EventType::SpanStart,
            1 => EventType::SpanEnd,
            2 => EventType::SpanName,
            3 => EventType::SpanParent,
            4 => EventType::AttributeKey,
            5 => EventType::AttributeValue,
            6 => EventType::Event,
            7 => EventType::EventAttributeKey,
            8 => EventType::EventAttributeValue,
            9 => EventType::Link,
            10 => EventType::LinkAttributeKey,
            11 => EventType::LinkAttributeValue,
            12 => EventType::Status,
            13 => EventType::StatusDescription,
            14 => EventType::SpanKind,
            15 => EventType::Tracer,
            other => return Err(EventDecodeError::UnknownType(other)),
        })
    }
}

/// Size of an encoded [`EventRecord`] header.
pub const EVENT_HEADER_LEN: usize = 28;

#[derive(Debug, Error)]
pub enum EventDecodeError {
    #[error("unknown event type {0}")]
    UnknownType(u32),
    #[error("truncated event header: need {needed} bytes, have {have}")]
    Truncated { needed: usize, have: usize },
}

/// One event record header. Most records belong to a span; the timestamp
/// is optional and zero where the writer did not take one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventRecord {
    pub kind: EventType,
    pub span_id: u64,
    pub timestamp: u64,
    pub size: u64,
}

impl EventRecord {
    pub fn new(kind: EventType, span_id: u64, timestamp: u64, size: u64) -> Self {
        EventRecord {
            kind,
            span_id,
            timestamp,
            size,
        }
    }

    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.kind as u32).to_le_bytes());
        out.extend_from_slice(&self.span_id.to_le_bytes());
        out.extend_from_slice(&self.timestamp.to_le_bytes());
        out.extend_from_slice(&self.size.to_le_bytes());
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(EVENT_HEADER_LEN);
        self.encode_into(&mut out);
        out
    }

    /// Decodes a header from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<EventRecord, EventDecodeError> {
        if bytes.len() < EVENT_HEADER_LEN {
            return Err(EventDecodeError::Truncated {
                needed: EVENT_HEADER_LEN,
                have: bytes.len(),
            });
        }
        let kind = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
        Ok(EventRecord {
            kind: EventType::try_from(kind)?,
            span_id: u64::from_le_bytes(bytes[4..12].try_into().unwrap()),
            timestamp: u64::from_le_bytes(bytes[12..20].try_into().unwrap()),
            size: u64::from_le_bytes(bytes[20..28].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let rec = EventRecord::new(EventType::AttributeValue, 10_042, 77, 16);
        let bytes = rec.encode();
        assert_eq!(bytes.len(), EVENT_HEADER_LEN);
        assert_eq!(EventRecord::decode(&bytes).unwrap(), rec);
    }

    #[test]
    fn truncated_header_is_rejected() {
        let rec = EventRecord::new(EventType::SpanStart, 1, 0, 0);
        let bytes = rec.encode();
        assert!(matches!(
            EventRecord::decode(&bytes[..EVENT_HEADER_LEN - 1]),
            Err(EventDecodeError::Truncated { .. })
        ));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let mut bytes = EventRecord::new(EventType::Tracer, 1, 0, 0).encode();
        bytes[0] = 200;
        assert!(matches!(
            EventRecord::decode(&bytes),
            Err(EventDecodeError::UnknownType(200))
        ));
    }
}
