// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The wire protocol: a single `Exec(ExecRequest) -> ExecReply` RPC.
//! Messages are MessagePack-encoded and carried in length-delimited
//! frames; each frame is a [`Frame`] correlating calls and responses by
//! id.

use serde::{Deserialize, Serialize};

/// Conventional head-sampled tracing context, propagated as hex ids.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OtelContext {
    /// 32 lowercase hex characters.
    pub trace_id: String,
    /// 16 lowercase hex characters; all-`f` marks "no parent".
    pub span_id: String,
    pub sample: bool,
}

/// Optimistic tracing context. `span_id` is the parent span id the
/// receiving hop derives its span slots from; breadcrumbs name the
/// sender-side agents holding data for this trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HindsightContext {
    pub trace_id: u64,
    pub span_id: u64,
    pub triggerflag: bool,
    pub breadcrumb: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecRequest {
    pub api: String,
    pub payload: Option<String>,
    pub debug: bool,
    pub interval: u64,
    pub otel: Option<OtelContext>,
    pub hindsight: Option<HindsightContext>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecReply {
    pub payload: String,
    pub hindsight: Option<HindsightContext>,
}

/// One frame on a connection, either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Frame {
    Request { id: u64, body: ExecRequest },
    Response { id: u64, body: ExecReply },
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, rmp_serde::encode::Error> {
    rmp_serde::to_vec(frame)
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, rmp_serde::decode::Error> {
    rmp_serde::from_slice(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_roundtrip() {
        let frame = Frame::Request {
            id: 42,
            body: ExecRequest {
                api: "api1".into(),
                payload: Some("payload".into()),
                debug: false,
                interval: 7,
                otel: Some(OtelContext {
                    trace_id: "0123456789abcdef0123456789abcdef".into(),
                    span_id: "ffffffffffffffff".into(),
                    sample: true,
                }),
                hindsight: Some(HindsightContext {
                    trace_id: 0xdead_beef,
                    span_id: 2,
                    triggerflag: true,
                    breadcrumb: vec!["127.0.0.1:7001".into()],
                }),
            },
        };
        let bytes = encode_frame(&frame).unwrap();
        match decode_frame(&bytes).unwrap() {
            Frame::Request { id, body } => {
                assert_eq!(id, 42);
                assert_eq!(body.api, "api1");
                assert_eq!(body.hindsight.unwrap().trace_id, 0xdead_beef);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn reply_roundtrip_mirrors_hindsight() {
        let frame = Frame::Response {
            id: 1,
            body: ExecReply {
                payload: "Hello api1".into(),
                hindsight: Some(HindsightContext {
                    trace_id: 3,
                    span_id: 0,
                    triggerflag: false,
                    breadcrumb: vec!["127.0.0.1:7002".into()],
                }),
            },
        };
        let bytes = encode_frame(&frame).unwrap();
        match decode_frame(&bytes).unwrap() {
            Frame::Response { body, .. } => {
                assert_eq!(body.payload, "Hello api1");
                assert_eq!(body.hindsight.unwrap().breadcrumb, vec!["127.0.0.1:7002"]);
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }
}
