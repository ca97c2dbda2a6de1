// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Optimistic span-event recording for retroactive tracing.
//!
//! Every request writes a compact stream of span events into per-trace
//! buffers owned by an in-process [`agent::Agent`]. Buffers are cheap to
//! discard; they are only shipped to a collector sink when a *trigger*
//! fires for their trace. An offline processor later reassembles the
//! distributed traces from whichever agents' buffers survived.
//!
//! The crate also hosts the conventional head-sampled pipeline as a
//! plug-in: [`strategy`] selects at startup between no tracing, direct
//! buffer recording, an OpenTelemetry tracer, or both at once.

pub mod agent;
pub mod events;
pub mod record;
pub mod sink;
pub mod state;
pub mod strategy;
pub mod value;

mod clock;

/// Span and attribute names shared between the services that record
/// traces and the processor that validates them.
pub mod names {
    /// End-to-end request span, one per hop.
    pub const SPAN_EXEC: &str = "Exec";
    pub const SPAN_EXEC_PROCESS: &str = "Exec/Process";
    pub const SPAN_EXEC_FINISH: &str = "Exec/Finish";
    pub const SPAN_EXEC_COMPLETE: &str = "Exec/Complete";
    /// One per outgoing RPC, opened before the RPC is dispatched.
    pub const SPAN_CHILD_CALL: &str = "ChildCall";
    pub const SPAN_CHILD_CALL_PREPARE: &str = "ChildCall/Prepare";

    pub const TRACER_NAME: &str = "hindsight";

    /// Intercepted at log time: the value is forwarded to the agent's
    /// breadcrumb index in addition to being recorded.
    pub const ATTR_BREADCRUMB: &str = "Breadcrumb";
    /// Intercepted at log time: integer values fire the named trigger
    /// queue in addition to being recorded.
    pub const ATTR_TRIGGER: &str = "Trigger";
    pub const ATTR_INTERVAL: &str = "Interval";
    pub const ATTR_API: &str = "API";
    /// Traces carrying `Ignore=true` are excluded from processor reports.
    pub const ATTR_IGNORE: &str = "Ignore";
}

/// Well-known trigger queue fired for head-sampled traces so that their
/// buffers are always retained.
pub const HEAD_SAMPLING_TRIGGER_ID: i64 = 1;

/// Span status codes recorded by `log_span_status`, matching the
/// OpenTelemetry status code values.
pub mod status_code {
    pub const OK: i32 = 1;
    pub const ERROR: i32 = 2;
}
