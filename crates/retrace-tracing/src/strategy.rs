// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Tracing backends as a capability.
//!
//! The request state machine drives one [`RequestTracer`] per request
//! and never knows which pipelines are live. [`TracerStack`] is chosen
//! once at startup: no tracing, direct buffer recording, an
//! OpenTelemetry tracer, or both at once. Span identifiers are the
//! caller's deterministic slot ids; the OpenTelemetry backend maps them
//! to real spans internally.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use opentelemetry::global::{self, BoxedTracer};
use opentelemetry::trace::noop::NoopTracerProvider;
use opentelemetry::trace::{
    SpanBuilder, SpanContext, SpanId, Status, TraceContextExt, TraceFlags, TraceId,
    TraceState as OtelTraceState, Tracer,
};
use opentelemetry::{Context, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::{
    BatchConfigBuilder, BatchSpanProcessor, InMemorySpanExporter, RandomIdGenerator, Sampler,
    SdkTracerProvider, SpanExporter,
};

use crate::agent::AgentHandle;
use crate::names;
use crate::state::TraceState;
use crate::value::Value;
use crate::status_code;

/// Per-request tracing operations. Span ids are the deterministic slot
/// ids from the request's span-id plan.
pub trait RequestTracer {
    /// Opens the end-to-end request span for this hop.
    fn open_request_span(&self, id: u64, name: &str, parent: u64);
    /// Opens a nested span under `parent`.
    fn open_subspan(&self, id: u64, name: &str, parent: u64);
    fn set_attribute(&self, id: u64, key: &str, value: Value);
    fn add_event(&self, id: u64, name: &str);
    fn set_status(&self, id: u64, ok: bool, description: &str);
    /// Records the trigger attributes for `queue` on span `id`; on
    /// buffer-recording backends this also fires the trigger itself.
    fn fire_trigger(&self, id: u64, queue: i64, count: i64);
    fn close_span(&self, id: u64);

    /// Whether this request carries buffer-recording state (and so the
    /// reply should carry a Hindsight context).
    fn hindsight_enabled(&self) -> bool {
        false
    }

    fn recording(&self) -> bool {
        false
    }

    /// The current OpenTelemetry wire context of span `id` as
    /// `(trace_id_hex, span_id_hex, sampled)`, for propagation to child
    /// RPCs.
    fn otel_wire_context(&self, _id: u64) -> Option<(String, String, bool)> {
        None
    }
}

/// All operations are no-ops.
pub struct NoopRequestTracer;

impl RequestTracer for NoopRequestTracer {
    fn open_request_span(&self, _id: u64, _name: &str, _parent: u64) {}
    fn open_subspan(&self, _id: u64, _name: &str, _parent: u64) {}
    fn set_attribute(&self, _id: u64, _key: &str, _value: Value) {}
    fn add_event(&self, _id: u64, _name: &str) {}
    fn set_status(&self, _id: u64, _ok: bool, _description: &str) {}
    fn fire_trigger(&self, _id: u64, _queue: i64, _count: i64) {}
    fn close_span(&self, _id: u64) {}
}

/// Writes span events straight into the per-trace agent buffers.
pub struct HindsightRequestTracer {
    state: Rc<RefCell<TraceState>>,
}

impl HindsightRequestTracer {
    pub fn new(state: TraceState) -> Self {
        HindsightRequestTracer {
            state: Rc::new(RefCell::new(state)),
        }
    }

    fn open(&self, id: u64, name: &str, parent: u64) {
        let mut ts = self.state.borrow_mut();
        ts.log_span_start(id);
        ts.log_span_name(id, name);
        ts.log_tracer(id, names::TRACER_NAME);
        ts.log_span_parent(id, parent);
        ts.log_span_kind(id, 0);
    }
}

impl RequestTracer for HindsightRequestTracer {
    fn open_request_span(&self, id: u64, name: &str, parent: u64) {
        self.open(id, name, parent);
    }

    fn open_subspan(&self, id: u64, name: &str, parent: u64) {
        self.open(id, name, parent);
    }

    fn set_attribute(&self, id: u64, key: &str, value: Value) {
        self.state.borrow_mut().log_span_attribute(id, key, &value);
    }

    fn add_event(&self, id: u64, name: &str) {
        self.state.borrow_mut().log_span_event(id, name);
    }

    fn set_status(&self, id: u64, ok: bool, description: &str) {
        let code = if ok { status_code::OK } else { status_code::ERROR };
        self.state.borrow_mut().log_span_status(id, code, description);
    }

    fn fire_trigger(&self, id: u64, queue: i64, _count: i64) {
        let mut ts = self.state.borrow_mut();
        ts.log_span_attribute(id, &format!("TriggerQueue{queue}"), &Value::I64(queue));
        // The Trigger attribute is intercepted and fires the queue.
        ts.log_span_attribute(id, names::ATTR_TRIGGER, &Value::I64(queue));
    }

    fn close_span(&self, id: u64) {
        self.state.borrow_mut().log_span_end(id);
    }

    fn hindsight_enabled(&self) -> bool {
        true
    }

    fn recording(&self) -> bool {
        self.state.borrow().recording()
    }
}

/// Creates spans on the globally installed OpenTelemetry tracer.
pub struct OtelRequestTracer {
    tracer: BoxedTracer,
    remote: Option<SpanContext>,
    spans: RefCell<HashMap<u64, Context>>,
}

impl OtelRequestTracer {
    pub fn new(remote: Option<SpanContext>) -> Self {
        OtelRequestTracer {
            tracer: global::tracer(names::TRACER_NAME),
            remote,
            spans: RefCell::new(HashMap::new()),
        }
    }

    fn start(&self, id: u64, name: &str, parent_cx: &Context) {
        let span = SpanBuilder::from_name(name.to_string()).start_with_context(&self.tracer, parent_cx);
        self.spans
            .borrow_mut()
            .insert(id, parent_cx.with_span(span));
    }
}

impl RequestTracer for OtelRequestTracer {
    fn open_request_span(&self, id: u64, name: &str, _parent: u64) {
        let parent_cx = match &self.remote {
            Some(remote) => Context::new().with_remote_span_context(remote.clone()),
            None => Context::new(),
        };
        self.start(id, name, &parent_cx);
    }

    fn open_subspan(&self, id: u64, name: &str, parent: u64) {
        let parent_cx = self
            .spans
            .borrow()
            .get(&parent)
            .cloned()
            .unwrap_or_else(Context::new);
        self.start(id, name, &parent_cx);
    }

    fn set_attribute(&self, id: u64, key: &str, value: Value) {
        if let Some(cx) = self.spans.borrow().get(&id) {
            cx.span()
                .set_attribute(KeyValue::new(key.to_string(), to_otel_value(&value)));
        }
    }

    fn add_event(&self, id: u64, name: &str) {
        if let Some(cx) = self.spans.borrow().get(&id) {
            cx.span().add_event(name.to_string(), Vec::new());
        }
    }

    fn set_status(&self, id: u64, ok: bool, description: &str) {
        if let Some(cx) = self.spans.borrow().get(&id) {
            let status = if ok {
                Status::Ok
            } else {
                Status::error(description.to_string())
            };
            cx.span().set_status(status);
        }
    }

    fn fire_trigger(&self, id: u64, queue: i64, count: i64) {
        if let Some(cx) = self.spans.borrow().get(&id) {
            let span = cx.span();
            span.set_attribute(KeyValue::new(format!("TriggerQueue{queue}"), queue));
            // Integer values are not recognized by the tail processors;
            // record the global trigger count as a string.
            span.set_attribute(KeyValue::new(
                names::ATTR_TRIGGER.to_string(),
                count.to_string(),
            ));
        }
    }

    fn close_span(&self, id: u64) {
        // Spans stay in the map after ending so later spans can still
        // parent under them, as the request span outlives its children.
        if let Some(cx) = self.spans.borrow().get(&id) {
            cx.span().end();
        }
    }

    fn otel_wire_context(&self, id: u64) -> Option<(String, String, bool)> {
        let spans = self.spans.borrow();
        let cx = spans.get(&id)?;
        let span = cx.span();
        let sc = span.span_context();
        Some((
            format!("{:032x}", sc.trace_id()),
            format!("{:016x}", sc.span_id()),
            sc.is_sampled(),
        ))
    }
}

/// Drives both pipelines from the same call sites.
pub struct DualRequestTracer {
    hindsight: HindsightRequestTracer,
    otel: OtelRequestTracer,
}

impl RequestTracer for DualRequestTracer {
    fn open_request_span(&self, id: u64, name: &str, parent: u64) {
        self.hindsight.open_request_span(id, name, parent);
        self.otel.open_request_span(id, name, parent);
    }

    fn open_subspan(&self, id: u64, name: &str, parent: u64) {
        self.hindsight.open_subspan(id, name, parent);
        self.otel.open_subspan(id, name, parent);
    }

    fn set_attribute(&self, id: u64, key: &str, value: Value) {
        self.hindsight.set_attribute(id, key, value.clone());
        self.otel.set_attribute(id, key, value);
    }

    fn add_event(&self, id: u64, name: &str) {
        self.hindsight.add_event(id, name);
        self.otel.add_event(id, name);
    }

    fn set_status(&self, id: u64, ok: bool, description: &str) {
        self.hindsight.set_status(id, ok, description);
        self.otel.set_status(id, ok, description);
    }

    fn fire_trigger(&self, id: u64, queue: i64, count: i64) {
        self.hindsight.fire_trigger(id, queue, count);
        self.otel.fire_trigger(id, queue, count);
    }

    fn close_span(&self, id: u64) {
        self.hindsight.close_span(id);
        self.otel.close_span(id);
    }

    fn hindsight_enabled(&self) -> bool {
        true
    }

    fn recording(&self) -> bool {
        self.hindsight.recording()
    }

    fn otel_wire_context(&self, id: u64) -> Option<(String, String, bool)> {
        self.otel.otel_wire_context(id)
    }
}

/// The tracing configuration chosen at startup.
#[derive(Clone)]
pub enum TracerStack {
    /// Tracing disabled.
    None,
    /// Direct buffer recording.
    Hindsight { agent: AgentHandle },
    /// OpenTelemetry only, against the globally installed provider.
    Otel,
    /// Buffer recording alongside the OpenTelemetry pipeline.
    OtelHindsight { agent: AgentHandle },
}

impl TracerStack {
    /// Builds the per-request tracer. `hindsight` is the inbound
    /// `(trace_id, parent_span_id)` pair if the request carried one;
    /// requests without it run unrecorded rather than failing.
    pub fn begin_request(
        &self,
        hindsight: Option<(u64, u64)>,
        remote: Option<SpanContext>,
    ) -> Box<dyn RequestTracer> {
        match self {
            TracerStack::None => Box::new(NoopRequestTracer),
            TracerStack::Hindsight { agent } => match hindsight {
                Some((trace_id, parent_span_id)) => Box::new(HindsightRequestTracer::new(
                    agent.begin_trace(trace_id, parent_span_id),
                )),
                None => Box::new(NoopRequestTracer),
            },
            TracerStack::Otel => Box::new(OtelRequestTracer::new(remote)),
            TracerStack::OtelHindsight { agent } => match hindsight {
                Some((trace_id, parent_span_id)) => Box::new(DualRequestTracer {
                    hindsight: HindsightRequestTracer::new(
                        agent.begin_trace(trace_id, parent_span_id),
                    ),
                    otel: OtelRequestTracer::new(remote),
                }),
                None => Box::new(OtelRequestTracer::new(remote)),
            },
        }
    }
}

/// Parses the wire OpenTelemetry context. Invalid hex silently yields
/// `None`; the caller keeps the Hindsight context and the request span
/// is created without a remote parent.
pub fn parse_remote_context(
    trace_id_hex: &str,
    span_id_hex: &str,
    sampled: bool,
) -> Option<SpanContext> {
    let trace_id = TraceId::from_hex(trace_id_hex).ok()?;
    let span_id = SpanId::from_hex(span_id_hex).ok()?;
    let flags = if sampled {
        TraceFlags::SAMPLED
    } else {
        TraceFlags::default()
    };
    let context = SpanContext::new(trace_id, span_id, flags, true, OtelTraceState::default());
    context.is_valid().then_some(context)
}

fn to_otel_value(value: &Value) -> opentelemetry::Value {
    use opentelemetry::{Array, StringValue};
    match value {
        Value::Bool(v) => (*v).into(),
        Value::I32(v) => i64::from(*v).into(),
        Value::I64(v) => (*v).into(),
        Value::U32(v) => i64::from(*v).into(),
        Value::U64(v) => (*v as i64).into(),
        Value::F64(v) => (*v).into(),
        Value::Str(v) => v.clone().into(),
        Value::BoolSeq(vs) => opentelemetry::Value::Array(Array::Bool(vs.clone())),
        Value::I32Seq(vs) => {
            opentelemetry::Value::Array(Array::I64(vs.iter().map(|v| i64::from(*v)).collect()))
        }
        Value::I64Seq(vs) => opentelemetry::Value::Array(Array::I64(vs.clone())),
        Value::U32Seq(vs) => {
            opentelemetry::Value::Array(Array::I64(vs.iter().map(|v| i64::from(*v)).collect()))
        }
        Value::U64Seq(vs) => {
            opentelemetry::Value::Array(Array::I64(vs.iter().map(|v| *v as i64).collect()))
        }
        Value::F64Seq(vs) => opentelemetry::Value::Array(Array::F64(vs.clone())),
        Value::StrSeq(vs) => opentelemetry::Value::Array(Array::String(
            vs.iter().map(|s| StringValue::from(s.clone())).collect(),
        )),
    }
}

/// Installs a no-op global tracer provider.
pub fn init_noop_provider() {
    global::set_tracer_provider(NoopTracerProvider::new());
}

/// Spans to stdout through the simple processor; for testing and
/// debugging.
pub fn init_stdout_provider() -> SdkTracerProvider {
    install(opentelemetry_stdout::SpanExporter::default(), false)
}

/// Spans into a small in-memory buffer; the local debugging mode.
pub fn init_in_memory_provider() -> SdkTracerProvider {
    install(InMemorySpanExporter::default(), false)
}

/// Spans to an OTLP collector endpoint, batched unless `batch` is off.
pub fn init_otlp_provider(
    host: &str,
    port: u16,
    batch: bool,
) -> Result<SdkTracerProvider, opentelemetry_otlp::ExporterBuildError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(format!("http://{host}:{port}"))
        .build()?;
    Ok(install(exporter, batch))
}

fn install<E: SpanExporter + 'static>(exporter: E, batch: bool) -> SdkTracerProvider {
    let builder = SdkTracerProvider::builder()
        .with_sampler(Sampler::ParentBased(Box::new(Sampler::AlwaysOn)))
        .with_id_generator(RandomIdGenerator::default());
    let builder = if batch {
        let processor = BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                BatchConfigBuilder::default()
                    .with_max_queue_size(65_536)
                    .with_max_export_batch_size(32_768)
                    .with_scheduled_delay(Duration::from_millis(100))
                    .build(),
            )
            .build();
        builder.with_span_processor(processor)
    } else {
        builder.with_simple_exporter(exporter)
    };
    let provider = builder.build();
    global::set_tracer_provider(provider.clone());
    provider
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_context_parses_valid_hex() {
        let cx = parse_remote_context(
            "0123456789abcdef0123456789abcdef",
            "ffffffffffffffff",
            true,
        )
        .unwrap();
        assert!(cx.is_sampled());
        assert!(cx.is_remote());
    }

    #[test]
    fn remote_context_rejects_bad_hex() {
        assert!(parse_remote_context("zz", "ffffffffffffffff", true).is_none());
        assert!(parse_remote_context(
            "0123456789abcdef0123456789abcdef",
            "not-hex!",
            false
        )
        .is_none());
        // All-zero ids are structurally valid hex but not a usable context.
        assert!(parse_remote_context(
            "00000000000000000000000000000000",
            "0000000000000000",
            false
        )
        .is_none());
    }

    #[test]
    fn noop_stack_produces_noop_tracers() {
        let tracer = TracerStack::None.begin_request(Some((1, 0)), None);
        assert!(!tracer.hindsight_enabled());
        assert!(!tracer.recording());
        assert!(tracer.otel_wire_context(1).is_none());
        // Safe to drive without any backing state.
        tracer.open_request_span(1, "Exec", 0);
        tracer.set_attribute(1, "API", Value::from("api1"));
        tracer.close_span(1);
    }
}
