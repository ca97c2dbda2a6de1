// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The benchmark server: N handler threads, each owning a private
//! completion queue and driving its requests as explicit state
//! machines.
//!
//! A request moves CREATE → PROCESS → (AWAIT_CHILDREN) → FINISH. It
//! suspends whenever it hands a registration to the transport and
//! resumes when the matching completion is dispatched back by tag.
//! Requests never migrate between handlers, which is what lets the
//! per-trace recording state stay single-threaded.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use slab::Slab;
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use retrace_tracing::names;
use retrace_tracing::strategy::{parse_remote_context, RequestTracer, TracerStack};
use retrace_tracing::value::Value;
use retrace_tracing::HEAD_SAMPLING_TRIGGER_ID;

use crate::rpc::{
    completion_queue, Channel, Completion, CompletionQueue, CqSender, InboundCall, NextStatus,
    Payload, Registrar, ReplyHandle, RpcError, Tag,
};
use crate::topology::{Outcall, ServiceConfig};
use crate::wire::{ExecReply, ExecRequest, HindsightContext, OtelContext};
use crate::work::matrix_multiply;

/// Global trigger counter, recorded on the conventional pipeline so the
/// tail processors can distinguish trigger occurrences.
static TRIGGER: AtomicI64 = AtomicI64::new(1);

#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub nocompute: bool,
    /// Installed triggers as `(queue_id, probability)`.
    pub triggers: Vec<(i64, f64)>,
    pub instance_id: usize,
    /// Admission bound per handler.
    pub max_outstanding_requests: usize,
    /// Fire the head-sampling trigger when a request takes longer than
    /// this; disabled when unset.
    pub latency_trigger_us: Option<u64>,
    pub debug: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        ServerOptions {
            nocompute: false,
            triggers: Vec::new(),
            instance_id: 0,
            max_outstanding_requests: 100,
            latency_trigger_us: None,
            debug: false,
        }
    }
}

/// Integer threshold deciding a trigger with a single RNG draw: fire
/// iff `draw < threshold`.
pub fn trigger_threshold(probability: f64) -> u64 {
    if probability <= 0.0 {
        0
    } else if probability >= 1.0 {
        u64::MAX
    } else {
        u64::MAX / (1.0 / probability).round() as u64
    }
}

#[derive(Default)]
pub struct StageCounters {
    pub awaiting: AtomicU64,
    pub processing: AtomicU64,
    pub awaitingchildren: AtomicU64,
    pub finishing: AtomicU64,
    pub completed: AtomicU64,
}

#[derive(Debug, Clone, Copy)]
pub struct CounterSnapshot {
    pub awaiting: u64,
    pub processing: u64,
    pub awaitingchildren: u64,
    pub finishing: u64,
    pub completed: u64,
}

impl StageCounters {
    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            awaiting: self.awaiting.load(Ordering::Relaxed),
            processing: self.processing.load(Ordering::Relaxed),
            awaitingchildren: self.awaitingchildren.load(Ordering::Relaxed),
            finishing: self.finishing.load(Ordering::Relaxed),
            completed: self.completed.load(Ordering::Relaxed),
        }
    }
}

pub struct ServerImpl {
    pub alive: AtomicBool,
    pub config: ServiceConfig,
    /// This instance's breadcrumb address, stamped on outgoing calls
    /// and replies.
    pub local_address: String,
    pub counters: StageCounters,
    options: ServerOptions,
    /// Precomputed `(queue_id, threshold)` pairs.
    triggers: Vec<(i64, u64)>,
    tracer: TracerStack,
    clients: Mutex<HashMap<String, Channel>>,
    runtime: Handle,
}

impl ServerImpl {
    pub fn new(
        config: ServiceConfig,
        local_address: String,
        tracer: TracerStack,
        options: ServerOptions,
        runtime: Handle,
    ) -> Arc<ServerImpl> {
        let triggers = options
            .triggers
            .iter()
            .map(|(queue, probability)| (*queue, trigger_threshold(*probability)))
            .collect();
        Arc::new(ServerImpl {
            alive: AtomicBool::new(true),
            config,
            local_address,
            counters: StageCounters::default(),
            options,
            triggers,
            tracer,
            clients: Mutex::new(HashMap::new()),
            runtime,
        })
    }

    /// Starts the handler threads. Each handler builds its own state on
    /// its own thread and polls its completion queue until shutdown.
    pub fn spawn_handlers(
        self: &Arc<Self>,
        nhandlers: usize,
        registrar: &Registrar,
    ) -> io::Result<Vec<thread::JoinHandle<()>>> {
        let mut handles = Vec::with_capacity(nhandlers);
        for handler_id in 0..nhandlers {
            let server = Arc::clone(self);
            let registrar = registrar.clone();
            let handle = thread::Builder::new()
                .name(format!("handler-{handler_id}"))
                .spawn(move || ServerHandler::new(server, handler_id, registrar).run())?;
            handles.push(handle);
        }
        Ok(handles)
    }

    /// Periodically logs queue depths between adjacent request stages.
    pub fn spawn_debug_printer(self: &Arc<Self>) -> thread::JoinHandle<()> {
        let server = Arc::clone(self);
        thread::spawn(move || {
            thread::sleep(Duration::from_secs(1));
            let mut last = server.counters.snapshot();
            while server.alive.load(Ordering::Relaxed) {
                thread::sleep(Duration::from_millis(100));
                let cur = server.counters.snapshot();
                info!(
                    "-- Admitting  {} ({})",
                    cur.awaiting.saturating_sub(cur.processing),
                    cur.awaiting.saturating_sub(last.awaiting)
                );
                info!(
                    "   Processing {} ({})",
                    cur.processing.saturating_sub(cur.awaitingchildren),
                    cur.processing.saturating_sub(last.processing)
                );
                info!(
                    "   Children   {} ({})",
                    cur.awaitingchildren.saturating_sub(cur.finishing),
                    cur.awaitingchildren.saturating_sub(last.awaitingchildren)
                );
                info!(
                    "   Finishing  {} ({})",
                    cur.finishing.saturating_sub(cur.completed),
                    cur.finishing.saturating_sub(last.finishing)
                );
                info!("   Completed  {}", cur.completed.saturating_sub(last.completed));
                last = cur;
            }
        })
    }

    pub fn shutdown(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    /// Server-wide client cache: one channel per target address, shared
    /// across handlers.
    fn get_client(&self, address: &str) -> Channel {
        let mut clients = self.clients.lock().unwrap();
        if let Some(channel) = clients.get(address) {
            return channel.clone();
        }
        let channel = Channel::connect(&self.runtime, address);
        clients.insert(address.to_string(), channel.clone());
        channel
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    /// Waiting for an inbound request to land in our receive slot.
    Process,
    AwaitChildren,
    /// Waiting for the outbound reply to flush.
    Finish,
}

struct Request {
    id: u64,
    state: CallState,
    api: String,
    debug: bool,
    interval: u64,
    triggerflag: bool,
    trace_id: u64,
    parent_span_id: u64,
    reply: Option<ReplyHandle>,
    tracer: Option<Box<dyn RequestTracer>>,
    outstanding_children: usize,
    start_time: Instant,
}

impl Request {
    fn new(id: u64) -> Request {
        Request {
            id,
            state: CallState::Process,
            api: String::new(),
            debug: false,
            interval: 0,
            triggerflag: false,
            trace_id: 0,
            parent_span_id: 0,
            reply: None,
            tracer: None,
            outstanding_children: 0,
            start_time: Instant::now(),
        }
    }
}

struct ChildCall {
    request_key: usize,
    outcall: Outcall,
    span_id: u64,
}

/*
Span slots within one request, derived from the inherited parent span id:
  p+1 : Exec
  p+2 : Exec/Process
    p+2+10000+2i   : ChildCall #i
    p+2+10000+2i+1 : ChildCall/Prepare #i
  p+3 : Exec/Finish
  p+4 : Exec/Complete
Child RPCs propagate p+2 so the next hop computes a disjoint range.
*/
const CHILD_SPAN_OFFSET: u64 = 10_000;

struct ServerHandler {
    server: Arc<ServerImpl>,
    handler_id: usize,
    registrar: Registrar,
    cq_tx: CqSender,
    cq: CompletionQueue,
    requests: Slab<Request>,
    children: Slab<ChildCall>,
    clients: HashMap<String, Channel>,
    request_id_seed: u64,
    outstanding_requests: usize,
    admitting_requests: usize,
    draining: bool,
    rng: SmallRng,
}

impl ServerHandler {
    fn new(server: Arc<ServerImpl>, handler_id: usize, registrar: Registrar) -> ServerHandler {
        let (cq_tx, cq) = completion_queue();
        ServerHandler {
            server,
            handler_id,
            registrar,
            cq_tx,
            cq,
            requests: Slab::new(),
            children: Slab::new(),
            clients: HashMap::new(),
            request_id_seed: 0,
            outstanding_requests: 0,
            admitting_requests: 0,
            draining: false,
            rng: SmallRng::from_entropy(),
        }
    }

    /// The handler main loop. Admission is a bang-bang controller:
    /// above half the outstanding bound we stop posting receive slots
    /// and drain; a zero-deadline poll that comes up empty flips us
    /// back to admitting.
    fn run(mut self) {
        self.prepare_next_request();

        let drain_threshold = self.server.options.max_outstanding_requests / 2;
        let idle = Duration::from_millis(100);

        while self.server.alive.load(Ordering::Relaxed) {
            if self.draining {
                if self.admitting_requests == 0 {
                    match self.cq.try_next() {
                        NextStatus::Event(completion) => self.dispatch(completion),
                        NextStatus::Timeout => {
                            self.draining = false;
                            self.prepare_next_request();
                        }
                        NextStatus::Shutdown => break,
                    }
                } else {
                    match self.cq.next_deadline(idle) {
                        NextStatus::Event(completion) => self.dispatch(completion),
                        NextStatus::Timeout => continue,
                        NextStatus::Shutdown => break,
                    }
                }
            } else {
                match self.cq.next_deadline(idle) {
                    NextStatus::Event(completion) => {
                        self.dispatch(completion);
                        if self.outstanding_requests >= drain_threshold {
                            self.draining = true;
                        }
                    }
                    NextStatus::Timeout => continue,
                    NextStatus::Shutdown => break,
                }
            }
        }
        debug!(handler = self.handler_id, "handler exiting");
    }

    fn dispatch(&mut self, completion: Completion) {
        match completion.tag {
            Tag::Request(key) => {
                if !self.requests.contains(key) {
                    warn!("completion for unknown request slot {key}");
                    return;
                }
                match self.requests[key].state {
                    CallState::Process => match completion.payload {
                        Payload::Inbound(call) if completion.ok => self.process_request(key, call),
                        _ => {
                            // The queue is shutting down and no request
                            // actually arrived.
                            self.requests.remove(key);
                            self.outstanding_requests = self.outstanding_requests.saturating_sub(1);
                            self.admitting_requests = self.admitting_requests.saturating_sub(1);
                        }
                    },
                    CallState::Finish => self.finish_request(key, completion.ok),
                    CallState::AwaitChildren => warn!("unexpected transition"),
                }
            }
            Tag::Child(key) => {
                let result = match completion.payload {
                    Payload::ChildReply(result) => result,
                    _ => Err(RpcError::Transport("missing child reply payload".into())),
                };
                self.child_response(key, completion.ok, result);
            }
        }
    }

    /// Posts a new receive slot iff we are admitting and under the
    /// outstanding bound.
    fn prepare_next_request(&mut self) {
        if !self.draining
            && self.admitting_requests == 0
            && self.outstanding_requests < self.server.options.max_outstanding_requests
        {
            let id = self.request_id_seed;
            self.request_id_seed += 1;
            let key = self.requests.insert(Request::new(id));
            self.registrar.request_exec(&self.cq_tx, Tag::Request(key));
            self.server.counters.awaiting.fetch_add(1, Ordering::Relaxed);
            self.outstanding_requests += 1;
            self.admitting_requests += 1;
        }
    }

    fn with_tracer<R>(&self, key: usize, f: impl FnOnce(&dyn RequestTracer) -> R) -> Option<R> {
        self.requests
            .get(key)
            .and_then(|request| request.tracer.as_deref())
            .map(f)
    }

    fn process_request(&mut self, key: usize, call: InboundCall) {
        self.server.counters.processing.fetch_add(1, Ordering::Relaxed);
        let start_time = Instant::now();
        let InboundCall { request, reply } = call;

        if request.debug {
            debug!(
                handler = self.handler_id,
                request_id = self.requests[key].id,
                ?request,
                "received request"
            );
        }

        let remote = request
            .otel
            .as_ref()
            .and_then(|otel| parse_remote_context(&otel.trace_id, &otel.span_id, otel.sample));
        let hindsight_ctx = request
            .hindsight
            .as_ref()
            .map(|h| (h.trace_id, h.span_id));
        let tracer = self.server.tracer.begin_request(hindsight_ctx, remote);
        let (trace_id, parent_span_id) = hindsight_ctx.unwrap_or((0, 0));
        let p = parent_span_id;

        // The end-to-end span for this hop, carrying the inbound
        // breadcrumbs and request metadata.
        tracer.open_request_span(p + 1, names::SPAN_EXEC, p);
        if let Some(hindsight) = &request.hindsight {
            for breadcrumb in &hindsight.breadcrumb {
                tracer.set_attribute(p + 1, names::ATTR_BREADCRUMB, Value::from(breadcrumb.as_str()));
            }
        }
        tracer.set_attribute(p + 1, names::ATTR_API, Value::from(request.api.as_str()));
        tracer.set_attribute(p + 1, names::ATTR_INTERVAL, Value::from(request.interval));

        // This slot is consumed; admit the next inbound request.
        self.admitting_requests = self.admitting_requests.saturating_sub(1);
        self.prepare_next_request();

        tracer.open_subspan(p + 2, names::SPAN_EXEC_PROCESS, p + 1);

        let api_info = self.server.config.get_api(&request.api).cloned();
        if api_info.is_none() {
            warn!("request for unknown API {}", request.api);
        }
        if let Some(api) = &api_info {
            if request.debug {
                debug!("executing API {} exec={}", api.name, api.exec);
            }
            tracer.add_event(p + 2, "Executing API");
            tracer.set_attribute(p + 2, "Exec", Value::from(api.exec));
        }

        let mut exec_duration: i64 = 0;
        if !self.server.options.nocompute {
            let matrix = self.server.config.matrix_config(&request.api);
            if request.debug {
                debug!("executing MatrixConfig [{}, {}, {}]", matrix.m, matrix.n, matrix.k);
            }
            let begin = Instant::now();
            let result = matrix_multiply(&matrix);
            exec_duration = begin.elapsed().as_nanos() as i64;
            if request.debug {
                debug!("took {exec_duration} nanos to calculate {result}");
            }
        }
        tracer.set_attribute(p + 2, "MatrixExec", Value::from(exec_duration));
        tracer.add_event(p + 2, "Calling Children");

        // Bernoulli draw per configured outcall; multi-instance targets
        // pick one subcall uniformly.
        let mut chosen: Vec<Outcall> = Vec::new();
        if let Some(api) = &api_info {
            for child in &api.children {
                if i64::from(self.rng.gen_range(0..100u32)) < child.probability {
                    if child.subcalls.is_empty() {
                        chosen.push(child.clone());
                    } else {
                        let pick = self.rng.gen_range(0..child.subcalls.len());
                        chosen.push(child.subcalls[pick].clone());
                    }
                }
            }
        }

        {
            let req = &mut self.requests[key];
            req.api = request.api.clone();
            req.debug = request.debug;
            req.interval = request.interval;
            req.triggerflag = request.hindsight.as_ref().is_some_and(|h| h.triggerflag);
            req.trace_id = trace_id;
            req.parent_span_id = p;
            req.reply = Some(reply);
            req.tracer = Some(tracer);
            req.start_time = start_time;
        }

        self.server
            .counters
            .awaitingchildren
            .fetch_add(1, Ordering::Relaxed);
        if !chosen.is_empty() {
            self.requests[key].state = CallState::AwaitChildren;
            self.invoke_children(key, chosen);
            self.with_tracer(key, |t| t.add_event(p + 2, "Awaiting Child Responses"));
        } else {
            self.with_tracer(key, |t| t.add_event(p + 2, "Not making child calls"));
            self.complete_request(key);
        }

        if self.requests[key].debug {
            debug!("finished handling request");
        }
        // End the inner span but leave the outer span open.
        self.with_tracer(key, |t| t.close_span(p + 2));
    }

    fn invoke_children(&mut self, key: usize, outcalls: Vec<Outcall>) {
        let (p, debug_on, interval, trace_id) = {
            let req = &self.requests[key];
            (req.parent_span_id, req.debug, req.interval, req.trace_id)
        };
        let mut span_id = p + 2 + CHILD_SPAN_OFFSET;

        for outcall in outcalls {
            let channel = self.get_client(&outcall.server_addr);
            self.requests[key].outstanding_children += 1;
            let child_key = self.children.insert(ChildCall {
                request_key: key,
                outcall: outcall.clone(),
                span_id,
            });

            self.with_tracer(key, |t| {
                t.open_subspan(span_id, names::SPAN_CHILD_CALL, p + 2);
                t.add_event(span_id, "Making child RPC call");
                t.open_subspan(span_id + 1, names::SPAN_CHILD_CALL_PREPARE, span_id);
                t.set_attribute(span_id + 1, "Destination", Value::from(outcall.service_name.as_str()));
                t.set_attribute(span_id + 1, names::ATTR_BREADCRUMB, Value::from(outcall.breadcrumb.as_str()));
                t.set_attribute(span_id + 1, names::ATTR_API, Value::from(outcall.api_name.as_str()));
            });
            if debug_on {
                debug!(
                    "making child RPC call to {} {}:{}",
                    outcall.server_addr, outcall.service_name, outcall.api_name
                );
            }

            let otel = self
                .with_tracer(key, |t| t.otel_wire_context(span_id + 1))
                .flatten()
                .map(|(trace_id, span_id, sample)| OtelContext {
                    trace_id,
                    span_id,
                    sample,
                });
            let hindsight = self
                .with_tracer(key, |t| t.hindsight_enabled())
                .unwrap_or(false)
                .then(|| HindsightContext {
                    trace_id,
                    // The next hop derives its span slots from our
                    // Exec/Process span.
                    span_id: p + 2,
                    triggerflag: false,
                    breadcrumb: vec![self.server.local_address.clone()],
                });
            let request = ExecRequest {
                api: outcall.api_name.clone(),
                payload: Some("payload".into()),
                debug: debug_on,
                interval,
                otel,
                hindsight,
            };

            channel.call(&request, &self.cq_tx, Tag::Child(child_key));

            self.with_tracer(key, |t| {
                t.add_event(span_id + 1, "Child RPC call initiated");
                t.close_span(span_id + 1);
            });
            span_id += 2;
        }
    }

    fn child_response(&mut self, key: usize, ok: bool, result: Result<ExecReply, RpcError>) {
        let Some(child) = self.children.try_remove(key) else {
            warn!("completion for unknown child slot {key}");
            return;
        };
        let request_key = child.request_key;
        if !self.requests.contains(request_key) {
            warn!("child completion for released request");
            return;
        }
        let span_id = child.span_id;
        let debug_on = self.requests[request_key].debug;

        if !ok {
            self.with_tracer(request_key, |t| t.add_event(span_id, "Failed to invoke child"));
            if debug_on {
                debug!("failed to invoke child {}", child.outcall.service_name);
            }
        } else {
            match &result {
                Ok(reply) => {
                    self.with_tracer(request_key, |t| {
                        t.add_event(span_id, "Child response received");
                        t.set_attribute(span_id, "Response payload", Value::from(reply.payload.as_str()));
                        t.set_status(span_id, true, "Child response was OK");
                    });
                    if debug_on {
                        debug!("child response payload: {}", reply.payload);
                    }
                }
                Err(e) => {
                    self.with_tracer(request_key, |t| {
                        t.add_event(span_id, "Child response received");
                        t.set_status(span_id, false, "Child response was not OK");
                    });
                    if debug_on {
                        debug!("child RPC failed: {e}");
                    }
                }
            }
        }
        self.with_tracer(request_key, |t| t.close_span(span_id));

        let remaining = {
            let req = &mut self.requests[request_key];
            req.outstanding_children = req.outstanding_children.saturating_sub(1);
            req.outstanding_children
        };
        if remaining == 0 {
            self.complete_request(request_key);
        }
    }

    /// Assembles and sends the reply, handing the request to the
    /// transport for the final flush completion.
    fn complete_request(&mut self, key: usize) {
        let (p, api, trace_id) = {
            let req = &self.requests[key];
            (req.parent_span_id, req.api.clone(), req.trace_id)
        };

        self.with_tracer(key, |t| t.open_subspan(p + 4, names::SPAN_EXEC_COMPLETE, p + 1));

        let hindsight_on = self
            .with_tracer(key, |t| t.hindsight_enabled())
            .unwrap_or(false);
        let reply = ExecReply {
            payload: format!("Hello {api}"),
            hindsight: hindsight_on.then(|| HindsightContext {
                trace_id,
                span_id: 0,
                triggerflag: false,
                breadcrumb: vec![self.server.local_address.clone()],
            }),
        };

        self.server.counters.finishing.fetch_add(1, Ordering::Relaxed);
        self.requests[key].state = CallState::Finish;
        if let Some(handle) = self.requests[key].reply.take() {
            handle.finish(reply, &self.cq_tx, Tag::Request(key));
        }

        self.with_tracer(key, |t| {
            t.add_event(p + 4, "Sending RPC response");
            t.close_span(p + 4);
            t.close_span(p + 1);
        });
    }

    /// The reply has flushed (or failed); record the outcome, evaluate
    /// triggers, and release the request.
    fn finish_request(&mut self, key: usize, ok: bool) {
        let (p, debug_on, triggerflag) = {
            let req = &self.requests[key];
            (req.parent_span_id, req.debug, req.triggerflag)
        };

        self.with_tracer(key, |t| {
            t.open_subspan(p + 3, names::SPAN_EXEC_FINISH, p + 1);
            t.add_event(p + 3, "Finishing request");
        });

        if ok {
            self.with_tracer(key, |t| t.set_status(p + 3, true, "RPC response was OK"));
            if debug_on {
                debug!("request complete");
            }
        } else {
            self.with_tracer(key, |t| t.set_status(p + 3, false, "RPC response was not OK"));
            if debug_on {
                debug!("RPC response not OK");
            }
        }

        if triggerflag {
            let triggers = self.server.triggers.clone();
            for (queue, threshold) in triggers {
                if self.rng.gen::<u64>() >= threshold {
                    continue;
                }
                let count = TRIGGER.fetch_add(1, Ordering::Relaxed);
                self.with_tracer(key, |t| t.fire_trigger(p + 3, queue, count));
                if debug_on {
                    debug!("triggering for queue {queue}");
                }
            }
            if let Some(threshold_us) = self.server.options.latency_trigger_us {
                let elapsed = self.requests[key].start_time.elapsed().as_micros() as u64;
                if elapsed > threshold_us {
                    let count = TRIGGER.fetch_add(1, Ordering::Relaxed);
                    self.with_tracer(key, |t| {
                        t.fire_trigger(p + 3, HEAD_SAMPLING_TRIGGER_ID, count)
                    });
                }
            }
        }

        self.with_tracer(key, |t| {
            // For mapping child calls across hops in the conventional
            // pipeline.
            t.set_attribute(p + 3, "LocalAddress", Value::from(self.server.local_address.as_str()));
            t.add_event(p + 3, "Request complete");
            t.close_span(p + 3);
        });

        self.outstanding_requests = self.outstanding_requests.saturating_sub(1);
        self.server.counters.completed.fetch_add(1, Ordering::Relaxed);
        // Releasing the request drops its tracer, sealing the trace
        // state back to the agent.
        self.requests.remove(key);
    }

    /// Handler-local client cache over the server-wide one; amortizes
    /// the mutex.
    fn get_client(&mut self, address: &str) -> Channel {
        if let Some(channel) = self.clients.get(address) {
            return channel.clone();
        }
        let channel = self.server.get_client(address);
        self.clients.insert(address.to_string(), channel.clone());
        channel
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigger_threshold_endpoints() {
        assert_eq!(trigger_threshold(0.0), 0);
        assert_eq!(trigger_threshold(-1.0), 0);
        assert_eq!(trigger_threshold(1.0), u64::MAX);
        assert_eq!(trigger_threshold(2.0), u64::MAX);
        assert_eq!(trigger_threshold(0.5), u64::MAX / 2);
        assert_eq!(trigger_threshold(0.1), u64::MAX / 10);
    }

    #[test]
    fn trigger_threshold_never_fires_at_zero() {
        let threshold = trigger_threshold(0.0);
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..10_000 {
            assert!(rng.gen::<u64>() >= threshold);
        }
    }

    #[test]
    fn trigger_threshold_always_fires_at_one() {
        let threshold = trigger_threshold(1.0);
        let mut rng = SmallRng::seed_from_u64(7);
        for _ in 0..10_000 {
            assert!(rng.gen::<u64>() < threshold);
        }
    }

    #[test]
    fn intermediate_threshold_matches_probability() {
        let threshold = trigger_threshold(0.25);
        let mut rng = SmallRng::seed_from_u64(42);
        let fired = (0..200_000).filter(|_| rng.gen::<u64>() < threshold).count();
        let rate = fired as f64 / 200_000.0;
        assert!((rate - 0.25).abs() < 0.01, "rate {rate}");
    }

    #[test]
    fn child_selection_is_bernoulli_per_outcall() {
        let outcall = |name: &str| Outcall {
            service_name: name.into(),
            api_name: "api".into(),
            probability: 50,
            server_addr: "addr".into(),
            breadcrumb: "bc".into(),
            subcalls: Vec::new(),
        };
        let children = vec![outcall("b"), outcall("c")];
        let mut rng = SmallRng::seed_from_u64(3);

        let (mut only_b, mut only_c, mut both) = (0u32, 0u32, 0u32);
        let rounds = 100_000;
        for _ in 0..rounds {
            let picked: Vec<&Outcall> = children
                .iter()
                .filter(|child| i64::from(rng.gen_range(0..100u32)) < child.probability)
                .collect();
            match picked.len() {
                2 => both += 1,
                1 if picked[0].service_name == "b" => only_b += 1,
                1 => only_c += 1,
                _ => {}
            }
        }
        // Independent draws: each edge ~50%, both ~25%.
        let total = rounds as f64;
        assert!(((only_b + both) as f64 / total - 0.5).abs() < 0.02);
        assert!(((only_c + both) as f64 / total - 0.5).abs() < 0.02);
        assert!((both as f64 / total - 0.25).abs() < 0.02);
    }
}
