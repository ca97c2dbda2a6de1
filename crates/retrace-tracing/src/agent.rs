// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The embedded agent: owns every trace's sealed buffers, decides which
//! traces record, and ships buffers to the collector sink when a trigger
//! fires.
//!
//! Buffers are retained optimistically in a bounded registry. A trigger
//! marks its trace for export; the export happens once the last active
//! handle for the trace drops, so the tail of the event stream is never
//! cut off. Firing also forwards the trigger to every breadcrumb
//! recorded for the trace, which is how one hop's decision reaches the
//! other agents that hold fragments of the same trace. A per-agent fired
//! flag makes the propagation terminate. Untriggered traces are evicted
//! oldest-first under memory pressure and are simply lost.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use crate::record::TraceHeader;
use crate::sink::BufferSink;
use crate::state::TraceState;
use crate::HEAD_SAMPLING_TRIGGER_ID;

/// Total size of one buffer as exported, trace header included.
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent identity: the breadcrumb address (`hostname:agent_port`)
    /// other hops use to reach this agent. Stamped on every exported
    /// record.
    pub name: String,
    /// Bind address for the trigger listener; `None` disables remote
    /// triggers (single-service setups).
    pub listen: Option<String>,
    /// Exported buffer size including the trace header.
    pub buffer_size: usize,
    /// Registry bound; completed untriggered traces past this are
    /// evicted oldest-first.
    pub max_retained_traces: usize,
    /// Probability that a new trace is head-sampled. Head-sampled traces
    /// immediately fire [`HEAD_SAMPLING_TRIGGER_ID`].
    pub head_sampling: f64,
    /// Probability that a new trace records at all.
    pub retroactive_sampling: f64,
}

impl AgentConfig {
    pub fn new(name: impl Into<String>) -> Self {
        AgentConfig {
            name: name.into(),
            listen: None,
            buffer_size: DEFAULT_BUFFER_SIZE,
            max_retained_traces: 65_536,
            head_sampling: 0.0,
            retroactive_sampling: 1.0,
        }
    }
}

/// A buffer detached from its trace state, ready for export.
#[derive(Debug, Clone)]
pub struct SealedBuffer {
    pub header: TraceHeader,
    pub payload: Vec<u8>,
}

impl SealedBuffer {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(crate::record::TRACE_HEADER_LEN + self.payload.len());
        self.header.encode_into(&mut out);
        out.extend_from_slice(&self.payload);
        out
    }
}

#[derive(Default)]
struct TraceRecord {
    buffers: Vec<SealedBuffer>,
    breadcrumbs: Vec<String>,
    fired: bool,
    active: usize,
}

#[derive(Default)]
struct Registry {
    traces: HashMap<u64, TraceRecord>,
    order: VecDeque<u64>,
}

impl Registry {
    fn record_mut(&mut self, trace_id: u64) -> &mut TraceRecord {
        if !self.traces.contains_key(&trace_id) {
            self.traces.insert(trace_id, TraceRecord::default());
            self.order.push_back(trace_id);
        }
        self.traces.get_mut(&trace_id).unwrap()
    }

    fn evict_to(&mut self, max: usize) {
        let mut scanned = 0;
        let limit = self.order.len();
        while self.traces.len() > max && scanned < limit {
            scanned += 1;
            let Some(id) = self.order.pop_front() else {
                break;
            };
            match self.traces.get(&id) {
                Some(rec) if rec.active == 0 && !rec.fired => {
                    self.traces.remove(&id);
                }
                Some(_) => self.order.push_back(id),
                None => {}
            }
        }
    }
}

enum ReporterJob {
    Export(Vec<SealedBuffer>),
    Propagate {
        targets: Vec<String>,
        trace_id: u64,
        queue: i64,
    },
    Flush(Sender<()>),
    Shutdown(Sender<()>),
}

#[derive(Serialize, Deserialize)]
struct TriggerMsg {
    trace_id: u64,
    queue: i64,
}

pub(crate) struct AgentCore {
    pub(crate) config: AgentConfig,
    next_buffer_id: AtomicI32,
    registry: Mutex<Registry>,
    jobs: Sender<ReporterJob>,
}

impl AgentCore {
    pub(crate) fn next_buffer_id(&self) -> i32 {
        self.next_buffer_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn trace_started(&self, trace_id: u64) {
        let mut reg = self.registry.lock().unwrap();
        reg.record_mut(trace_id).active += 1;
        let max = self.config.max_retained_traces;
        reg.evict_to(max);
    }

    /// Parks a sealed buffer until its trace is triggered or evicted.
    pub(crate) fn retain_buffer(&self, buffer: SealedBuffer) {
        let mut reg = self.registry.lock().unwrap();
        reg.record_mut(buffer.header.trace_id).buffers.push(buffer);
    }

    pub(crate) fn report_breadcrumb(&self, trace_id: u64, address: &str) {
        let mut reg = self.registry.lock().unwrap();
        let rec = reg.record_mut(trace_id);
        if !rec.breadcrumbs.iter().any(|b| b == address) {
            rec.breadcrumbs.push(address.to_string());
        }
    }

    /// Marks a trace for export and forwards the trigger along the
    /// trace's breadcrumbs. Idempotent per trace.
    pub(crate) fn fire_trigger(&self, queue: i64, trace_id: u64) {
        let (export, targets) = {
            let mut reg = self.registry.lock().unwrap();
            let rec = reg.record_mut(trace_id);
            if rec.fired {
                return;
            }
            rec.fired = true;
            let export = if rec.active == 0 && !rec.buffers.is_empty() {
                Some(std::mem::take(&mut rec.buffers))
            } else {
                None
            };
            (export, rec.breadcrumbs.clone())
        };
        debug!(trace_id, queue, "trigger fired");
        if let Some(buffers) = export {
            // Fire-and-forget: a trigger that cannot be enqueued is lost.
            let _ = self.jobs.send(ReporterJob::Export(buffers));
        }
        let targets: Vec<String> = targets
            .into_iter()
            .filter(|t| *t != self.config.name)
            .collect();
        if !targets.is_empty() {
            let _ = self.jobs.send(ReporterJob::Propagate {
                targets,
                trace_id,
                queue,
            });
        }
    }

    /// Called when a trace handle drops. Seals the handle's last buffer
    /// and exports the trace if it was triggered.
    pub(crate) fn trace_ended(&self, trace_id: u64, last: Option<SealedBuffer>) {
        let export = {
            let mut reg = self.registry.lock().unwrap();
            let rec = reg.record_mut(trace_id);
            if let Some(buffer) = last {
                rec.buffers.push(buffer);
            }
            rec.active = rec.active.saturating_sub(1);
            if rec.fired && rec.active == 0 && !rec.buffers.is_empty() {
                Some(std::mem::take(&mut rec.buffers))
            } else {
                None
            }
        };
        if let Some(buffers) = export {
            let _ = self.jobs.send(ReporterJob::Export(buffers));
        }
    }
}

/// Head/retroactive sampling: deterministic in the trace id so every hop
/// of a trace reaches the same decision.
pub(crate) fn sample_based_on_probability(prob: f64, trace_id: u64) -> bool {
    if prob >= 1.0 {
        return true;
    }
    if prob <= 0.0 {
        return false;
    }
    let upper_bound = (prob * (1u64 << 63) as f64) as u64;
    (trace_id >> 1) < upper_bound
}

/// A running agent. Owns the reporter thread (exports and trigger
/// propagation) and the optional trigger listener.
pub struct Agent {
    core: Arc<AgentCore>,
    reporter: Option<thread::JoinHandle<()>>,
    listener: Option<thread::JoinHandle<()>>,
    listen_addr: Option<SocketAddr>,
    shutting_down: Arc<AtomicBool>,
}

/// Cheap handle for opening traces against a running [`Agent`].
#[derive(Clone)]
pub struct AgentHandle {
    core: Arc<AgentCore>,
}

impl AgentHandle {
    /// Opens per-trace state for one request. The sampler decides here
    /// whether the trace records; head-sampled traces immediately fire
    /// the head-sampling trigger so their buffers are always kept.
    pub fn begin_trace(&self, trace_id: u64, parent_span_id: u64) -> TraceState {
        let recording =
            sample_based_on_probability(self.core.config.retroactive_sampling, trace_id);
        let head_sampled = sample_based_on_probability(self.core.config.head_sampling, trace_id);
        self.core.trace_started(trace_id);
        let state = TraceState::begin(
            Arc::clone(&self.core),
            trace_id,
            parent_span_id,
            recording,
            head_sampled,
        );
        if head_sampled {
            state.trigger(HEAD_SAMPLING_TRIGGER_ID);
        }
        state
    }

    pub fn name(&self) -> &str {
        &self.core.config.name
    }
}

impl Agent {
    pub fn start(config: AgentConfig, sink: BufferSink) -> io::Result<Agent> {
        let (jobs_tx, jobs_rx) = crossbeam_channel::unbounded();
        let shutting_down = Arc::new(AtomicBool::new(false));

        let (listener, listen_addr) = match &config.listen {
            Some(addr) => {
                let listener = TcpListener::bind(addr)?;
                let local = listener.local_addr()?;
                (Some(listener), Some(local))
            }
            None => (None, None),
        };

        let core = Arc::new(AgentCore {
            next_buffer_id: AtomicI32::new(0),
            registry: Mutex::new(Registry::default()),
            jobs: jobs_tx,
            config,
        });

        let reporter = {
            let name = core.config.name.clone();
            thread::Builder::new()
                .name("agent-reporter".into())
                .spawn(move || reporter_loop(name, sink, jobs_rx))?
        };

        let listener_thread = match listener {
            Some(listener) => {
                let core = Arc::clone(&core);
                let stop = Arc::clone(&shutting_down);
                Some(
                    thread::Builder::new()
                        .name("agent-triggers".into())
                        .spawn(move || listener_loop(listener, core, stop))?,
                )
            }
            None => None,
        };

        Ok(Agent {
            core,
            reporter: Some(reporter),
            listener: listener_thread,
            listen_addr,
            shutting_down,
        })
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            core: Arc::clone(&self.core),
        }
    }

    /// Blocks until every export queued so far has reached the sink.
    pub fn flush(&self) {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.core.jobs.send(ReporterJob::Flush(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
    }

    /// Drains pending exports, flushes the sink, and stops both threads.
    pub fn shutdown(mut self) {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.core.jobs.send(ReporterJob::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.recv();
        }
        if let Some(reporter) = self.reporter.take() {
            let _ = reporter.join();
        }
        self.shutting_down.store(true, Ordering::SeqCst);
        if let (Some(listener), Some(addr)) = (self.listener.take(), self.listen_addr) {
            // Wake the blocking accept so the thread observes the flag.
            let _ = TcpStream::connect(addr);
            let _ = listener.join();
        }
    }
}

fn reporter_loop(agent_name: String, mut sink: BufferSink, jobs: Receiver<ReporterJob>) {
    for job in jobs {
        match job {
            ReporterJob::Export(buffers) => {
                for buffer in &buffers {
                    if let Err(e) = sink.write_record(&agent_name, &buffer.to_bytes()) {
                        error!("failed to export buffer: {e}");
                    }
                }
                if let Err(e) = sink.flush() {
                    error!("failed to flush buffer sink: {e}");
                }
            }
            ReporterJob::Propagate {
                targets,
                trace_id,
                queue,
            } => {
                for target in targets {
                    if let Err(e) = notify_trigger(&target, trace_id, queue) {
                        debug!("trigger propagation to {target} failed: {e}");
                    }
                }
            }
            ReporterJob::Flush(ack) => {
                if let Err(e) = sink.flush() {
                    error!("failed to flush buffer sink: {e}");
                }
                let _ = ack.send(());
            }
            ReporterJob::Shutdown(ack) => {
                if let Err(e) = sink.flush() {
                    error!("failed to flush buffer sink: {e}");
                }
                let _ = ack.send(());
                break;
            }
        }
    }
}

fn notify_trigger(target: &str, trace_id: u64, queue: i64) -> io::Result<()> {
    let mut stream = TcpStream::connect(target)?;
    stream.set_write_timeout(Some(Duration::from_secs(2)))?;
    let msg = rmp_serde::to_vec(&TriggerMsg { trace_id, queue })
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    stream.write_all(&msg)?;
    Ok(())
}

fn listener_loop(listener: TcpListener, core: Arc<AgentCore>, stop: Arc<AtomicBool>) {
    for stream in listener.incoming() {
        if stop.load(Ordering::SeqCst) {
            break;
        }
        let mut stream = match stream {
            Ok(s) => s,
            Err(e) => {
                warn!("trigger listener accept failed: {e}");
                continue;
            }
        };
        let _ = stream.set_read_timeout(Some(Duration::from_secs(2)));
        let mut raw = Vec::new();
        if stream.read_to_end(&mut raw).is_err() {
            continue;
        }
        match rmp_serde::from_slice::<TriggerMsg>(&raw) {
            Ok(msg) => core.fire_trigger(msg.queue, msg.trace_id),
            Err(e) => warn!("malformed trigger notification: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_core() -> (Arc<AgentCore>, Receiver<ReporterJob>) {
        let (jobs, jobs_rx) = crossbeam_channel::unbounded();
        let core = Arc::new(AgentCore {
            config: AgentConfig::new("127.0.0.1:7001"),
            next_buffer_id: AtomicI32::new(0),
            registry: Mutex::new(Registry::default()),
            jobs,
        });
        (core, jobs_rx)
    }

    fn sealed(trace_id: u64, buffer_id: i32) -> SealedBuffer {
        SealedBuffer {
            header: TraceHeader {
                trace_id,
                buffer_id,
                prev_buffer_id: buffer_id,
                buffer_number: 0,
                payload_len: 0,
            },
            payload: Vec::new(),
        }
    }

    #[test]
    fn sampler_endpoints() {
        assert!(sample_based_on_probability(1.0, 12345));
        assert!(!sample_based_on_probability(0.0, 12345));
        // Deterministic per trace id: same answer twice.
        let a = sample_based_on_probability(0.5, 99);
        assert_eq!(a, sample_based_on_probability(0.5, 99));
    }

    #[test]
    fn trigger_exports_once_per_trace() {
        let (core, jobs) = test_core();
        core.trace_started(7);
        core.retain_buffer(sealed(7, 0));
        core.trace_ended(7, Some(sealed(7, 1)));

        core.fire_trigger(3, 7);
        match jobs.try_recv() {
            Ok(ReporterJob::Export(buffers)) => assert_eq!(buffers.len(), 2),
            other => panic!("expected export job, got {:?}", other.is_ok()),
        }

        // Second trigger for the same trace is a no-op.
        core.fire_trigger(4, 7);
        assert!(jobs.try_recv().is_err());
    }

    #[test]
    fn trigger_before_end_defers_export() {
        let (core, jobs) = test_core();
        core.trace_started(9);
        core.retain_buffer(sealed(9, 0));
        core.fire_trigger(3, 9);
        assert!(jobs.try_recv().is_err());

        core.trace_ended(9, Some(sealed(9, 1)));
        match jobs.try_recv() {
            Ok(ReporterJob::Export(buffers)) => assert_eq!(buffers.len(), 2),
            other => panic!("expected export job, got {:?}", other.is_ok()),
        }
    }

    #[test]
    fn propagation_skips_self_and_dedupes() {
        let (core, jobs) = test_core();
        core.trace_started(11);
        core.report_breadcrumb(11, "127.0.0.1:7001"); // self
        core.report_breadcrumb(11, "10.0.0.2:7001");
        core.report_breadcrumb(11, "10.0.0.2:7001");
        core.trace_ended(11, Some(sealed(11, 0)));

        core.fire_trigger(3, 11);
        let mut saw_propagate = false;
        while let Ok(job) = jobs.try_recv() {
            if let ReporterJob::Propagate { targets, .. } = job {
                assert_eq!(targets, vec!["10.0.0.2:7001".to_string()]);
                saw_propagate = true;
            }
        }
        assert!(saw_propagate);
    }

    #[test]
    fn eviction_drops_oldest_completed_traces() {
        let (core, _jobs) = test_core();
        let max = core.config.max_retained_traces;
        for id in 0..(max as u64 + 10) {
            core.trace_started(id);
            core.trace_ended(id, Some(sealed(id, id as i32)));
        }
        let reg = core.registry.lock().unwrap();
        assert!(reg.traces.len() <= max + 1);
        // The newest trace must still be present.
        assert!(reg.traces.contains_key(&(max as u64 + 9)));
    }

    #[test]
    fn remote_trigger_roundtrip() {
        let config = AgentConfig {
            listen: Some("127.0.0.1:0".into()),
            ..AgentConfig::new("127.0.0.1:0")
        };
        // Bind on an ephemeral port, then address the agent directly.
        let listener = TcpListener::bind(config.listen.as_deref().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        let (core, jobs) = test_core();
        let stop = Arc::new(AtomicBool::new(false));
        let core2 = Arc::clone(&core);
        let stop2 = Arc::clone(&stop);
        let handle = thread::spawn(move || listener_loop(listener, core2, stop2));

        core.trace_started(21);
        core.trace_ended(21, Some(sealed(21, 0)));
        notify_trigger(&addr.to_string(), 21, 5).unwrap();

        let job = jobs
            .recv_timeout(Duration::from_secs(5))
            .expect("expected an export after the remote trigger");
        assert!(matches!(job, ReporterJob::Export(_)));

        stop.store(true, Ordering::SeqCst);
        let _ = TcpStream::connect(addr);
        handle.join().unwrap();
    }
}
