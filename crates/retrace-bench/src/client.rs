// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The load generator. Each client thread owns one channel and one
//! completion queue and submits requests in one of two modes: closed
//! loop (a fixed number of requests kept in flight) or open loop (a
//! Poisson arrival process, capped at twice the target rate's worth of
//! outstanding requests so overload cannot grow the queue without
//! bound).

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use opentelemetry_sdk::trace::{IdGenerator, RandomIdGenerator};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use slab::Slab;
use tracing::{debug, error, info};

use crate::rpc::{completion_queue, Channel, CompletionQueue, CqSender, NextStatus, Payload, Tag};
use crate::wire::{ExecRequest, HindsightContext, OtelContext};

/// Sentinel span id meaning "no parent" on the conventional pipeline.
const NO_PARENT_SPAN_ID: &str = "ffffffffffffffff";

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub openloop: bool,
    /// Closed loop: concurrent outstanding requests. Open loop:
    /// requests per second.
    pub requests: u64,
    /// Total requests to submit before exiting; 0 means unlimited.
    pub max_requests: u64,
    /// Interval window size in microseconds; requests are grouped into
    /// these windows for offline analysis.
    pub interval_us: u64,
    /// Head-sampling probability for the conventional pipeline.
    pub sampling: f64,
    pub debug: bool,
}

/// Round-trip latency statistics in microseconds, excluding warm-up.
#[derive(Debug, Clone, Copy)]
pub struct ClientStats {
    pub min_latency_us: u64,
    pub max_latency_us: u64,
    pub sum_latency_us: u64,
    pub count: u64,
}

impl Default for ClientStats {
    fn default() -> Self {
        ClientStats {
            min_latency_us: u64::MAX,
            max_latency_us: 0,
            sum_latency_us: 0,
            count: 0,
        }
    }
}

impl ClientStats {
    fn record(&mut self, latency_us: u64) {
        self.min_latency_us = self.min_latency_us.min(latency_us);
        self.max_latency_us = self.max_latency_us.max(latency_us);
        self.sum_latency_us += latency_us;
        self.count += 1;
    }

    pub fn merge(&mut self, other: &ClientStats) {
        self.min_latency_us = self.min_latency_us.min(other.min_latency_us);
        self.max_latency_us = self.max_latency_us.max(other.max_latency_us);
        self.sum_latency_us += other.sum_latency_us;
        self.count += other.count;
    }

    pub fn avg_latency_us(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum_latency_us as f64 / self.count as f64
        }
    }
}

/// Head-sampling decision, preserving the reference implementation's
/// literal expression `rand() / p > RAND_MAX ? false : true`.
pub fn sample_flag(draw: u32, sampling: f64) -> bool {
    !((draw as f64) / sampling > u32::MAX as f64)
}

/// One exponential interarrival gap in nanoseconds for an open-loop
/// client submitting `requests_per_sec` on average.
pub fn exp_interarrival_ns(rng: &mut SmallRng, requests_per_sec: u64) -> f64 {
    let mean_ns = 1e9 / requests_per_sec.max(1) as f64;
    let u: f64 = rng.gen();
    -(1.0 - u).ln() * mean_ns
}

fn now_us() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

fn now_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64
}

struct CallData {
    start_us: u64,
}

pub struct LoadClient {
    channel: Channel,
    apis: Vec<String>,
    options: ClientOptions,
    cq_tx: CqSender,
    cq: CompletionQueue,
    calls: Slab<CallData>,
    rng: SmallRng,
    id_generator: RandomIdGenerator,
    alive: Arc<AtomicBool>,
    global_count: Arc<AtomicU64>,
    error_reported: Arc<AtomicBool>,
    stats: ClientStats,
}

impl LoadClient {
    pub fn new(
        id: u64,
        channel: Channel,
        apis: Vec<String>,
        options: ClientOptions,
        alive: Arc<AtomicBool>,
        global_count: Arc<AtomicU64>,
        error_reported: Arc<AtomicBool>,
    ) -> LoadClient {
        let (cq_tx, cq) = completion_queue();
        LoadClient {
            channel,
            apis,
            options,
            cq_tx,
            cq,
            calls: Slab::new(),
            rng: SmallRng::seed_from_u64(id),
            id_generator: RandomIdGenerator::default(),
            alive,
            global_count,
            error_reported,
            stats: ClientStats::default(),
        }
    }

    /// Runs the submission/completion loop until the limit is reached
    /// or the client is stopped. Returns this client's latency stats.
    pub fn run(mut self) -> ClientStats {
        // One second of lead-in before latency is recorded.
        let warmup_until = now_us() + 1_000_000;
        let mut sent: u64 = 0;
        let mut received: u64 = 0;
        let max_outstanding = 2 * self.options.requests;
        let idle = Duration::from_millis(100);

        let ns_per_request = 1_000_000_000u64 / self.options.requests.max(1);
        let mut next_request_at =
            now_ns() + (ns_per_request as f64 * self.rng.gen::<f64>()) as u64;

        if !self.options.openloop {
            for _ in 0..self.options.requests {
                sent += 1;
                self.exec_next();
            }
        }

        while self.alive.load(Ordering::Relaxed) {
            let status = if self.options.openloop {
                let t = now_ns();
                if t >= next_request_at {
                    NextStatus::Timeout
                } else {
                    self.cq
                        .next_deadline(Duration::from_nanos(next_request_at - t))
                }
            } else {
                self.cq.next_deadline(idle)
            };

            match status {
                NextStatus::Timeout => {
                    if !self.options.openloop {
                        continue;
                    }
                    next_request_at +=
                        exp_interarrival_ns(&mut self.rng, self.options.requests) as u64;
                    if self.options.max_requests == 0 || sent < self.options.max_requests {
                        if sent - received < max_outstanding {
                            sent += 1;
                            self.exec_next();
                        }
                    } else if received < self.options.max_requests {
                        continue;
                    } else {
                        break;
                    }
                }
                NextStatus::Event(completion) => {
                    let Tag::Child(key) = completion.tag else {
                        continue;
                    };
                    let Some(call) = self.calls.try_remove(key) else {
                        continue;
                    };
                    match completion.payload {
                        Payload::ChildReply(Ok(reply)) if completion.ok => {
                            self.error_reported.store(false, Ordering::Relaxed);
                            received += 1;
                            self.global_count.fetch_add(1, Ordering::Relaxed);
                            if call.start_us > warmup_until {
                                self.stats.record(now_us().saturating_sub(call.start_us));
                            }
                            if self.options.debug {
                                debug!("reply payload: {}", reply.payload);
                            }
                        }
                        Payload::ChildReply(Err(e)) => {
                            if !self.error_reported.swap(true, Ordering::Relaxed) {
                                error!("call did not return OK status: {e}");
                            }
                        }
                        _ => {
                            if !self.error_reported.swap(true, Ordering::Relaxed) {
                                error!("error in RPC completion queue");
                            }
                        }
                    }
                    if !self.options.openloop {
                        if self.options.max_requests == 0 || sent < self.options.max_requests {
                            sent += 1;
                            self.exec_next();
                        } else if received < self.options.max_requests {
                            continue;
                        } else {
                            break;
                        }
                    }
                }
                NextStatus::Shutdown => break,
            }
        }
        self.stats
    }

    fn exec_next(&mut self) {
        let api = self.apis[self.rng.gen_range(0..self.apis.len())].clone();
        self.exec(&api);
    }

    fn exec(&mut self, api: &str) {
        let start_us = now_us();
        let key = self.calls.insert(CallData { start_us });
        let interval = start_us / self.options.interval_us.max(1);

        // The two pipelines agree on trace identity: the optimistic
        // trace id is the first 8 bytes of the 128-bit id.
        let trace_id = self.id_generator.new_trace_id();
        let trace_id_hex = format!("{trace_id:032x}");
        let bytes = trace_id.to_bytes();
        let mut first8 = [0u8; 8];
        first8.copy_from_slice(&bytes[..8]);
        let hindsight_trace_id = u64::from_le_bytes(first8);

        let sample = sample_flag(self.rng.gen::<u32>(), self.options.sampling);

        let request = ExecRequest {
            api: api.to_string(),
            payload: None,
            debug: self.options.debug,
            interval,
            otel: Some(OtelContext {
                trace_id: trace_id_hex,
                span_id: NO_PARENT_SPAN_ID.to_string(),
                sample,
            }),
            hindsight: Some(HindsightContext {
                trace_id: hindsight_trace_id,
                span_id: 0,
                triggerflag: true,
                breadcrumb: Vec::new(),
            }),
        };
        self.channel.call(&request, &self.cq_tx, Tag::Child(key));
    }
}

/// Rolling throughput printer; reports once per second from the shared
/// completion counter until stopped.
pub fn spawn_throughput_printer(
    alive: Arc<AtomicBool>,
    global_count: Arc<AtomicU64>,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        thread::sleep(Duration::from_secs(1));
        let mut last = global_count.load(Ordering::Relaxed);
        while alive.load(Ordering::Relaxed) {
            thread::sleep(Duration::from_secs(1));
            let current = global_count.load(Ordering::Relaxed);
            info!("{} requests/s ({current} total)", current - last);
            last = current;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_flag_endpoints() {
        // p = 1: every draw samples.
        assert!(sample_flag(0, 1.0));
        assert!(sample_flag(u32::MAX, 1.0));
        // p = 0: division yields infinity, which never samples (except
        // the draw-zero NaN edge the reference shares).
        assert!(!sample_flag(1, 0.0));
        assert!(!sample_flag(u32::MAX, 0.0));
    }

    #[test]
    fn sample_flag_matches_probability() {
        let mut rng = SmallRng::seed_from_u64(11);
        let rounds = 200_000;
        let sampled = (0..rounds)
            .filter(|_| sample_flag(rng.gen::<u32>(), 0.3))
            .count();
        let rate = sampled as f64 / rounds as f64;
        assert!((rate - 0.3).abs() < 0.01, "rate {rate}");
    }

    #[test]
    fn interarrival_mean_matches_rate() {
        let mut rng = SmallRng::seed_from_u64(5);
        let rate = 1000u64;
        let rounds = 200_000;
        let total: f64 = (0..rounds).map(|_| exp_interarrival_ns(&mut rng, rate)).sum();
        let mean = total / rounds as f64;
        let expected = 1e9 / rate as f64;
        assert!(
            (mean - expected).abs() < expected * 0.02,
            "mean {mean} expected {expected}"
        );
    }

    #[test]
    fn stats_track_extremes_and_sum() {
        let mut stats = ClientStats::default();
        stats.record(10);
        stats.record(30);
        stats.record(20);
        assert_eq!(stats.min_latency_us, 10);
        assert_eq!(stats.max_latency_us, 30);
        assert_eq!(stats.count, 3);
        assert_eq!(stats.avg_latency_us(), 20.0);

        let mut merged = ClientStats::default();
        merged.record(5);
        merged.merge(&stats);
        assert_eq!(merged.min_latency_us, 5);
        assert_eq!(merged.max_latency_us, 30);
        assert_eq!(merged.count, 4);
    }
}
