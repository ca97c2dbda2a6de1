// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! End-to-end scenarios: real servers on localhost, a real client, and
//! offline reconstruction of whatever the agents exported.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicU64};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use retrace_bench::client::{ClientOptions, LoadClient};
use retrace_bench::rpc::{completion_queue, Channel, NextStatus, Payload, RpcServer, Tag};
use retrace_bench::server::{ServerImpl, ServerOptions};
use retrace_bench::topology;
use retrace_bench::wire::{ExecRequest, HindsightContext, OtelContext};
use retrace_tracing::agent::{Agent, AgentConfig};
use retrace_tracing::sink::BufferSink;
use retrace_tracing::strategy::TracerStack;

struct Service {
    server: Arc<ServerImpl>,
    rpc: RpcServer,
    handlers: Vec<thread::JoinHandle<()>>,
}

fn start_service(
    runtime: &tokio::runtime::Runtime,
    topology_json: &str,
    addresses_json: &str,
    name: &str,
    bind: &str,
    breadcrumb: &str,
    tracer: TracerStack,
    options: ServerOptions,
) -> Service {
    let addresses = topology::parse_addresses(addresses_json).unwrap();
    let config = topology::service_config(topology_json, name, &addresses).unwrap();
    let rpc = RpcServer::bind(runtime.handle(), bind).unwrap();
    let server = ServerImpl::new(
        config,
        breadcrumb.to_string(),
        tracer,
        options,
        runtime.handle().clone(),
    );
    let registrar = rpc.registrar();
    let handlers = server.spawn_handlers(2, &registrar).unwrap();
    Service {
        server,
        rpc,
        handlers,
    }
}

fn stop_service(service: Service) {
    service.server.shutdown();
    service.rpc.shutdown();
    for handler in service.handlers {
        let _ = handler.join();
    }
}

fn run_closed_loop(
    runtime: &tokio::runtime::Runtime,
    target: &str,
    apis: Vec<String>,
    total: u64,
    in_flight: u64,
) -> u64 {
    let alive = Arc::new(AtomicBool::new(true));
    let count = Arc::new(AtomicU64::new(0));
    let errors = Arc::new(AtomicBool::new(false));
    let channel = Channel::connect(runtime.handle(), target);
    let client = LoadClient::new(
        1,
        channel,
        apis,
        ClientOptions {
            openloop: false,
            requests: in_flight,
            max_requests: total,
            interval_us: 10_000_000,
            sampling: 1.0,
            debug: false,
        },
        Arc::clone(&alive),
        Arc::clone(&count),
        errors,
    );
    let worker = thread::spawn(move || client.run());
    let _ = worker.join().unwrap();
    count.load(std::sync::atomic::Ordering::Relaxed)
}

mod standalone {
    use super::*;

    const TOPOLOGY: &str = r#"{"services": [
        {"name": "service1", "apis": [{"name": "api1", "exec": 10, "children": []}]}
    ]}"#;
    const ADDRESSES: &str = r#"{"addresses": [
        {"name": "service1", "deploy_addr": "127.0.0.1", "hostname": "127.0.0.1",
         "port": "42151", "agent_port": "42161"}
    ]}"#;

    #[test]
    fn closed_loop_requests_all_complete() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let service = start_service(
            &runtime,
            TOPOLOGY,
            ADDRESSES,
            "service1",
            "127.0.0.1:42151",
            "127.0.0.1:42161",
            TracerStack::None,
            ServerOptions {
                nocompute: true,
                ..ServerOptions::default()
            },
        );

        // A single direct call answers with the API's payload.
        let (cq_tx, cq) = completion_queue();
        let channel = Channel::connect(runtime.handle(), "127.0.0.1:42151");
        let request = ExecRequest {
            api: "api1".into(),
            payload: None,
            debug: false,
            interval: 0,
            otel: Some(OtelContext {
                trace_id: "0123456789abcdef0123456789abcdef".into(),
                span_id: "ffffffffffffffff".into(),
                sample: true,
            }),
            hindsight: Some(HindsightContext {
                trace_id: 77,
                span_id: 0,
                triggerflag: true,
                breadcrumb: Vec::new(),
            }),
        };
        channel.call(&request, &cq_tx, Tag::Child(0));
        match cq.next_deadline(Duration::from_secs(10)) {
            NextStatus::Event(completion) => {
                assert!(completion.ok);
                match completion.payload {
                    Payload::ChildReply(Ok(reply)) => {
                        assert_eq!(reply.payload, "Hello api1");
                        // No tracing configured, so no context mirrored.
                        assert!(reply.hindsight.is_none());
                    }
                    other => panic!("unexpected payload: {other:?}"),
                }
            }
            other => panic!("no completion: {other:?}"),
        }

        // A closed-loop run completes the full request budget.
        let completed = run_closed_loop(
            &runtime,
            "127.0.0.1:42151",
            vec!["api1".to_string()],
            100,
            4,
        );
        assert_eq!(completed, 100);

        stop_service(service);
    }
}

mod chain {
    use super::*;
    use retrace_processor::report::ALL_SENTINEL;
    use retrace_processor::trace::TraceStatus;

    const TOPOLOGY: &str = r#"{"services": [
        {"name": "svc-a", "apis": [{"name": "api1", "exec": 10, "children": [
            {"service": "svc-b", "api": "api2", "probability": 100}
        ]}]},
        {"name": "svc-b", "apis": [{"name": "api2", "exec": 5, "children": []}]}
    ]}"#;
    const ADDRESSES: &str = r#"{"addresses": [
        {"name": "svc-a", "deploy_addr": "127.0.0.1", "hostname": "127.0.0.1",
         "port": "42251", "agent_port": "42261"},
        {"name": "svc-b", "deploy_addr": "127.0.0.1", "hostname": "127.0.0.1",
         "port": "42252", "agent_port": "42262"}
    ]}"#;
    const BREADCRUMB_A: &str = "127.0.0.1:42261";
    const BREADCRUMB_B: &str = "127.0.0.1:42262";

    fn start_agent(breadcrumb: &str, path: &std::path::Path) -> Agent {
        let config = AgentConfig {
            listen: Some(breadcrumb.to_string()),
            ..AgentConfig::new(breadcrumb)
        };
        Agent::start(config, BufferSink::file(path).unwrap()).unwrap()
    }

    /// Two-service chain with trigger `7:1.0` installed on the entry
    /// service: every trace is exported from both agents and
    /// reconstructs as Valid, with matching breadcrumbs on the sender
    /// and receiver sides.
    #[test]
    fn triggered_traces_reconstruct_across_services() {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let log_a = dir.path().join("a.buffers");
        let log_b = dir.path().join("b.buffers");

        let agent_a = start_agent(BREADCRUMB_A, &log_a);
        let agent_b = start_agent(BREADCRUMB_B, &log_b);

        let service_b = start_service(
            &runtime,
            TOPOLOGY,
            ADDRESSES,
            "svc-b",
            "127.0.0.1:42252",
            BREADCRUMB_B,
            TracerStack::Hindsight {
                agent: agent_b.handle(),
            },
            ServerOptions {
                nocompute: true,
                ..ServerOptions::default()
            },
        );
        let service_a = start_service(
            &runtime,
            TOPOLOGY,
            ADDRESSES,
            "svc-a",
            "127.0.0.1:42251",
            BREADCRUMB_A,
            TracerStack::Hindsight {
                agent: agent_a.handle(),
            },
            ServerOptions {
                nocompute: true,
                triggers: vec![(7, 1.0)],
                ..ServerOptions::default()
            },
        );

        let completed = run_closed_loop(
            &runtime,
            "127.0.0.1:42251",
            vec!["api1".to_string()],
            10,
            2,
        );
        assert_eq!(completed, 10);

        // Let trigger propagation and exports settle before tearing
        // down.
        thread::sleep(Duration::from_millis(1000));

        stop_service(service_a);
        stop_service(service_b);
        agent_a.shutdown();
        agent_b.shutdown();

        let combined = dir.path().join("combined.buffers");
        let mut bytes = fs::read(&log_a).unwrap();
        bytes.extend_from_slice(&fs::read(&log_b).unwrap());
        fs::write(&combined, bytes).unwrap();

        let (buffer_count, report) = retrace_processor::process_file(&combined, true).unwrap();
        assert!(buffer_count >= 20, "expected both sides, got {buffer_count} buffers");
        assert_eq!(report.total(), 10);
        assert_eq!(report.count(ALL_SENTINEL, 7, TraceStatus::Valid), 10);
        assert_eq!(
            report.count(ALL_SENTINEL, ALL_SENTINEL, TraceStatus::Valid),
            10
        );
    }
}
