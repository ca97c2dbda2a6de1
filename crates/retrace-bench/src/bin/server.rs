// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Benchmark RPC server. Runs one service from the topology file,
//! connecting to the other services it fans out to. Addresses and
//! topologies come from config files; see `config/` for examples. To
//! run a standalone server: `retrace-server standalone`.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tracing::info;
use tracing_subscriber::EnvFilter;

use retrace_bench::server::{ServerImpl, ServerOptions};
use retrace_bench::rpc::RpcServer;
use retrace_bench::topology::{self, AddressInfo};
use retrace_bench::{standalone, MATRIX_BENCHMARKS_CSV};
use retrace_tracing::agent::{Agent, AgentConfig};
use retrace_tracing::sink::BufferSink;
use retrace_tracing::strategy::{self, TracerStack};

#[derive(Parser, Debug)]
#[command(
    name = "retrace-server",
    version,
    about = "A benchmark server for building a topology of RPC services that connect to each other",
    disable_help_flag = true
)]
struct Args {
    /// Service name from the topology file, or `standalone`.
    serv: String,

    /// Number of request-processing handler threads.
    #[arg(short = 'c', long, default_value_t = 1)]
    concurrency: usize,

    /// Tracing to use: none, hindsight, ot-hindsight, ot-jaeger,
    /// ot-stdout, ot-noop, ot-local.
    #[arg(short = 'x', long, default_value = "none")]
    tracing: String,

    /// Install a trigger for queue ID with probability P, e.g. 7:0.5.
    #[arg(short = 'f', long = "trigger", value_name = "ID:P")]
    triggers: Vec<String>,

    /// Disable RPC computation, overriding `exec` from the topology.
    #[arg(short = 'n', long)]
    nocompute: bool,

    /// Turn on debug printing.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Maximum concurrently-executing requests per handler.
    #[arg(short = 'm', long = "max-requests", default_value_t = 100)]
    max_requests: usize,

    /// Topology file. Required unless running standalone.
    #[arg(short = 't', long)]
    topology: Option<PathBuf>,

    /// Addresses file. Required unless running standalone.
    #[arg(short = 'a', long)]
    addresses: Option<PathBuf>,

    /// OpenTelemetry collector host; required for ot-jaeger.
    #[arg(short = 'h', long = "otel-host")]
    otel_host: Option<String>,

    /// OpenTelemetry collector port; required for ot-jaeger.
    #[arg(short = 'p', long = "otel-port")]
    otel_port: Option<u16>,

    /// Use the simple span processor instead of the batch processor.
    #[arg(short = 's', long = "otel-simple")]
    otel_simple: bool,

    /// Instance id of the assigned service.
    #[arg(short = 'i', long = "instance-id", default_value_t = 0)]
    instance_id: usize,

    /// Matrix benchmarks CSV; the built-in table is used when unset.
    #[arg(long)]
    benchmarks: Option<PathBuf>,

    /// Write exported buffers to this file. Defaults to
    /// `<serv>_<instance>.buffers`.
    #[arg(long = "buffer-log")]
    buffer_log: Option<PathBuf>,

    /// Ship exported buffers to a collector at HOST:PORT instead of a
    /// local file.
    #[arg(long)]
    collector: Option<String>,

    /// Fire the head-sampling trigger for requests that took longer
    /// than this many microseconds. Disabled when unset.
    #[arg(long = "latency-trigger-us")]
    latency_trigger_us: Option<u64>,

    #[arg(long, action = ArgAction::HelpLong)]
    help: Option<bool>,
}

fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_trigger(spec: &str) -> anyhow::Result<(i64, f64)> {
    let (queue, probability) = spec.split_once(':').with_context(|| {
        format!("invalid trigger {spec} -- expected form is QUEUEID:PROBABILITY e.g. 7:0.5")
    })?;
    Ok((
        queue.parse().with_context(|| format!("invalid trigger queue id {queue}"))?,
        probability
            .parse()
            .with_context(|| format!("invalid trigger probability {probability}"))?,
    ))
}

fn start_agent(args: &Args, serv: &str, info: &AddressInfo, breadcrumb: &str) -> anyhow::Result<Agent> {
    let sink = match (&args.collector, &args.buffer_log) {
        (Some(addr), _) => BufferSink::collector(addr)
            .with_context(|| format!("failed to connect to collector {addr}"))?,
        (None, Some(path)) => BufferSink::file(path)?,
        (None, None) => BufferSink::file(format!("{serv}_{}.buffers", args.instance_id))?,
    };
    let listen = format!("0.0.0.0:{}", info.agent_ports[args.instance_id]);
    let config = AgentConfig {
        listen: Some(listen),
        ..AgentConfig::new(breadcrumb)
    };
    Agent::start(config, sink).context("failed to start agent")
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    let (serv, topology_json, addresses_json) = if args.serv == "standalone" {
        info!("Using the built-in standalone configuration");
        (
            standalone::SERVICE_NAME.to_string(),
            standalone::TOPOLOGY_JSON.to_string(),
            standalone::ADDRESSES_JSON.to_string(),
        )
    } else {
        let topology_path = args
            .topology
            .as_ref()
            .context("expected a topology file to be specified")?;
        let addresses_path = args
            .addresses
            .as_ref()
            .context("expected an addresses file to be specified")?;
        info!("Loading topology from {}", topology_path.display());
        info!("Loading addresses from {}", addresses_path.display());
        (
            args.serv.clone(),
            fs::read_to_string(topology_path)?,
            fs::read_to_string(addresses_path)?,
        )
    };

    let addresses = topology::parse_addresses(&addresses_json)?;
    let mut config = topology::service_config(&topology_json, &serv, &addresses)
        .with_context(|| format!("unable to find service {serv} in topology"))?;

    let benchmarks_csv = match &args.benchmarks {
        Some(path) => fs::read_to_string(path)?,
        None => MATRIX_BENCHMARKS_CSV.to_string(),
    };
    config.generate_matrix_configs(&benchmarks_csv)?;
    config.print_matrix_configs();

    let info = addresses
        .get(&serv)
        .with_context(|| format!("no address entry for service {serv}"))?
        .clone();
    anyhow::ensure!(
        args.instance_id < info.num_instances(),
        "instance id {} out of range for {} instances",
        args.instance_id,
        info.num_instances()
    );
    let server_address = format!("{}:{}", info.deploy_addr, info.ports[args.instance_id]);
    let breadcrumb = info.breadcrumbs[args.instance_id].clone();

    let mut triggers = Vec::new();
    for spec in &args.triggers {
        let (queue, probability) = parse_trigger(spec)?;
        info!("Trigger {queue}={probability}");
        triggers.push((queue, probability));
    }

    let runtime = tokio::runtime::Runtime::new()?;

    let mut agent: Option<Agent> = None;
    let mut provider = None;
    // Exporter construction needs the runtime context; keep the guard
    // scoped so the shutdown block_on below runs outside it.
    let guard = runtime.enter();
    let tracer = match args.tracing.as_str() {
        "none" => {
            info!("No tracing configured.");
            TracerStack::None
        }
        "hindsight" => {
            info!("Using buffer tracing (without OpenTelemetry).");
            let started = start_agent(&args, &serv, &info, &breadcrumb)?;
            let handle = started.handle();
            agent = Some(started);
            TracerStack::Hindsight { agent: handle }
        }
        "ot-hindsight" => {
            info!("Using buffer tracing alongside OpenTelemetry.");
            strategy::init_noop_provider();
            let started = start_agent(&args, &serv, &info, &breadcrumb)?;
            let handle = started.handle();
            agent = Some(started);
            TracerStack::OtelHindsight { agent: handle }
        }
        "ot-stdout" => {
            info!("Using stdout tracing with OpenTelemetry.");
            provider = Some(strategy::init_stdout_provider());
            TracerStack::Otel
        }
        "ot-noop" => {
            info!("Using OpenTelemetry with noop tracing.");
            strategy::init_noop_provider();
            TracerStack::Otel
        }
        "ot-local" => {
            info!("Using OpenTelemetry with local in-memory tracing.");
            provider = Some(strategy::init_in_memory_provider());
            TracerStack::Otel
        }
        "ot-jaeger" => {
            info!("Using collector tracing with OpenTelemetry.");
            let host = args
                .otel_host
                .as_ref()
                .context("expected an address of the OpenTelemetry collector to be specified")?;
            let port = args
                .otel_port
                .context("expected a port of the OpenTelemetry collector to be specified")?;
            provider = Some(strategy::init_otlp_provider(host, port, !args.otel_simple)?);
            TracerStack::Otel
        }
        other => anyhow::bail!("unknown tracing type {other}"),
    };
    drop(guard);

    let rpc = RpcServer::bind(runtime.handle(), &server_address)
        .with_context(|| format!("failed to bind {server_address}"))?;
    info!("Server listening on {server_address}");
    info!("Using {breadcrumb} for local breadcrumb");

    let options = ServerOptions {
        nocompute: args.nocompute,
        triggers,
        instance_id: args.instance_id,
        max_outstanding_requests: args.max_requests,
        latency_trigger_us: args.latency_trigger_us,
        debug: args.debug,
    };
    let server = ServerImpl::new(
        config,
        breadcrumb,
        tracer,
        options,
        runtime.handle().clone(),
    );

    info!("Starting {} handlers", args.concurrency);
    let registrar = rpc.registrar();
    let handlers = server.spawn_handlers(args.concurrency, &registrar)?;
    let printer = args.debug.then(|| server.spawn_debug_printer());

    runtime.block_on(tokio::signal::ctrl_c())?;
    info!("Exiting");

    server.shutdown();
    rpc.shutdown();
    for handler in handlers {
        let _ = handler.join();
    }
    if let Some(printer) = printer {
        let _ = printer.join();
    }
    if let Some(agent) = agent {
        agent.shutdown();
    }
    if let Some(provider) = provider {
        let _ = provider.shutdown();
    }
    Ok(())
}
