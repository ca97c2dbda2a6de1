// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Benchmark load generator. The SERV argument names which service from
//! the topology file to drive; `standalone` uses the built-in
//! single-service configuration.

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;

use anyhow::Context;
use clap::Parser;
use rand::Rng;
use tracing::info;
use tracing_subscriber::EnvFilter;

use retrace_bench::client::{
    spawn_throughput_printer, ClientOptions, ClientStats, LoadClient,
};
use retrace_bench::rpc::Channel;
use retrace_bench::standalone;
use retrace_bench::topology;

#[derive(Parser, Debug)]
#[command(
    name = "retrace-client",
    version,
    about = "An async client driving load at a benchmark server from the topology file"
)]
struct Args {
    /// Service name from the topology file, or `standalone`.
    serv: String,

    /// Number of concurrent client threads, each with its own RPC
    /// client.
    #[arg(short = 'c', long, default_value_t = 1)]
    concurrency: usize,

    /// Closed loop: concurrent outstanding requests per client. Open
    /// loop: request rate per second per client.
    #[arg(short = 'r', long, default_value_t = 1)]
    requests: u64,

    /// Run as an open-loop client instead of closed-loop.
    #[arg(short = 'o', long)]
    openloop: bool,

    /// Total requests to submit before exiting. 0 for no limit; the
    /// default becomes 1 when debug is enabled.
    #[arg(short = 'l', long, default_value_t = -1)]
    limit: i64,

    /// Print debug information on all servers.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Topology file. Required unless running standalone.
    #[arg(short = 't', long)]
    topology: Option<PathBuf>,

    /// Addresses file. Required unless running standalone.
    #[arg(short = 'a', long)]
    addresses: Option<PathBuf>,

    /// Interval size in seconds; each trace logs the interval it was
    /// generated in.
    #[arg(short = 'i', long, default_value_t = 10)]
    interval: u64,

    /// Probability of head-based sampling.
    #[arg(short = 's', long, default_value_t = 1.0)]
    sampling: f64,
}

fn init_logging(debug: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.debug);

    anyhow::ensure!(
        args.requests >= 1,
        "must use a positive value for -r --requests; got {}",
        args.requests
    );

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
    let config = topology::service_config(&topology_json, &serv, &addresses)
        .with_context(|| format!("unable to find service {serv} in topology"))?;
    let apis = config.api_names();
    anyhow::ensure!(!apis.is_empty(), "service {serv} exposes no APIs");

    let connection_addresses = addresses
        .get(&serv)
        .with_context(|| format!("no address entry for service {serv}"))?
        .connection_addresses
        .clone();

    let max_requests = if args.limit >= 0 {
        args.limit as u64
    } else if args.debug {
        1
    } else {
        0
    };

    let options = ClientOptions {
        openloop: args.openloop,
        requests: args.requests,
        max_requests,
        interval_us: args.interval * 1_000_000,
        sampling: args.sampling,
        debug: args.debug,
    };

    let runtime = tokio::runtime::Runtime::new()?;
    let alive = Arc::new(AtomicBool::new(true));
    let global_count = Arc::new(AtomicU64::new(0));
    let error_reported = Arc::new(AtomicBool::new(false));

    {
        let alive = Arc::clone(&alive);
        runtime.spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Exiting");
            alive.store(false, Ordering::SeqCst);
        });
    }

    let start = Instant::now();
    let mut workers = Vec::with_capacity(args.concurrency);
    let mut rng = rand::thread_rng();
    for id in 0..args.concurrency {
        let address = &connection_addresses[rng.gen_range(0..connection_addresses.len())];
        let channel = Channel::connect(runtime.handle(), address);
        let client = LoadClient::new(
            id as u64,
            channel,
            apis.clone(),
            options.clone(),
            Arc::clone(&alive),
            Arc::clone(&global_count),
            Arc::clone(&error_reported),
        );
        workers.push(
            thread::Builder::new()
                .name(format!("client-{id}"))
                .spawn(move || client.run())?,
        );
    }

    let printer_alive = Arc::new(AtomicBool::new(true));
    let printer = spawn_throughput_printer(Arc::clone(&printer_alive), Arc::clone(&global_count));

    if max_requests == 0 {
        info!("Press control-c to quit");
    }

    let mut merged = ClientStats::default();
    for worker in workers {
        match worker.join() {
            Ok(stats) => merged.merge(&stats),
            Err(_) => anyhow::bail!("client thread panicked"),
        }
    }
    alive.store(false, Ordering::SeqCst);
    printer_alive.store(false, Ordering::SeqCst);
    let _ = printer.join();

    let duration = start.elapsed();
    let total = global_count.load(Ordering::Relaxed);
    info!("Duration: {}", duration.as_secs());
    info!("Total requests: {total}");
    info!(
        "overall throughput: {:.0} requests/s",
        total as f64 / duration.as_secs_f64().max(f64::EPSILON)
    );
    info!(
        "Average / Max / Min latency of a request is: {:.3}/{:.3}/{:.3} ms",
        merged.avg_latency_us() / 1000.0,
        merged.max_latency_us as f64 / 1000.0,
        if merged.count == 0 { 0.0 } else { merged.min_latency_us as f64 / 1000.0 }
    );
    Ok(())
}
