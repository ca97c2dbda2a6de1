// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Processes data received by the collector into traces and reports
//! trace completion. Takes the collector data file as its argument.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "retrace-process",
    version,
    about = "Process collected buffer data into traces and calculate trace completion"
)]
struct Args {
    /// The collector data file.
    input: PathBuf,

    /// Print debug information. Spammy.
    #[arg(short = 'd', long)]
    debug: bool,

    /// Print information about malformed traces.
    #[arg(short = 'w', long)]
    warn: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Processing {}", args.input.display());
    let warn_on_malformed = args.warn || args.debug;
    let (buffer_count, report) = retrace_processor::process_file(&args.input, warn_on_malformed)?;
    info!("Read {buffer_count} buffers from {}", args.input.display());
    info!("{} traces total", report.total());
    report.print();
    Ok(())
}
