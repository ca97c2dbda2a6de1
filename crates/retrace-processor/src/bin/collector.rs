// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The collector sink: accepts agent connections and appends their
//! `(agent, buffer)` records verbatim to a single buffer log file.
//! Records from concurrent agents are interleaved whole, never split.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

use retrace_tracing::record::MAX_RECORD_LEN;

#[derive(Parser, Debug)]
#[command(
    name = "retrace-collector",
    version,
    about = "Collects exported trace buffers from agents into a buffer log file"
)]
struct Args {
    /// Output buffer log file.
    output: PathBuf,

    /// Listen address.
    #[arg(short = 'l', long, default_value = "0.0.0.0:7800")]
    listen: String,

    /// Print debug information.
    #[arg(short = 'd', long)]
    debug: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(if args.debug { "debug" } else { "info" }));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("failed to bind {}", args.listen))?;
    let output = Arc::new(Mutex::new(
        File::create(&args.output)
            .await
            .with_context(|| format!("failed to create {}", args.output.display()))?,
    ));
    info!(
        "Collector listening on {}, writing {}",
        args.listen,
        args.output.display()
    );

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                debug!(%peer, "agent connected");
                tokio::spawn(serve_agent(stream, Arc::clone(&output)));
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    info!("Exiting");
    output.lock().await.flush().await?;
    Ok(())
}

async fn serve_agent(mut stream: TcpStream, output: Arc<Mutex<File>>) {
    loop {
        let agent = match read_blob(&mut stream).await {
            Ok(Some(blob)) => blob,
            Ok(None) => break,
            Err(e) => {
                warn!("agent read error: {e}");
                break;
            }
        };
        let data = match read_blob(&mut stream).await {
            Ok(Some(blob)) => blob,
            Ok(None) => break,
            Err(e) => {
                warn!("agent read error: {e}");
                break;
            }
        };

        let mut record = Vec::with_capacity(8 + agent.len() + data.len());
        record.extend_from_slice(&(agent.len() as u32).to_le_bytes());
        record.extend_from_slice(&agent);
        record.extend_from_slice(&(data.len() as u32).to_le_bytes());
        record.extend_from_slice(&data);

        let mut file = output.lock().await;
        if let Err(e) = file.write_all(&record).await {
            warn!("failed to append record: {e}");
            break;
        }
        if let Err(e) = file.flush().await {
            warn!("failed to flush record: {e}");
            break;
        }
    }
}

async fn read_blob(stream: &mut TcpStream) -> std::io::Result<Option<Vec<u8>>> {
    let mut prefix = [0u8; 4];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(prefix);
    if len == 0 || len > MAX_RECORD_LEN {
        return Ok(None);
    }
    let mut blob = vec![0u8; len as usize];
    stream.read_exact(&mut blob).await?;
    Ok(Some(blob))
}
