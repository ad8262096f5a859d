//! oob-ping - round-trip probe for the OOB transport.
//!
//! # Usage
//!
//! Echo server (terminal 1):
//! ```bash
//! cargo run --bin oob-ping -- serve --name 0.1.0 --listen 127.0.0.1:7000
//! ```
//!
//! Client (terminal 2):
//! ```bash
//! cargo run --bin oob-ping -- ping --name 0.1.1 --peer 0.1.0 --address 127.0.0.1:7000 --count 5
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand};
use oob_transport::{
    Buffers, Bytes, Completion, Oob, OobConfig, OobResult, ProcessName, RecvFlags, SendFlags,
    TokioNetworkProvider,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Tag used for probe frames in both directions.
const ECHO_TAG: u32 = 1;

/// CLI arguments
#[derive(Parser, Debug)]
#[command(name = "oob-ping")]
#[command(about = "Round-trip probe for the OOB transport", long_about = None)]
struct Args {
    /// Optional JSON configuration file; command-line values override it
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Echo every probe frame back to its sender
    Serve {
        /// Name of this process, as cell.job.vpid
        #[arg(long)]
        name: ProcessName,

        /// Address to listen on
        #[arg(long, default_value = "127.0.0.1:7000")]
        listen: String,
    },
    /// Send probe frames to a server and report round-trip times
    Ping {
        /// Name of this process, as cell.job.vpid
        #[arg(long)]
        name: ProcessName,

        /// Name of the server
        #[arg(long)]
        peer: ProcessName,

        /// Address of the server
        #[arg(long)]
        address: String,

        /// Number of probes
        #[arg(short, long, default_value = "10")]
        count: usize,

        /// Payload size in bytes
        #[arg(short, long, default_value = "64")]
        size: usize,

        /// Per-probe timeout in milliseconds
        #[arg(long, default_value = "5000")]
        timeout_ms: u64,
    },
}

fn load_config(path: Option<&std::path::Path>, name: ProcessName) -> OobResult<OobConfig> {
    let mut config = match path {
        Some(path) => {
            let json = std::fs::read_to_string(path)
                .map_err(|e| oob_transport::OobError::Config(format!("{}: {e}", path.display())))?;
            serde_json::from_str::<OobConfig>(&json)?
        }
        None => OobConfig::default(),
    };
    config.local_name = name;
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,oob_transport=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    match args.command {
        Command::Serve { name, listen } => {
            let config = load_config(args.config.as_deref(), name)?.with_listen_address(listen);
            serve(config).await?;
        }
        Command::Ping {
            name,
            peer,
            address,
            count,
            size,
            timeout_ms,
        } => {
            let config = load_config(args.config.as_deref(), name)?;
            let oob = Oob::start(config, Arc::new(TokioNetworkProvider::new())).await?;
            oob.add_contact(peer, address);
            let timeout = Duration::from_millis(timeout_ms);
            let client = oob.clone();
            let result =
                tokio::task::spawn_blocking(move || ping(&client, peer, count, size, timeout))
                    .await?;
            oob.shutdown();
            result?;
        }
    }
    Ok(())
}

async fn serve(config: OobConfig) -> OobResult<()> {
    let oob = Oob::start(config, Arc::new(TokioNetworkProvider::new())).await?;
    oob.on_exception(|peer, kind| {
        tracing::info!(%peer, ?kind, "peer went away");
    });

    let echo = oob.clone();
    oob.recv_async(
        ProcessName::ANY,
        Vec::new(),
        ECHO_TAG,
        RecvFlags::PERSISTENT | RecvFlags::ALLOCATE_BUFFER,
        move |completion: Completion| {
            let size = match completion.status {
                Ok(size) => size,
                Err(e) => {
                    tracing::debug!(error = %e, "echo receive ended");
                    return;
                }
            };
            let payload = match completion.buffers {
                Buffers::None => Vec::new(),
                buffers => vec![Bytes::from(buffers.to_vec())],
            };
            tracing::debug!(peer = %completion.peer, size, "echoing");
            if let Err(e) = echo.send_async(completion.peer, payload, ECHO_TAG, |_| {}) {
                tracing::warn!(peer = %completion.peer, error = %e, "echo failed");
            }
        },
    )?;

    tracing::info!(
        name = %oob.local_name(),
        address = oob.local_addr().unwrap_or("-"),
        "serving, press ctrl-c to stop"
    );
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for ctrl-c");
    }
    oob.shutdown();
    Ok(())
}

fn ping(
    oob: &Oob,
    peer: ProcessName,
    count: usize,
    size: usize,
    timeout: Duration,
) -> OobResult<()> {
    oob.ping(peer, Instant::now() + timeout)?;
    tracing::info!(%peer, "connected");

    let payload = Bytes::from(vec![0xa5u8; size]);
    let mut rtts = Vec::with_capacity(count);
    for seq in 0..count {
        let start = Instant::now();
        let deadline = start + timeout;
        oob.send_until(peer, vec![payload.clone()], ECHO_TAG, SendFlags::NON_BLOCKING, deadline)?;
        let reply = oob.recv_until(peer, vec![vec![0; size]], ECHO_TAG, RecvFlags::empty(), deadline)?;
        let rtt = start.elapsed();
        if reply.size != size {
            tracing::warn!(seq, expected = size, got = reply.size, "short reply");
        }
        tracing::info!(seq, bytes = reply.size, rtt_us = rtt.as_micros() as u64, "reply");
        rtts.push(rtt);
    }

    if let (Some(min), Some(max)) = (rtts.iter().min(), rtts.iter().max()) {
        let avg = rtts.iter().sum::<Duration>() / rtts.len() as u32;
        tracing::info!(
            count = rtts.len(),
            min_us = min.as_micros() as u64,
            avg_us = avg.as_micros() as u64,
            max_us = max.as_micros() as u64,
            "done"
        );
    }
    Ok(())
}
