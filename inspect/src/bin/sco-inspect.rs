//! SCO capture inspector - CLI binary.
//!
//! Replays a capture of received SCO packets through the HFP session and
//! prints loss statistics and the packet-status history.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use tracing::info;

use hfp_sco_common::{init_tracing, ColorWhen, MetricsContext, MetricsServerConfig};
use sco::HfpCodec;
use sco_inspect::{read_capture, replay, write_wav, ReplayOptions};

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum ColorArg {
    Auto,
    Always,
    Never,
}

impl From<ColorArg> for ColorWhen {
    fn from(v: ColorArg) -> Self {
        match v {
            ColorArg::Auto => ColorWhen::Auto,
            ColorArg::Always => ColorWhen::Always,
            ColorArg::Never => ColorWhen::Never,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum CodecArg {
    Cvsd,
    Msbc,
}

impl From<CodecArg> for HfpCodec {
    fn from(v: CodecArg) -> Self {
        match v {
            CodecArg::Cvsd => HfpCodec::Cvsd,
            CodecArg::Msbc => HfpCodec::Msbc,
        }
    }
}

#[derive(clap::ValueEnum, Debug, Clone, Copy)]
enum DumpArg {
    Hex,
    Binary,
}

/// SCO capture inspector - Replay received SCO packets through the HFP session
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    // ---
    /// Capture file of received SCO packets
    capture: String,

    /// Codec negotiated for the call
    #[arg(long, value_enum, default_value = "msbc")]
    codec: CodecArg,

    /// MTU reported by the adapter (defaults to the packet size)
    #[arg(long)]
    mtu: Option<usize>,

    /// Re-cut the captured stream into packets of this many bytes
    #[arg(long)]
    packet_size: Option<usize>,

    /// Write the capture audio to this WAV file
    #[arg(long)]
    wav_out: Option<String>,

    /// Print the packet-status history (wideband only)
    #[arg(long, value_enum)]
    dump: Option<DumpArg>,

    /// Prometheus metrics bind address; serves `GET /metrics` until Ctrl-C
    #[arg(long)]
    metrics_bind: Option<String>,

    /// Coloring
    #[arg(long, value_enum, default_value = "auto")]
    color: ColorArg,
}

/// Capture version number from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // ---
    let args = Args::parse();
    init_tracing(args.color.into())?;
    info!("Starting SCO capture inspector v{VERSION}");

    let metrics = MetricsContext::new("sco-inspect")?;
    let _metrics_task = match &args.metrics_bind {
        Some(bind) => {
            let bind: SocketAddr = bind.parse().context("invalid metrics bind")?;
            info!("Metrics bind: {bind}");
            Some(metrics.spawn_metrics_server(MetricsServerConfig::new(bind)))
        }
        None => None,
    };

    let options = ReplayOptions {
        codec: args.codec.into(),
        mtu: args.mtu,
        packet_size: args.packet_size,
    };

    // Replay is synchronous; keep it off the runtime threads.
    let capture_path = args.capture.clone();
    let replay_metrics = metrics.clone();
    let report = tokio::task::spawn_blocking(move || {
        let packets = read_capture(&capture_path)?;
        replay(&packets, &options, Some(replay_metrics))
    })
    .await
    .context("replay task failed")??;

    println!("{report}");
    match args.dump {
        Some(DumpArg::Hex) => print!("{}", report.status_hex.as_deref().unwrap_or("")),
        Some(DumpArg::Binary) => print!("{}", report.status_binary.as_deref().unwrap_or("")),
        None => {}
    }

    if let Some(path) = &args.wav_out {
        write_wav(path, &report.pcm, report.sample_rate())?;
    }

    if args.metrics_bind.is_some() {
        info!("Serving metrics, press Ctrl-C to exit");
        tokio::signal::ctrl_c()
            .await
            .context("failed to wait for Ctrl-C")?;
    }

    Ok(())
}
