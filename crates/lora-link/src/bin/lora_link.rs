//! # lora-link
//!
//! Command-line front end for a LoRa modem on a serial port.
//!
//! ## Usage
//!
//! ```bash
//! # Receive: reassemble files into ./received_files, log messages
//! lora-link --port /dev/ttyUSB1 listen
//!
//! # Send a file with the FILECHUNK handshake (image -> JPEG, audio -> MP3)
//! lora-link --port /dev/ttyUSB0 send photo.png --level medium
//!
//! # Send text that the receiver shows as a message
//! lora-link --port /dev/ttyUSB0 send-text "water level 3.2 m"
//!
//! # Mesh command interface
//! lora-link --port COM9 mesh-text --dest Node_2 "Hello Node_2"
//! lora-link --port COM9 mesh-file --dest Node_4 --level critical data.mseed
//! lora-link --port COM9 discover Node_3
//! lora-link --port COM9 routes
//! ```

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use lora_link::media::RawPreparer;
use lora_link::policy::classify_path;
use lora_link::{
    DefaultPreparer, DiscoveryOutcome, LinkConfig, LinkEvent, MediaPreparer, ReliabilityLevel,
    SerialTransport, TransferReport,
};

/// Host-side LoRa serial transport.
#[derive(Parser, Debug)]
#[command(name = "lora-link", version, about = "Host-side LoRa serial transport")]
struct Cli {
    /// TOML config file.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Serial port (e.g. /dev/ttyUSB0 or COM9).
    #[arg(long, short)]
    port: Option<String>,

    /// Baud rate.
    #[arg(long)]
    baud: Option<u32>,

    /// Directory for received files and messages.log.
    #[arg(long)]
    out_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print received messages and files until interrupted.
    Listen {
        /// Seconds between reception stats log lines.
        #[arg(long, default_value_t = 30)]
        stats_interval: u64,
    },
    /// Send a file as FILECHUNK lines.
    Send {
        file: PathBuf,
        /// Reliability tier (0-4 or none/low/medium/high/critical).
        #[arg(long)]
        level: Option<ReliabilityLevel>,
        /// Base64 characters per chunk.
        #[arg(long)]
        chunk_size: Option<usize>,
        /// Seconds to wait for each chunk's completion sentinel.
        #[arg(long)]
        timeout: Option<u64>,
        /// Skip image/audio conversion.
        #[arg(long, default_value_t = false)]
        raw: bool,
    },
    /// Send text as a temporary file the receiver shows as a message.
    SendText { text: String },
    /// Send text through the mesh command interface.
    MeshText {
        #[arg(long)]
        dest: String,
        #[arg(long, default_value = "low")]
        level: ReliabilityLevel,
        text: String,
    },
    /// Send a file through the mesh command interface.
    MeshFile {
        #[arg(long)]
        dest: String,
        #[arg(long)]
        level: Option<ReliabilityLevel>,
        file: PathBuf,
    },
    /// Discover a route to a mesh node.
    Discover {
        dest: String,
        /// Seconds to wait for the route reply.
        #[arg(long)]
        timeout: Option<u64>,
    },
    /// Print the node's routing table.
    Routes,
    /// Print the node's statistics.
    Stats,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    // ── Config ──────────────────────────────────────────────────
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => LinkConfig::from_file(path).map_err(anyhow::Error::msg)?,
        None => LinkConfig::default(),
    };
    if let Some(port) = &cli.port {
        config.serial.port = port.clone();
    }
    if let Some(baud) = cli.baud {
        config.serial.baud = baud;
    }
    if let Some(dir) = &cli.out_dir {
        config.receiver.out_dir = dir.clone();
    }

    tracing::info!(
        port = %config.serial.port,
        baud = config.serial.baud,
        command = ?cli.command,
        "lora-link starting"
    );

    // ── Transport ───────────────────────────────────────────────
    let transport = SerialTransport::open(config.clone())
        .with_context(|| format!("opening {}", config.serial.port))?;

    let result = run(&transport, &config, cli.command);
    transport.close();
    result
}

fn run(transport: &SerialTransport, config: &LinkConfig, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Listen { stats_interval } => listen(transport, Duration::from_secs(stats_interval)),
        Command::Send {
            file,
            level,
            chunk_size,
            timeout,
            raw,
        } => {
            let prepared = if raw {
                RawPreparer.prepare(&file)?
            } else {
                DefaultPreparer::new(&config.media).prepare(&file)?
            };
            tracing::info!(
                file = %file.display(),
                name = %prepared.transmit_name,
                description = %prepared.description,
                "prepared for transmission"
            );
            let profile = classify_path(Path::new(&prepared.transmit_name), level);
            let chunk_size = chunk_size
                .or(config.transfer.chunk_size)
                .unwrap_or(profile.chunk_size_chars);
            let timeout = timeout
                .map(Duration::from_secs)
                .or(config.transfer.chunk_timeout)
                .unwrap_or(profile.chunk_timeout);
            tracing::info!(level = %profile.level, chunk_size, timeout_s = timeout.as_secs(), "transfer profile");
            let report = transport.session()?.send(
                &prepared.bytes,
                &prepared.transmit_name,
                chunk_size,
                timeout,
            )?;
            conclude(report)
        }
        Command::SendText { text } => conclude(transport.session()?.send_text_as_file(&text)?),
        Command::MeshText { dest, level, text } => {
            conclude(transport.session()?.send_text(&dest, &text, level)?)
        }
        Command::MeshFile { dest, level, file } => {
            let bytes = std::fs::read(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .context("file has no name")?;
            conclude(transport.session()?.send_mesh_file(&dest, &bytes, &name, level)?)
        }
        Command::Discover { dest, timeout } => {
            let outcome = transport
                .session()?
                .discover_route(&dest, timeout.map(Duration::from_secs))?;
            match outcome {
                DiscoveryOutcome::Established(line) => {
                    println!("{line}");
                    Ok(())
                }
                DiscoveryOutcome::Failed(line) => bail!("route discovery failed: {line}"),
                DiscoveryOutcome::TimedOut => bail!("route discovery timeout"),
            }
        }
        Command::Routes => print_lines(transport.session()?.query_routes()?),
        Command::Stats => print_lines(transport.session()?.query_stats()?),
    }
}

fn listen(transport: &SerialTransport, stats_interval: Duration) -> anyhow::Result<()> {
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    let events = transport.events();
    let mut last_stats_log = std::time::Instant::now();

    while running.load(Ordering::Relaxed) && transport.is_running() {
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(LinkEvent::Message { source, text }) => println!("[MSG] {source}: {text}"),
            Ok(LinkEvent::FileSaved {
                source,
                filename,
                path,
                bytes,
            }) => println!("[FILE] {source}: {filename} -> {} ({bytes} bytes)", path.display()),
            Ok(LinkEvent::Peer(line)) => println!("[NODE] {line}"),
            Ok(LinkEvent::Warning(_)) | Ok(LinkEvent::Signal(_)) => {}
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }

        if last_stats_log.elapsed() >= stats_interval {
            let stats = transport.stats();
            tracing::info!(
                messages = stats.messages,
                fragments = stats.fragments,
                files = stats.files_saved,
                bytes = stats.bytes_saved,
                incomplete = stats.incomplete,
                parse_errors = stats.parse_errors,
                "reception stats"
            );
            last_stats_log = std::time::Instant::now();
        }
    }

    let stats = transport.stats();
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

fn print_lines(lines: Vec<String>) -> anyhow::Result<()> {
    for line in lines {
        println!("{line}");
    }
    Ok(())
}

fn conclude(report: TransferReport) -> anyhow::Result<()> {
    let summary = report.summary();
    println!("==================================================");
    println!("TRANSMISSION SUMMARY");
    println!("==================================================");
    println!("Total chunks:    {}", summary.total_chunks);
    println!("Sent:            {}", summary.sent_chunks);
    println!("Failed:          {}", summary.failed_chunks);
    println!("Success rate:    {:.1}%", summary.success_rate * 100.0);
    println!("Duration:        {:.1}s", summary.duration_s);
    println!("Data size:       {} bytes", summary.total_bytes);
    println!("Throughput:      {:.0} bps", summary.throughput_bps);
    println!("==================================================");
    match report.failure {
        None => Ok(()),
        Some(failure) => bail!("transfer failed: {failure}"),
    }
}
