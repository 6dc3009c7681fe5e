use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use filebus::store_lock::read_lock_owner;
use filebus::{BusConfig, BusRuntime, Delivery, Notification, ProcessRole, SharedStore};
use log::info;

#[derive(Parser)]
#[command(name = "filebus-cli", version, about = "Shared notification store tooling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Decode and print a store file.
    Inspect { store_path: PathBuf },
    /// Join a bus, send periodic events and print everything received.
    Worker {
        #[arg(long = "path")]
        path: PathBuf,
        #[arg(long = "event", default_value = "heartbeat")]
        event: String,
        /// Number of events to send; 0 sends none and only listens.
        #[arg(long = "count", default_value_t = 10)]
        count: u64,
        #[arg(long = "interval-ms", default_value_t = 1_000)]
        interval_ms: u64,
        #[arg(long = "coordinator")]
        coordinator: bool,
        /// Keep listening this long after the last send.
        #[arg(long = "linger-ms", default_value_t = 3_000)]
        linger_ms: u64,
    },
}

fn main() {
    env_logger::init();
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let mut out = io::BufWriter::new(io::stdout());
    match cli.command {
        Commands::Inspect { store_path } => cmd_inspect(&store_path, &mut out)?,
        Commands::Worker {
            path,
            event,
            count,
            interval_ms,
            coordinator,
            linger_ms,
        } => cmd_worker(
            path,
            &event,
            count,
            Duration::from_millis(interval_ms),
            coordinator,
            Duration::from_millis(linger_ms),
        )?,
    }
    out.flush()?;
    Ok(())
}

fn cmd_inspect(store_path: &Path, out: &mut dyn Write) -> Result<()> {
    let store = SharedStore::new(store_path, None);
    let (raw, snapshot) = store
        .read()
        .with_context(|| format!("reading {}", store_path.display()))?;

    writeln!(out, "store: {}", store_path.display())?;
    writeln!(out, "bytes: {}", raw.len())?;
    match &snapshot.header {
        Some(header) => {
            writeln!(out, "epoch: {}", header.epoch)?;
            let ids: Vec<&str> = header.known_ids.iter().map(|id| id.as_str()).collect();
            writeln!(out, "known: {}", ids.join(" "))?;
        }
        None => writeln!(out, "epoch: (empty store)")?,
    }

    writeln!(out, "stability windows: {}", snapshot.windows.len())?;
    for window in &snapshot.windows {
        let ids: Vec<&str> = window.members.iter().map(|id| id.as_str()).collect();
        writeln!(out, "  {} {}", window.start_ms, ids.join(" "))?;
    }

    writeln!(out, "records: {}", snapshot.records.len())?;
    for record in &snapshot.records {
        let acked: Vec<&str> = record.acked_by.iter().map(|id| id.as_str()).collect();
        match serde_json::from_str::<Notification>(&record.payload) {
            Ok(notification) => writeln!(
                out,
                "  #{} {} {} acked=[{}]",
                record.sequence,
                notification.event,
                notification.message,
                acked.join(" ")
            )?,
            Err(_) => writeln!(
                out,
                "  #{} <undecodable payload {} bytes> acked=[{}]",
                record.sequence,
                record.payload.len(),
                acked.join(" ")
            )?,
        }
    }

    match read_lock_owner(store_path)? {
        Some(owner) => writeln!(
            out,
            "lock owner: pid={} start={} alive={}",
            owner.pid,
            owner.start_time,
            owner.is_alive()
        )?,
        None => writeln!(out, "lock owner: none")?,
    }
    Ok(())
}

fn cmd_worker(
    path: PathBuf,
    event: &str,
    count: u64,
    interval: Duration,
    coordinator: bool,
    linger: Duration,
) -> Result<()> {
    let mut config = BusConfig::new(path);
    if coordinator {
        config.role = ProcessRole::Coordinator;
    }
    let runtime = BusRuntime::open(config).context("opening bus")?;
    let identity = runtime.identity().clone();
    info!("joined {} as {}", runtime.store_path().display(), identity);

    let bus = runtime.bus();
    let running = Arc::new(AtomicBool::new(true));
    let printing = Arc::clone(&running);
    bus.on(event, move |message| {
        if printing.load(Ordering::Relaxed) {
            println!("received {message}");
        }
    })?;

    for seq in 0..count {
        let message = serde_json::json!({ "from": identity.as_str(), "seq": seq });
        bus.notify(event, &message, Delivery::PeersOnly)?;
        println!("sent {message}");
        thread::sleep(interval);
    }
    thread::sleep(linger);
    running.store(false, Ordering::Relaxed);

    let outcome = runtime.flush()?;
    info!("final flush: {outcome:?}, {} unsent", runtime.pending_len());
    Ok(())
}
