//! mlat-server: CLI wiring around `mlat_core::Coordinator`.
//!
//! The wire protocol a real deployment would use to talk to receivers
//! (JSON-over-TCP, binary-over-UDP, whatever a given fleet standardizes
//! on) is out of scope for this workspace — `mlat-core` exposes the
//! `Connection`/`OutputHandler` traits a transport would implement, and
//! this binary just drives the Coordinator's clock so its periodic
//! housekeeping (sync-point expiry, resolve polling, state snapshots)
//! actually runs.

use std::path::PathBuf;
use std::time::Instant;

use clap::Parser;

use mlat_core::Coordinator;

#[derive(Parser)]
#[command(name = "mlat-server", version, about = "Multilateration coordinator")]
struct Cli {
    /// Directory sync.json/locations.json/aircraft.json are written to.
    #[arg(long, default_value = ".", env = "MLAT_WORK_DIR")]
    work_dir: PathBuf,

    /// This instance's partition spec, `index/count` (1-indexed). A
    /// fleet of N coordinators each take `count = N` with a distinct
    /// `index`, splitting aircraft by ICAO hash so no two instances
    /// resolve the same aircraft.
    #[arg(long, default_value = "1/1", env = "MLAT_PARTITION")]
    partition: String,

    /// Free-form label for this instance's log lines.
    #[arg(long, default_value = "mlat-server", env = "MLAT_TAG")]
    tag: String,

    /// Reloadable blacklist of receiver usernames to exclude from
    /// resolves.
    #[arg(long, env = "MLAT_BLACKLIST")]
    blacklist: Option<PathBuf>,

    /// Append one JSON line per accepted solution's pseudorange set here.
    #[arg(long, env = "MLAT_PSEUDORANGE_LOG")]
    pseudorange_log: Option<PathBuf>,

    /// Undecided wire-protocol surface: accepted so existing deployment
    /// configs parse, but not yet wired to anything (no transport lives
    /// in this workspace).
    #[arg(long, hide = true)]
    basestation_connect: Option<String>,
    #[arg(long, hide = true)]
    basestation_listen: Option<String>,
    #[arg(long, hide = true)]
    write_csv: Option<PathBuf>,
    #[arg(long, hide = true)]
    client_listen: Option<String>,
}

fn parse_partition(spec: &str) -> Option<(u32, u32)> {
    let (index, count) = spec.split_once('/')?;
    let index: u32 = index.parse().ok()?;
    let count: u32 = count.parse().ok()?;
    if index == 0 || index > count {
        return None;
    }
    Some((index, count))
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let (partition_index, partition_count) = match parse_partition(&cli.partition) {
        Some(p) => p,
        None => {
            tracing::error!(partition = %cli.partition, "invalid --partition, expected index/count");
            std::process::exit(2);
        }
    };

    tracing::info!(tag = %cli.tag, work_dir = %cli.work_dir.display(), partition_index, partition_count, "starting");

    let mut coordinator = Coordinator::new(cli.work_dir, partition_index, partition_count);

    if let Some(path) = &cli.blacklist {
        if let Err(e) = coordinator.reload_blacklist(path) {
            tracing::error!(error = %e, path = %path.display(), "failed to load blacklist");
            std::process::exit(2);
        }
    }

    if let Some(path) = &cli.pseudorange_log {
        match mlat_core::pseudorange::PseudorangeLog::open(path) {
            Ok(log) => coordinator.enable_pseudorange_log(log),
            Err(e) => {
                tracing::error!(error = %e, path = %path.display(), "failed to open pseudorange log");
                std::process::exit(2);
            }
        }
    }

    let start = Instant::now();
    let mut interval = tokio::time::interval(std::time::Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let now = start.elapsed().as_secs_f64();
                coordinator.tick(now);
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutting down");
                break;
            }
        }
    }
}
