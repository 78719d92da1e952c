use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{TimeDelta, Utc};
use clap::{ArgAction, Args, CommandFactory, Parser, Subcommand};
use serde_json::json;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod declared;
mod error;
mod meter;
mod model;
mod reconciler;
mod tc;
mod telemetry;
mod tunnel;

use config::{
    COMMIT_INTERVAL_SECS, DEFAULT_DECLARED_DB, DEFAULT_EBPF_OBJECT, DEFAULT_TELEMETRY_DB,
    DEFAULT_UNKNOWN_RATE, METRICS_INTERVAL_SECS, MeterOptions,
};
use declared::DeclaredStore;
use reconciler::{Reconciler, ReconcilerHandle};
use telemetry::TelemetryStore;
use tunnel::wg::WgCli;

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(about = "WireGuard gateway with per-client pacing and traffic accounting", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Reconcile the tunnel, peers and throttle table with the declared state
    Run(RunCommand),
    /// Print top destinations and totals for a set of clients as JSON
    Report(ReportCommand),
}

#[derive(Args)]
struct RunCommand {
    /// Administrative database holding interfaces, accounts and clients
    #[arg(long, value_name = "PATH", default_value = DEFAULT_DECLARED_DB)]
    db: PathBuf,
    /// Telemetry database (created if missing)
    #[arg(long, value_name = "PATH", default_value = DEFAULT_TELEMETRY_DB)]
    telemetry_db: PathBuf,
    /// Compiled tc classifier object
    #[arg(long, value_name = "PATH", default_value = DEFAULT_EBPF_OBJECT)]
    ebpf_object: PathBuf,
    /// Seconds between metric drains into the usage table
    #[arg(long, default_value_t = METRICS_INTERVAL_SECS)]
    metrics_interval_secs: u64,
    /// Seconds before the telemetry writer commits its batch
    #[arg(long, default_value_t = COMMIT_INTERVAL_SECS)]
    commit_interval_secs: u64,
    /// Pacing rate for traffic that matches no client (bytes/s)
    #[arg(long, value_name = "BYTES", default_value_t = DEFAULT_UNKNOWN_RATE)]
    unknown_rate: u32,
    /// Pace a client's inbound and outbound traffic against one bucket
    #[arg(long, action = ArgAction::SetTrue)]
    shared_bucket: bool,
}

#[derive(Args)]
struct ReportCommand {
    #[arg(long, value_name = "PATH", default_value = DEFAULT_TELEMETRY_DB)]
    telemetry_db: PathBuf,
    /// Client address to include; repeat for several
    #[arg(long = "client", value_name = "IPV4")]
    clients: Vec<Ipv4Addr>,
    /// Look-back window for the top list and usage rows
    #[arg(long, default_value_t = 2)]
    since_hours: i64,
    /// Maximum number of top destinations
    #[arg(long, default_value_t = 10)]
    limit: usize,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("gatekeeper error: {err:?}");
        exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run(cmd)) => {
            init_tracing();
            run_daemon(cmd).await?;
        }
        Some(Commands::Report(cmd)) => report(cmd)?,
        None => {
            Cli::command().print_help().ok();
            println!();
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gatekeeper=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run_daemon(cmd: RunCommand) -> Result<()> {
    let declared = DeclaredStore::open(&cmd.db)
        .with_context(|| format!("failed to open {}", cmd.db.display()))?;
    let telemetry = TelemetryStore::open(
        &cmd.telemetry_db,
        Duration::from_secs(cmd.commit_interval_secs.max(1)),
    )
    .with_context(|| format!("failed to open {}", cmd.telemetry_db.display()))?;
    let telemetry = Arc::new(telemetry);

    let (connection, netlink, _) =
        rtnetlink::new_connection().context("failed to open rtnetlink socket")?;
    tokio::spawn(connection);

    let meter_opts = MeterOptions {
        ebpf_object: cmd.ebpf_object,
        unknown_rate: cmd.unknown_rate,
        shared_bucket: cmd.shared_bucket,
    };
    let reconciler = Reconciler::new(
        netlink,
        WgCli::default(),
        declared,
        telemetry.clone(),
        meter_opts,
        Duration::from_secs(cmd.metrics_interval_secs.max(1)),
    );

    let handle = reconciler.handle();
    let token = CancellationToken::new();
    let signals = tokio::spawn(watch_signals(handle.clone(), token.clone()));

    handle.update_interface();
    let outcome = reconciler.run(token.clone()).await;

    token.cancel();
    signals.abort();
    // Last reference: dropping it commits and joins the writer.
    drop(telemetry);
    outcome
}

/// SIGHUP re-reads the declared interface; SIGINT and SIGTERM stop the loop.
async fn watch_signals(handle: ReconcilerHandle, token: CancellationToken) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("SIGHUP received; reconciling interface");
                handle.update_interface();
            }
            _ = terminate.recv() => break,
            res = tokio::signal::ctrl_c() => {
                res.context("failed to wait for ctrl-c")?;
                break;
            }
        }
    }
    info!("shutdown requested");
    token.cancel();
    Ok(())
}

fn report(cmd: ReportCommand) -> Result<()> {
    let store = TelemetryStore::open(&cmd.telemetry_db, Duration::from_secs(COMMIT_INTERVAL_SECS))
        .with_context(|| format!("failed to open {}", cmd.telemetry_db.display()))?;
    let clients: Vec<IpAddr> = cmd.clients.iter().copied().map(IpAddr::V4).collect();
    let since = Utc::now() - TimeDelta::hours(cmd.since_hours.clamp(0, 24 * 365));

    let top = store.query(&clients, since, cmd.limit)?;
    let (sent, received) = store.total(&clients)?;
    let usage = store.usage(&cmd.clients, since)?;

    let out = json!({
        "top": top,
        "total": { "sent": sent, "received": received },
        "usage": usage,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    Ok(())
}
