use std::fs::File;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use ioc_scan_rs::config::{ScanConfig, StrategyKind};
use ioc_scan_rs::scanner::{self, ScanOrchestrator, SharedProgress};
use ioc_scan_rs::targets::TargetSet;
use ioc_scan_rs::types::{ScanOutcome, ScanStatus};
use ioc_scan_rs::{logging, ports, server, sink};

/// ioc-scan-rs: port-major TCP reachability scanner for IOC high-risk IP sets.
#[derive(Debug, Parser)]
#[command(name = "ioc-scan-rs", version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace). RUST_LOG overrides.
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also append log lines to this file.
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Scan every target on every port and write the merged result table.
    Scan(ScanArgs),
    /// Merge an intermediate `ip,port` store into the `ip,ports_set` table.
    Merge(MergeArgs),
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Tab-separated target list with an `ip` column.
    #[arg(long)]
    input: PathBuf,

    /// Canonical result table (`ip,ports_set`).
    #[arg(long)]
    output: PathBuf,

    /// Intermediate store. Defaults to temp_scan_results.csv next to the output.
    #[arg(long)]
    intermediate: Option<PathBuf>,

    /// Ports as a list/range spec, e.g. "22,80,8000-8100". Default: 1-65535.
    #[arg(long, conflicts_with = "ports_file")]
    ports: Option<String>,

    /// File with one port or range per line (# comments allowed).
    #[arg(long)]
    ports_file: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = StrategyKind::Syn)]
    strategy: StrategyKind,

    /// Max probes in flight at once.
    #[arg(long, default_value_t = 1000)]
    concurrency: usize,

    /// Packets per second; 0 disables pacing.
    #[arg(long, default_value_t = 1000)]
    rate: u64,

    /// Token bucket burst size.
    #[arg(long, default_value_t = 100)]
    burst: u64,

    /// Response window after each port batch. Default: 2000 (syn), 100 (connect).
    #[arg(long = "window-ms")]
    window_ms: Option<u64>,

    /// Connect timeout for the connect strategy.
    #[arg(long = "connect-timeout-ms", default_value_t = 1000)]
    connect_timeout_ms: u64,

    /// Findings buffered per append to the intermediate store.
    #[arg(long, default_value_t = 1000)]
    batch_size: usize,

    /// Source address for crafted SYN packets. Auto-detected when omitted.
    #[arg(long)]
    source_ip: Option<Ipv4Addr>,

    /// Serve the status API on this address, e.g. 127.0.0.1:8080.
    #[arg(long)]
    status_bind: Option<String>,

    /// Write the run summary as pretty JSON to this path.
    #[arg(long)]
    summary_json: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct MergeArgs {
    #[arg(long)]
    intermediate: PathBuf,

    #[arg(long)]
    output: PathBuf,

    /// Leave the intermediate store in place after merging.
    #[arg(long, default_value_t = false)]
    keep_intermediate: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(e) = logging::init_tracing(cli.verbose, cli.log_file.as_deref()) {
        eprintln!("Error: {e:#}");
        return ExitCode::FAILURE;
    }

    let res = match cli.command {
        Command::Scan(args) => run_scan(args).await,
        Command::Merge(args) => run_merge(args),
    };
    // reported once, through the log stream
    match res {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run_scan(args: ScanArgs) -> Result<()> {
    let cfg = scan_config(&args)?;
    let targets = TargetSet::load(&cfg.input)
        .with_context(|| format!("loading targets from {}", cfg.input.display()))?;
    let strategy = scanner::build_strategy(&cfg, &targets).context("preparing probe strategy")?;

    let progress = SharedProgress::new();
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing current port and stopping");
            ctrl_c.cancel();
        }
    });

    if let Some(bind) = args.status_bind.clone() {
        let state = server::AppState::new(progress.clone(), cancel.clone(), cfg.output.clone());
        tokio::spawn(async move {
            if let Err(e) = server::spawn_server(&bind, state).await {
                error!(error = %e, "status API server stopped");
            }
        });
    }

    let orchestrator = ScanOrchestrator::new(cfg, strategy, targets)
        .context("invalid scan configuration")?
        .with_progress(progress);
    let outcome = orchestrator.run(cancel).await.context("scan failed")?;

    if let Some(path) = args.summary_json.as_deref() {
        match write_summary_json(path, &outcome) {
            Ok(()) => info!(path = %path.display(), "wrote run summary"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to write run summary"),
        }
    }
    if outcome.status == ScanStatus::Cancelled {
        info!("partial findings kept in the intermediate store");
    }
    Ok(())
}

fn run_merge(args: MergeArgs) -> Result<()> {
    if args.intermediate == args.output {
        bail!("intermediate store and output must be different files");
    }
    let summary = sink::merge_store(&args.intermediate, &args.output, !args.keep_intermediate)
        .with_context(|| format!("merging {} into {}", args.intermediate.display(), args.output.display()))?;
    info!(
        records = summary.records_read,
        skipped = summary.rows_skipped,
        hosts = summary.hosts,
        output = %args.output.display(),
        "merge complete"
    );
    Ok(())
}

fn scan_config(args: &ScanArgs) -> Result<ScanConfig> {
    let ports = match (&args.ports, &args.ports_file) {
        (Some(spec), _) => ports::parse_ports_str(spec).context("parsing --ports")?,
        (None, Some(path)) => ports::load_ports_from_path(path)
            .with_context(|| format!("reading ports from {}", path.display()))?,
        (None, None) => ports::all_ports(),
    };
    let cfg = ScanConfig {
        input: args.input.clone(),
        output: args.output.clone(),
        intermediate: args
            .intermediate
            .clone()
            .unwrap_or_else(|| ScanConfig::intermediate_for(&args.output)),
        ports,
        strategy: args.strategy,
        max_in_flight: args.concurrency,
        rate_pps: args.rate,
        rate_burst: args.burst,
        window: args.window_ms.map(Duration::from_millis),
        connect_timeout: Duration::from_millis(args.connect_timeout_ms),
        batch_size: args.batch_size,
        source_ip: args.source_ip,
        ..ScanConfig::default()
    };
    cfg.validate()?;
    Ok(cfg)
}

fn write_summary_json(path: &Path, outcome: &ScanOutcome) -> Result<()> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(file, outcome)?;
    Ok(())
}
