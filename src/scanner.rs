use crate::collector::ResponseCollector;
use crate::config::{ScanConfig, StrategyKind};
use crate::error::{Result, ScanError};
use crate::netdetect;
use crate::ratelimit::RateLimiter;
use crate::sender::ProbeSender;
use crate::sink::{self, spawn_sink, ResultSink};
use crate::strategy::{ConnectStrategy, ScanStrategy, SynStrategy};
use crate::targets::TargetSet;
use crate::types::{PortReport, ScanOutcome, ScanStatus};
use serde::Serialize;
use std::fs;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use time::{format_description::well_known, OffsetDateTime};

/// Lifecycle of a run as seen by the status API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Idle,
    Running,
    Merging,
    Done,
    Cancelled,
    Failed,
}

impl RunState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => RunState::Running,
            2 => RunState::Merging,
            3 => RunState::Done,
            4 => RunState::Cancelled,
            5 => RunState::Failed,
            _ => RunState::Idle,
        }
    }
}

/// Live counters shared between the orchestrator, the log stream and the
/// status API.
#[derive(Clone, Debug)]
pub struct SharedProgress {
    pub scanned_total: Arc<AtomicU64>,
    pub scanned_done: Arc<AtomicU64>,
    pub ports_total: Arc<AtomicU64>,
    pub ports_done: Arc<AtomicU64>,
    pub current_port: Arc<AtomicU32>,
    pub open_count: Arc<AtomicU64>,
    pub send_failures: Arc<AtomicU64>,
    pub late_responses: Arc<AtomicU64>,
    state: Arc<AtomicU8>,
    started_at: Arc<std::sync::OnceLock<String>>,
}

impl SharedProgress {
    pub fn new() -> Self {
        Self {
            scanned_total: Arc::new(AtomicU64::new(0)),
            scanned_done: Arc::new(AtomicU64::new(0)),
            ports_total: Arc::new(AtomicU64::new(0)),
            ports_done: Arc::new(AtomicU64::new(0)),
            current_port: Arc::new(AtomicU32::new(0)),
            open_count: Arc::new(AtomicU64::new(0)),
            send_failures: Arc::new(AtomicU64::new(0)),
            late_responses: Arc::new(AtomicU64::new(0)),
            state: Arc::new(AtomicU8::new(0)),
            started_at: Arc::new(std::sync::OnceLock::new()),
        }
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.state.load(Ordering::Relaxed))
    }

    pub fn set_state(&self, state: RunState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ProgressSnapshot {
        let total = self.scanned_total.load(Ordering::Relaxed);
        let done = self.scanned_done.load(Ordering::Relaxed);
        ProgressSnapshot {
            state: self.state(),
            started_at: self.started_at.get().cloned(),
            current_port: match self.current_port.load(Ordering::Relaxed) {
                0 => None,
                p => Some(p as u16),
            },
            ports_done: self.ports_done.load(Ordering::Relaxed),
            ports_total: self.ports_total.load(Ordering::Relaxed),
            scanned: done,
            total,
            percent: percent(done, total),
            open: self.open_count.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
        }
    }
}

impl Default for SharedProgress {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSnapshot {
    pub state: RunState,
    pub started_at: Option<String>,
    pub current_port: Option<u16>,
    pub ports_done: u64,
    pub ports_total: u64,
    pub scanned: u64,
    pub total: u64,
    pub percent: f64,
    pub open: u64,
    pub send_failures: u64,
    pub late_responses: u64,
}

fn percent(done: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        done as f64 * 100.0 / total as f64
    }
}

/// Drives a port-major scan: every target at one port, then the next port.
///
/// For each port the collector is switched to that port, the whole target
/// set is probed, the response window elapses, and the collector is drained
/// into the sink before the next port opens.
pub struct ScanOrchestrator {
    config: ScanConfig,
    strategy: Arc<dyn ScanStrategy>,
    targets: Arc<TargetSet>,
    progress: SharedProgress,
}

impl ScanOrchestrator {
    pub fn new(config: ScanConfig, strategy: Arc<dyn ScanStrategy>, targets: TargetSet) -> Result<Self> {
        config.validate()?;
        if targets.is_empty() {
            return Err(ScanError::NoTargets(config.input.clone()));
        }
        Ok(Self {
            config,
            strategy,
            targets: Arc::new(targets),
            progress: SharedProgress::new(),
        })
    }

    /// Share progress counters with an outside observer (status API).
    pub fn with_progress(mut self, progress: SharedProgress) -> Self {
        self.progress = progress;
        self
    }

    /// Run the scan to completion or until `cancel` fires.
    ///
    /// A completed run merges the intermediate store into the canonical
    /// output. A cancelled run flushes its findings and keeps the store.
    pub async fn run(&self, cancel: CancellationToken) -> Result<ScanOutcome> {
        let res = self.run_inner(cancel).await;
        if res.is_err() {
            self.progress.set_state(RunState::Failed);
        }
        res
    }

    async fn run_inner(&self, cancel: CancellationToken) -> Result<ScanOutcome> {
        let cfg = &self.config;
        let started = Instant::now();
        let started_at = now_iso_like();
        let _ = self.progress.started_at.set(started_at.clone());
        let ports = &cfg.ports;
        let total = self.targets.len() as u64 * ports.len() as u64;
        self.progress.scanned_total.store(total, Ordering::Relaxed);
        self.progress.ports_total.store(ports.len() as u64, Ordering::Relaxed);
        self.progress.set_state(RunState::Running);

        info!(
            strategy = ?self.strategy.kind(),
            targets = self.targets.len(),
            ports = ports.len(),
            total,
            window_ms = cfg.response_window().as_millis() as u64,
            "starting port-major scan"
        );

        remove_stale_store(&cfg.intermediate)?;

        let (sink, sink_task) = spawn_sink(
            ResultSink::open(&cfg.intermediate, cfg.batch_size)?,
            cfg.channel_capacity,
        );
        let (tap, responses) = mpsc::channel(cfg.channel_capacity);
        let stop_listener = CancellationToken::new();
        let listener = self.strategy.start_listener(tap.clone(), stop_listener.clone())?;
        let collector = ResponseCollector::spawn(responses, sink.clone(), self.targets.clone());

        let rate = (cfg.rate_pps > 0).then(|| RateLimiter::new(cfg.rate_pps, cfg.rate_burst));
        if let Some(rl) = &rate {
            debug!(pps = rl.pps(), burst = rl.burst(), "packet pacing enabled");
        }
        let sender = ProbeSender::new(self.strategy.clone(), cfg.max_in_flight, rate, tap);

        if listener.is_some() && !cfg.settle.is_zero() {
            sleep(cfg.settle).await;
        }

        let loop_result = self.port_loop(&sender, &collector, &sink, &cancel, started).await;

        // Teardown in dependency order: listener, then producers, then sink.
        if let Some(listener) = listener {
            listener.stop(cfg.stop_grace).await;
        }
        drop(sender);
        let collector_stats = collector.shutdown().await;
        let close_result = sink.close().await;
        drop(sink);
        let sink_stats = sink_task.await.unwrap_or_default();
        self.progress.current_port.store(0, Ordering::Relaxed);

        let port_reports = loop_result?;
        let ports_done = port_reports.len() as u64;
        if let Err(e) = close_result {
            error!(error = %e, path = %cfg.intermediate.display(), "could not flush intermediate store");
            return Err(e);
        }
        info!(
            persisted = sink_stats.persisted,
            late = collector_stats.late,
            duplicates = collector_stats.duplicates,
            "scan loop finished"
        );

        let cancelled = ports_done < ports.len() as u64;
        let merge = if cancelled {
            warn!(
                ports_done,
                ports_total = ports.len(),
                store = %cfg.intermediate.display(),
                "scan cancelled; intermediate store kept, run `merge` to build the result table"
            );
            self.progress.set_state(RunState::Cancelled);
            None
        } else {
            self.progress.set_state(RunState::Merging);
            let summary = sink::merge_store(&cfg.intermediate, &cfg.output, true)?;
            self.progress.set_state(RunState::Done);
            Some(summary)
        };

        let outcome = ScanOutcome {
            status: if cancelled {
                ScanStatus::Cancelled
            } else {
                ScanStatus::Completed
            },
            strategy: format!("{:?}", self.strategy.kind()).to_lowercase(),
            targets: self.targets.len() as u64,
            ports_total: ports.len() as u64,
            ports_done,
            probes_sent: self.progress.scanned_done.load(Ordering::Relaxed),
            send_failures: self.progress.send_failures.load(Ordering::Relaxed),
            open_findings: self.progress.open_count.load(Ordering::Relaxed),
            late_responses: collector_stats.late,
            elapsed_ms: started.elapsed().as_millis() as u64,
            started_at,
            merge,
            port_reports,
        };
        log_summary(&outcome, cfg);
        Ok(outcome)
    }

    /// Returns the reports of the ports fully scanned.
    async fn port_loop(
        &self,
        sender: &ProbeSender,
        collector: &ResponseCollector,
        sink: &sink::SinkHandle,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<Vec<PortReport>> {
        let window = self.config.response_window();
        let mut reports = Vec::with_capacity(self.config.ports.len());

        for &port in &self.config.ports {
            if cancel.is_cancelled() {
                break;
            }
            let port_started = Instant::now();
            self.progress.current_port.store(port as u32, Ordering::Relaxed);
            collector.listen(port).await?;

            let sent = sender.send_batch(&self.targets, port, cancel).await;

            tokio::select! {
                _ = sleep(window) => {}
                _ = cancel.cancelled() => {}
            }

            let mut report = collector.drain().await?;
            if let Err(e) = sink.sync().await {
                error!(port, error = %e, "persisting findings failed; stopping scan");
                return Err(e);
            }

            if sent.skipped > 0 {
                // partially probed port: its findings are kept but it does not count as scanned
                break;
            }

            report.probed = sent.sent + sent.failed;
            report.send_failures = sent.failed;
            report.elapsed_ms = port_started.elapsed().as_millis() as u64;
            self.record_port(&report, started);
            reports.push(report);
        }
        Ok(reports)
    }

    fn record_port(&self, report: &PortReport, started: Instant) {
        let p = &self.progress;
        p.ports_done.fetch_add(1, Ordering::Relaxed);
        let done = p.scanned_done.fetch_add(self.targets.len() as u64, Ordering::Relaxed)
            + self.targets.len() as u64;
        p.open_count.fetch_add(report.open, Ordering::Relaxed);
        p.send_failures.fetch_add(report.send_failures, Ordering::Relaxed);
        p.late_responses.fetch_add(report.late, Ordering::Relaxed);
        let total = p.scanned_total.load(Ordering::Relaxed);

        info!(
            port = report.port,
            open = report.open,
            failed = report.send_failures,
            late = report.late,
            elapsed = format!("{:.1}s", report.elapsed_ms as f64 / 1000.0),
            progress = format!("{done}/{total} ({:.1}%)", percent(done, total)),
            running = %format_duration(started.elapsed()),
            "port scanned"
        );
    }
}

/// Build the probe strategy a config asks for.
///
/// SYN scanning needs a source address for the packets it crafts; without an
/// explicit one it is the local address that routes toward the first target.
pub fn build_strategy(cfg: &ScanConfig, targets: &TargetSet) -> Result<Arc<dyn ScanStrategy>> {
    match cfg.strategy {
        StrategyKind::Syn => {
            let source = match cfg.source_ip {
                Some(ip) => ip,
                None => {
                    let probe = targets.first().ok_or_else(|| ScanError::NoTargets(cfg.input.clone()))?;
                    netdetect::detect_source_ipv4(probe)
                        .map_err(|e| ScanError::Config(format!("cannot determine source address: {e:#}")))?
                }
            };
            Ok(Arc::new(SynStrategy::open(source)?))
        }
        StrategyKind::Connect => Ok(Arc::new(ConnectStrategy::new(cfg.connect_timeout))),
    }
}

fn remove_stale_store(path: &std::path::Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "removed stale intermediate store");
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(ScanError::persist(path, e)),
    }
}

fn log_summary(outcome: &ScanOutcome, cfg: &ScanConfig) {
    let elapsed = Duration::from_millis(outcome.elapsed_ms);
    let rate = if outcome.elapsed_ms > 0 {
        outcome.probes_sent as f64 / elapsed.as_secs_f64()
    } else {
        0.0
    };
    info!(
        status = ?outcome.status,
        probes = outcome.probes_sent,
        open = outcome.open_findings,
        failures = outcome.send_failures,
        elapsed = %format_duration(elapsed),
        rate = format!("{rate:.0}/s"),
        output = %cfg.output.display(),
        "scan finished"
    );
}

/// `1h 2m 3s` style duration for operator logs.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
}

fn now_iso_like() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
