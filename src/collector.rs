//! Response correlation: attributes SYN+ACK responses to the port batch that
//! is currently active and forwards the findings to the result sink.
//!
//! The collector only knows the *current* port. A response for any other port
//! is a late answer to an earlier batch (or noise) and is discarded; it is
//! counted so that operators can see how many answers missed their window.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::error::{Result, ScanError};
use crate::sink::SinkHandle;
use crate::targets::TargetSet;
use crate::types::{OpenPortRecord, PortReport, Response};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorPhase {
    Idle,
    Listening(u16),
    Draining(u16),
}

/// Counters accumulated over the collector's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CollectorStats {
    pub findings: u64,
    pub late: u64,
    pub noise: u64,
    pub duplicates: u64,
}

enum Control {
    Listen(u16, oneshot::Sender<()>),
    Drain(oneshot::Sender<Result<PortReport>>),
}

pub struct ResponseCollector {
    control: mpsc::Sender<Control>,
    phase: watch::Receiver<CollectorPhase>,
    task: JoinHandle<CollectorStats>,
}

impl ResponseCollector {
    /// Spawn the collector task over the response channel.
    pub fn spawn(
        responses: mpsc::Receiver<Response>,
        sink: SinkHandle,
        targets: Arc<TargetSet>,
    ) -> Self {
        let (control, control_rx) = mpsc::channel(4);
        let (phase_tx, phase) = watch::channel(CollectorPhase::Idle);
        let worker = Worker {
            responses,
            control: control_rx,
            phase: phase_tx,
            sink,
            targets,
            active: None,
            stats: CollectorStats::default(),
        };
        let task = tokio::spawn(worker.run());
        Self {
            control,
            phase,
            task,
        }
    }

    pub fn phase(&self) -> CollectorPhase {
        *self.phase.borrow()
    }

    /// Enter Listening for `port`. Returns once the collector has switched.
    pub async fn listen(&self, port: u16) -> Result<()> {
        let (ack, done) = oneshot::channel();
        self.control
            .send(Control::Listen(port, ack))
            .await
            .map_err(|_| ScanError::Channel("collector stopped"))?;
        done.await.map_err(|_| ScanError::Channel("collector stopped"))
    }

    /// Drain the active port: every response already queued is processed and
    /// every finding handed to the sink before this returns.
    pub async fn drain(&self) -> Result<PortReport> {
        let (ack, done) = oneshot::channel();
        self.control
            .send(Control::Drain(ack))
            .await
            .map_err(|_| ScanError::Channel("collector stopped"))?;
        done.await.map_err(|_| ScanError::Channel("collector stopped"))?
    }

    /// Stop the collector. Call after every response producer has dropped its
    /// sender; responses still queued are discarded.
    pub async fn shutdown(self) -> CollectorStats {
        drop(self.control);
        match self.task.await {
            Ok(stats) => stats,
            Err(e) => {
                debug!(error = %e, "collector task ended abnormally");
                CollectorStats::default()
            }
        }
    }
}

struct Batch {
    port: u16,
    seen: HashSet<Ipv4Addr>,
    report: PortReport,
    started: Instant,
}

struct Worker {
    responses: mpsc::Receiver<Response>,
    control: mpsc::Receiver<Control>,
    phase: watch::Sender<CollectorPhase>,
    sink: SinkHandle,
    targets: Arc<TargetSet>,
    active: Option<Batch>,
    stats: CollectorStats,
}

impl Worker {
    async fn run(mut self) -> CollectorStats {
        let mut responses_open = true;
        loop {
            tokio::select! {
                ctl = self.control.recv() => match ctl {
                    Some(Control::Listen(port, ack)) => {
                        self.begin(port);
                        let _ = ack.send(());
                    }
                    Some(Control::Drain(ack)) => {
                        let report = self.drain().await;
                        let _ = ack.send(report);
                    }
                    None => break,
                },
                resp = self.responses.recv(), if responses_open => match resp {
                    Some(resp) => {
                        if let Err(e) = self.handle(resp).await {
                            debug!(error = %e, "finding could not be handed to sink");
                        }
                    }
                    None => responses_open = false,
                },
            }
        }
        self.phase.send_replace(CollectorPhase::Idle);
        self.stats
    }

    fn begin(&mut self, port: u16) {
        if let Some(stale) = self.active.take() {
            debug!(port = stale.port, "listen requested before previous port drained");
        }
        self.active = Some(Batch {
            port,
            seen: HashSet::new(),
            report: PortReport {
                port,
                ..PortReport::default()
            },
            started: Instant::now(),
        });
        self.phase.send_replace(CollectorPhase::Listening(port));
    }

    async fn drain(&mut self) -> Result<PortReport> {
        let Some(port) = self.active.as_ref().map(|b| b.port) else {
            return Err(ScanError::Channel("drain requested while idle"));
        };
        self.phase.send_replace(CollectorPhase::Draining(port));

        let mut result = Ok(());
        while let Ok(resp) = self.responses.try_recv() {
            if let Err(e) = self.handle(resp).await {
                result = Err(e);
            }
        }

        let batch = self.active.take();
        self.phase.send_replace(CollectorPhase::Idle);
        result?;
        let Some(batch) = batch else {
            return Err(ScanError::Channel("active batch vanished during drain"));
        };
        let mut report = batch.report;
        report.elapsed_ms = batch.started.elapsed().as_millis() as u64;
        Ok(report)
    }

    async fn handle(&mut self, resp: Response) -> Result<()> {
        if !self.targets.contains(&resp.ip) {
            self.stats.noise += 1;
            if let Some(b) = self.active.as_mut() {
                b.report.noise += 1;
            }
            return Ok(());
        }
        let Some(batch) = self.active.as_mut() else {
            trace!(ip = %resp.ip, port = resp.port, "response while idle");
            self.stats.late += 1;
            return Ok(());
        };
        if resp.port != batch.port {
            trace!(ip = %resp.ip, port = resp.port, active = batch.port, "late response discarded");
            batch.report.late += 1;
            self.stats.late += 1;
            return Ok(());
        }
        if !batch.seen.insert(resp.ip) {
            self.stats.duplicates += 1;
            return Ok(());
        }
        batch.report.open += 1;
        self.stats.findings += 1;
        let record = OpenPortRecord {
            ip: resp.ip,
            port: batch.port,
        };
        self.sink.record(record).await
    }
}
