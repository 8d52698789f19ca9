use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::ratelimit::RateLimiter;
use crate::strategy::ScanStrategy;
use crate::targets::TargetSet;
use crate::types::Response;

/// Counters for one send batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SendReport {
    pub sent: u64,
    pub failed: u64,
    /// Probes skipped because the batch was cancelled
    pub skipped: u64,
}

/// Fans one port's probes out over the whole target set.
///
/// - Limits concurrent probes with a `Semaphore` (one owned permit per task).
/// - Paces transmissions through the shared `RateLimiter` when configured.
/// - Forwards answers observed by the probe itself into the response channel.
pub struct ProbeSender {
    strategy: Arc<dyn ScanStrategy>,
    sem: Arc<Semaphore>,
    rate: Option<Arc<RateLimiter>>,
    tap: mpsc::Sender<Response>,
}

impl ProbeSender {
    pub fn new(
        strategy: Arc<dyn ScanStrategy>,
        max_in_flight: usize,
        rate: Option<Arc<RateLimiter>>,
        tap: mpsc::Sender<Response>,
    ) -> Self {
        Self {
            strategy,
            sem: Arc::new(Semaphore::new(max_in_flight.max(1))),
            rate,
            tap,
        }
    }

    /// Probe every target at `port`. Never fails: per-target errors are
    /// logged and counted. Cancellation stops new probes; probes already in
    /// flight run to completion.
    pub async fn send_batch(
        &self,
        targets: &Arc<TargetSet>,
        port: u16,
        cancel: &CancellationToken,
    ) -> SendReport {
        let mut report = SendReport::default();
        let mut set = JoinSet::new();

        for (idx, ip) in targets.iter().enumerate() {
            if cancel.is_cancelled() {
                report.skipped = (targets.len() - idx) as u64;
                break;
            }
            let permit = tokio::select! {
                permit = self.sem.clone().acquire_owned() => match permit {
                    Ok(p) => p,
                    Err(_) => break,
                },
                _ = cancel.cancelled() => {
                    report.skipped = (targets.len() - idx) as u64;
                    break;
                }
            };
            if let Some(rate) = &self.rate {
                rate.acquire().await;
            }

            let strategy = self.strategy.clone();
            let tap = self.tap.clone();
            set.spawn(async move {
                let _permit = permit;
                probe_one(strategy.as_ref(), &tap, ip, port).await
            });

            // Reap finished tasks so the set does not grow with the target count.
            while let Some(done) = set.try_join_next() {
                tally(&mut report, done);
            }
        }

        while let Some(done) = set.join_next().await {
            tally(&mut report, done);
        }
        report
    }
}

async fn probe_one(
    strategy: &dyn ScanStrategy,
    tap: &mpsc::Sender<Response>,
    ip: Ipv4Addr,
    port: u16,
) -> bool {
    match strategy.probe(ip, port).await {
        Ok(Some(response)) => {
            if tap.send(response).await.is_err() {
                warn!(%ip, port, "response channel closed; finding dropped");
            }
            true
        }
        Ok(None) => true,
        Err(e) => {
            debug!(%ip, port, error = %e, "probe failed");
            false
        }
    }
}

fn tally(report: &mut SendReport, done: Result<bool, tokio::task::JoinError>) {
    match done {
        Ok(true) => report.sent += 1,
        Ok(false) => report.failed += 1,
        Err(e) => {
            warn!(error = %e, "probe task aborted");
            report.failed += 1;
        }
    }
}
