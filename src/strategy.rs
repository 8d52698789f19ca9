//! Probe mechanisms behind one orchestration loop.
//!
//! A strategy sends probes and, where the mechanism has one, runs a listener
//! that turns inbound traffic into [`Response`]s on the shared response
//! channel. Strategies that learn the answer from the probe itself (connect
//! scan) return it from [`ScanStrategy::probe`] instead.

use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::StrategyKind;
use crate::error::{Result, ScanError};
use crate::packet;
use crate::transport::{self, RawReceiver, RawSender, TransmitQueue, TRANSMIT_QUEUE};
use crate::types::Response;

/// How often the listener thread wakes to check for a stop request.
pub const LISTENER_POLL: Duration = Duration::from_millis(50);

#[async_trait]
pub trait ScanStrategy: Send + Sync + 'static {
    fn kind(&self) -> StrategyKind;

    /// Start the response listener, if this strategy has one. The listener
    /// forwards responses into `tap` until `stop` is cancelled.
    fn start_listener(
        &self,
        tap: mpsc::Sender<Response>,
        stop: CancellationToken,
    ) -> Result<Option<ListenerHandle>>;

    /// Send one probe. `Ok(Some(_))` when the probe itself observed an open
    /// port; `Ok(None)` when the answer (if any) arrives via the listener.
    async fn probe(&self, target: Ipv4Addr, port: u16) -> Result<Option<Response>>;
}

/// Owns the listener thread and the receive resource it holds.
pub struct ListenerHandle {
    stop: CancellationToken,
    task: JoinHandle<ListenerStats>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerStats {
    pub packets: u64,
    pub syn_acks: u64,
    pub recv_errors: u64,
}

impl ListenerHandle {
    /// Signal the listener and wait up to `grace` for it to release the
    /// receive resource.
    pub async fn stop(self, grace: Duration) -> Option<ListenerStats> {
        self.stop.cancel();
        match time::timeout(grace, self.task).await {
            Ok(Ok(stats)) => {
                debug!(?stats, "response listener stopped");
                Some(stats)
            }
            Ok(Err(e)) => {
                warn!(error = %e, "response listener task failed");
                None
            }
            Err(_) => {
                warn!(grace_ms = grace.as_millis() as u64, "response listener did not stop within grace period");
                None
            }
        }
    }
}

/// Spawn the blocking receive loop over `rx`. The receiver is dropped (and the
/// socket closed) when the loop exits.
pub fn spawn_listener(
    mut rx: Box<dyn RawReceiver>,
    tap: mpsc::Sender<Response>,
    stop: CancellationToken,
) -> ListenerHandle {
    let token = stop.clone();
    let task = tokio::task::spawn_blocking(move || {
        let mut stats = ListenerStats::default();
        while !token.is_cancelled() {
            let bytes = match rx.recv_packet(LISTENER_POLL) {
                Ok(Some(bytes)) => bytes,
                Ok(None) => continue,
                Err(e) => {
                    stats.recv_errors += 1;
                    debug!(error = %e, "raw receive failed");
                    std::thread::sleep(Duration::from_millis(1));
                    continue;
                }
            };
            stats.packets += 1;
            let Some(reply) = packet::parse_syn_ack(&bytes) else {
                continue;
            };
            stats.syn_acks += 1;
            let response = Response {
                ip: reply.src_ip,
                port: reply.src_port,
            };
            if tap.blocking_send(response).is_err() {
                break;
            }
        }
        drop(rx);
        stats
    });
    ListenerHandle { stop, task }
}

/// Half-open SYN scan over a raw Layer-3 channel.
pub struct SynStrategy {
    source: Ipv4Addr,
    tx: TransmitQueue,
    rx: std::sync::Mutex<Option<Box<dyn RawReceiver>>>,
}

impl SynStrategy {
    /// Open the privileged raw channel.
    pub fn open(source: Ipv4Addr) -> Result<Self> {
        let (tx, rx) = transport::open_raw_channel()?;
        info!(%source, "raw packet channel opened");
        Self::with_transport(source, tx, rx)
    }

    /// Build over an existing transport (used by simulations). Starts the
    /// transmit thread.
    pub fn with_transport(source: Ipv4Addr, tx: Box<dyn RawSender>, rx: Box<dyn RawReceiver>) -> Result<Self> {
        let tx = TransmitQueue::spawn(tx, TRANSMIT_QUEUE).map_err(|e| {
            warn!(error = %e, "could not start transmit thread");
            ScanError::Channel("transmit thread could not start")
        })?;
        Ok(Self {
            source,
            tx,
            rx: std::sync::Mutex::new(Some(rx)),
        })
    }
}

#[async_trait]
impl ScanStrategy for SynStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Syn
    }

    fn start_listener(
        &self,
        tap: mpsc::Sender<Response>,
        stop: CancellationToken,
    ) -> Result<Option<ListenerHandle>> {
        let rx = self
            .rx
            .lock()
            .map_err(|_| ScanError::Channel("receive handle poisoned"))?
            .take()
            .ok_or(ScanError::Channel("response listener already started"))?;
        Ok(Some(spawn_listener(rx, tap, stop)))
    }

    async fn probe(&self, target: Ipv4Addr, port: u16) -> Result<Option<Response>> {
        let packet = packet::build_syn(
            self.source.into(),
            target.into(),
            port,
            packet::random_source_port(),
        )?;
        self.tx.send(packet.to_vec(), target).await.map_err(ScanError::Send)?;
        Ok(None)
    }
}

/// Full three-way handshake through the platform socket API.
pub struct ConnectStrategy {
    timeout: Duration,
}

impl ConnectStrategy {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ScanStrategy for ConnectStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Connect
    }

    fn start_listener(
        &self,
        _tap: mpsc::Sender<Response>,
        _stop: CancellationToken,
    ) -> Result<Option<ListenerHandle>> {
        Ok(None)
    }

    async fn probe(&self, target: Ipv4Addr, port: u16) -> Result<Option<Response>> {
        let addr = SocketAddr::from((target, port));
        match time::timeout(self.timeout, TcpStream::connect(addr)).await {
            Ok(Ok(_stream)) => Ok(Some(Response { ip: target, port })),
            Ok(Err(e)) if is_closed(&e) => Ok(None),
            Ok(Err(e)) => Err(ScanError::Send(e)),
            // filtered or unreachable within the timeout
            Err(_elapsed) => Ok(None),
        }
    }
}

fn is_closed(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::TimedOut
    )
}
